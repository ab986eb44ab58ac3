use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt;

use goatcounter_core::config::{Config, RateLimits};
use goatcounter_core::session::Sessions;
use goatcounter_core::site::SiteSettings;
use goatcounter_core::store::Store;
use goatcounter_server::app::build_app;
use goatcounter_server::geo::Geo;
use goatcounter_server::state::AppState;
use goatcounter_store::SqliteStore;

const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0";

fn test_config() -> Config {
    Config {
        rate_limits: RateLimits::parse("count:1000/1").expect("ratelimit"),
        ..Config::default()
    }
}

async fn setup_with(
    config: Config,
    settings: SiteSettings,
) -> (Arc<SqliteStore>, Arc<AppState>, axum::Router) {
    let db = Arc::new(SqliteStore::open_in_memory().expect("in-memory SQLite"));
    db.create_site("example", Some("example.com"), &settings)
        .await
        .expect("create site");
    let state = Arc::new(AppState::with_sessions(
        db.clone(),
        config,
        Geo::disabled(),
        Sessions::with_seed(0, Utc::now()),
    ));
    let app = build_app(Arc::clone(&state));
    (db, state, app)
}

async fn setup() -> (Arc<SqliteStore>, Arc<AppState>, axum::Router) {
    setup_with(test_config(), SiteSettings::default()).await
}

fn count_request(query: &str, ip: &str, ua: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/count?{query}"))
        .header("host", "example.com")
        .header("x-forwarded-for", ip)
        .header("user-agent", ua)
        .body(Body::empty())
        .expect("request")
}

async fn body_bytes(response: axum::http::Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes()
        .to_vec()
}

// ===== BDD: /count answers with the tracking GIF =====

#[tokio::test]
async fn count_returns_gif_and_queues_hit() {
    let (_db, state, app) = setup().await;

    let response = app
        .oneshot(count_request("p=/hello&t=Hello&r=https://example.org/", "198.51.100.10", FIREFOX))
        .await
        .expect("request");

    assert_eq!(response.status(), StatusCode::OK);
    let h = response.headers();
    assert_eq!(h.get("content-type").unwrap(), "image/gif");
    assert_eq!(h.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(h.get("cross-origin-resource-policy").unwrap(), "cross-origin");
    assert_eq!(h.get("connection").unwrap(), "close");
    assert_eq!(body_bytes(response).await.len(), 43);
    assert_eq!(state.memstore.len(), 1);
}

#[tokio::test]
async fn post_count_is_accepted() {
    let (_db, state, app) = setup().await;
    let request = Request::builder()
        .method("POST")
        .uri("/count?p=/post")
        .header("host", "example.com")
        .header("user-agent", FIREFOX)
        .body(Body::empty())
        .expect("request");

    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.memstore.len(), 1);
}

// ===== BDD: path length is limited to 2048 bytes =====

#[tokio::test]
async fn path_of_2048_bytes_is_accepted_2049_is_too_long() {
    let (_db, state, app) = setup().await;

    let ok = format!("p=/{}", "a".repeat(2047));
    let response = app
        .clone()
        .oneshot(count_request(&ok, "198.51.100.10", FIREFOX))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);

    let long = format!("p=/{}", "a".repeat(2048));
    let response = app
        .oneshot(count_request(&long, "198.51.100.10", FIREFOX))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::URI_TOO_LONG);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/gif");
    assert_eq!(response.headers().get("x-goatcounter").unwrap(), "path too long");
    assert_eq!(body_bytes(response).await.len(), 43);
    assert_eq!(state.memstore.len(), 1);
}

#[tokio::test]
async fn missing_path_or_bad_size_is_rejected() {
    let (_db, state, app) = setup().await;

    for query in ["t=no-path", "p=/x&s=wide", "p=/x&s=1,2,3,4"] {
        let response = app
            .clone()
            .oneshot(count_request(query, "198.51.100.10", FIREFOX))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{query}");
        assert_eq!(response.headers().get("content-type").unwrap(), "image/gif");
        assert!(response.headers().contains_key("x-goatcounter"), "{query}");
        assert_eq!(body_bytes(response).await.len(), 43, "{query}");
    }
    assert!(state.memstore.is_empty());
}

// ===== BDD: the b parameter is 0 or at least 150 =====

#[tokio::test]
async fn bot_hint_boundaries() {
    let (_db, state, app) = setup().await;

    let response = app
        .clone()
        .oneshot(count_request("p=/x&b=149", "198.51.100.10", FIREFOX))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let reason = response.headers().get("x-goatcounter").unwrap().to_str().unwrap();
    assert!(reason.starts_with("b: "), "{reason}");
    assert_eq!(body_bytes(response).await.len(), 43);

    for b in ["0", "150"] {
        let response = app
            .clone()
            .oneshot(count_request(&format!("p=/x&b={b}"), "198.51.100.10", FIREFOX))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK, "b={b}");
    }
    assert_eq!(state.memstore.len(), 2);

    let persisted = state.cron.persist_and_stat().await.expect("persist");
    assert_eq!(persisted, 2);
}

// ===== BDD: ignored IPs get 202 and nothing is stored =====

#[tokio::test]
async fn ignored_ip_gets_202() {
    let settings = SiteSettings {
        ignore_ips: vec!["1.1.1.1".into(), "203.0.113.0/24".into()],
        ..SiteSettings::default()
    };
    let (_db, state, app) = setup_with(test_config(), settings).await;

    for ip in ["1.1.1.1", "203.0.113.99"] {
        let response = app
            .clone()
            .oneshot(count_request("p=/a", ip, FIREFOX))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::ACCEPTED, "{ip}");
        assert!(response.headers().contains_key("x-goatcounter"));
    }
    assert!(state.memstore.is_empty());
}

// ===== BDD: prefetches are answered but not recorded =====

#[tokio::test]
async fn prefetch_is_not_recorded() {
    let (_db, state, app) = setup().await;
    let request = Request::builder()
        .uri("/count?p=/a")
        .header("host", "example.com")
        .header("user-agent", FIREFOX)
        .header("sec-purpose", "prefetch")
        .body(Body::empty())
        .expect("request");

    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.memstore.is_empty());
}

#[tokio::test]
async fn unknown_host_is_404() {
    let (_db, state, app) = setup().await;
    let request = Request::builder()
        .uri("/count?p=/a")
        .header("host", "nope.example.net")
        .body(Body::empty())
        .expect("request");

    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(state.memstore.is_empty());
}

#[tokio::test]
async fn site_code_subdomain_of_serve_domain() {
    let (_db, state, app) = setup().await;
    let request = Request::builder()
        .uri("/count?p=/a")
        .header("host", "example.localhost:8081")
        .header("user-agent", FIREFOX)
        .body(Body::empty())
        .expect("request");

    let response = app.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.memstore.len(), 1);
}

// ===== BDD: /count is rate limited per IP and User-Agent =====

#[tokio::test]
async fn fifth_request_in_a_second_is_rate_limited() {
    let (_db, _state, app) = setup_with(Config::default(), SiteSettings::default()).await;

    for _ in 0..4 {
        let response = app
            .clone()
            .oneshot(count_request("p=/a", "198.51.100.10", FIREFOX))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app
        .clone()
        .oneshot(count_request("p=/a", "198.51.100.10", FIREFOX))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let h = response.headers();
    assert_eq!(h.get("x-rate-limit-limit").unwrap(), "4");
    assert_eq!(h.get("x-rate-limit-remaining").unwrap(), "0");
    assert!(h.contains_key("x-rate-limit-reset"));
    assert!(h.contains_key("retry-after"));

    // A different client has its own bucket.
    let response = app
        .oneshot(count_request("p=/a", "198.51.100.11", FIREFOX))
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
}
