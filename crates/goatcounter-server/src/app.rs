use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{routes, state::AppState};

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// `/count` and the API get their own request timeouts from the config;
/// `/status` has none so it stays reachable while the database is slow.
/// CORS is permissive since the counter is loaded from third-party pages.
pub fn build_app(state: Arc<AppState>) -> Router {
    let counter = Router::new()
        .route(
            "/count",
            get(routes::count::count).post(routes::count::count),
        )
        .layer(TimeoutLayer::new(state.config.count_timeout));

    let api = Router::new()
        .route("/api/v0/count", post(routes::api::count))
        .route("/api/v0/me", get(routes::api::me))
        .layer(TimeoutLayer::new(state.config.api_timeout));

    Router::new()
        .route("/status", get(routes::status::status))
        .route("/status/sessions", get(routes::status::sessions))
        .merge(counter)
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
