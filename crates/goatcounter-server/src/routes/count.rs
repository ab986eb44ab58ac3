use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;

use goatcounter_core::config::RateLimitClass;
use goatcounter_core::hit::{validate_bot, Hit, Size, MAX_PATH_LEN};
use goatcounter_core::site::Collect;

use crate::{bot_detection, error::AppError, geo, state::AppState};

/// 1×1 transparent GIF.
pub const TRANSPARENT_GIF: &[u8] = &[
    71, 73, 70, 56, 57, 97, 1, 0, 1, 0, 128, 0, 0, 0, 0, 0, 255, 255, 255, 33, 249, 4, 1, 0, 0, 0,
    0, 44, 0, 0, 0, 0, 1, 0, 1, 0, 0, 2, 2, 68, 1, 0, 59,
];

/// The peer address, when the server was started with connect info.
pub struct MaybeConnectInfo(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeConnectInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

/// Client address: the right-most public entry of `X-Forwarded-For`, falling
/// back to the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.rsplit(',')
                .filter_map(|part| part.trim().parse::<IpAddr>().ok())
                .find(|ip| is_public(*ip))
        });
    forwarded
        .or_else(|| peer.map(|p| p.ip()))
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: impl axum::http::header::AsHeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Query parameters of `/count`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CountParams {
    pub p: Option<String>,
    pub t: String,
    pub e: String,
    pub r: String,
    pub s: String,
    pub q: String,
    pub b: String,
}

/// Validated `/count` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCount {
    pub path: String,
    pub title: String,
    pub event: bool,
    pub referrer: String,
    pub size: Option<Size>,
    pub query: String,
    pub bot: u8,
}

impl CountParams {
    pub fn parse(&self) -> Result<ParsedCount, AppError> {
        let path = self
            .p
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| AppError::BadRequest("p: missing".into()))?;
        if path.len() > MAX_PATH_LEN {
            return Err(AppError::UriTooLong);
        }
        let size = Size::parse(&self.s).map_err(|e| AppError::BadRequest(format!("s: {e}")))?;
        let bot = match self.b.trim() {
            "" => 0,
            b => {
                let n: i64 = b
                    .parse()
                    .map_err(|_| AppError::BadRequest(format!("b: not a number: {b:?}")))?;
                validate_bot(n).map_err(|e| AppError::BadRequest(format!("b: {e}")))?
            }
        };
        Ok(ParsedCount {
            path: path.to_string(),
            title: self.t.clone(),
            event: matches!(self.e.as_str(), "true" | "1" | "on"),
            referrer: self.r.clone(),
            size,
            query: self.q.clone(),
            bot,
        })
    }
}

/// The GIF with the headers every `/count` response carries.
pub fn gif_response(status: StatusCode) -> Response {
    let mut response = (status, TRANSPARENT_GIF).into_response();
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/gif"));
    h.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    h.insert(
        "cross-origin-resource-policy",
        HeaderValue::from_static("cross-origin"),
    );
    h.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache"),
    );
    h.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

/// The GIF with `err`'s status and the reason in `X-Goatcounter`. Beacons
/// are loaded as images, so a rejection still has to be one.
pub fn gif_rejection(err: &AppError) -> Response {
    let mut response = gif_response(err.status());
    if let Ok(v) = HeaderValue::from_str(&err.to_string()) {
        response.headers_mut().insert("x-goatcounter", v);
    }
    response
}

/// `GET/POST /count`: record a single pageview or event.
///
/// Returns the GIF with 200 on success or prefetch, 202 when the client IP is
/// on the site's ignore list, 400 on bad parameters and 414 on an overlong
/// path.
#[tracing::instrument(skip_all)]
pub async fn count(
    State(state): State<Arc<AppState>>,
    MaybeConnectInfo(peer): MaybeConnectInfo,
    headers: HeaderMap,
    Query(params): Query<CountParams>,
) -> Result<Response, AppError> {
    let ip = client_ip(&headers, peer);
    let ua = header_str(&headers, header::USER_AGENT).to_string();
    state.check_rate_limit(RateLimitClass::Count, &format!("{ip}|{ua}"))?;

    if bot_detection::is_prefetch(&headers) {
        return Ok(gif_response(StatusCode::OK));
    }

    let host = header_str(&headers, header::HOST);
    let site = state
        .site_for_host(host)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no site at {host:?}")))?;

    if let Some(entry) = site.settings.ignored_ip(&ip) {
        tracing::debug!(site_id = site.id, entry, "ignored IP");
        let mut response = gif_response(StatusCode::ACCEPTED);
        response
            .headers_mut()
            .insert("x-goatcounter", HeaderValue::from_static("ignored IP"));
        return Ok(response);
    }

    let parsed = match params.parse() {
        Ok(p) => p,
        Err(e) => return Ok(gif_rejection(&e)),
    };
    let collect = site.settings.collect;

    let location = if collect.has(Collect::LOCATION) {
        state.geo.lookup(&ip)
    } else {
        String::new()
    };
    let language = if collect.has(Collect::LANGUAGE) {
        geo::language(header_str(&headers, header::ACCEPT_LANGUAGE))
    } else {
        None
    };

    let hit = Hit {
        title: parsed.title,
        event: parsed.event,
        referrer: parsed.referrer,
        size: parsed.size,
        query: parsed.query,
        bot: bot_detection::classify(&headers, &ua, parsed.bot),
        location,
        language,
        ua_header: ua,
        remote_addr: ip,
        ..Hit::new(site.id, parsed.path, Utc::now())
    };
    state.memstore.append([hit]);

    Ok(gif_response(StatusCode::OK))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(p: &str, s: &str, b: &str) -> CountParams {
        CountParams {
            p: Some(p.to_string()),
            s: s.to_string(),
            b: b.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn gif_is_43_bytes() {
        assert_eq!(TRANSPARENT_GIF.len(), 43);
        assert_eq!(&TRANSPARENT_GIF[0..6], b"GIF89a");
    }

    #[test]
    fn forwarded_for_skips_private_hops() {
        let mut h = HeaderMap::new();
        h.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 198.51.100.10, 10.0.0.1"),
        );
        assert_eq!(client_ip(&h, None), "198.51.100.10");

        let peer: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "192.0.2.1");
        assert_eq!(client_ip(&HeaderMap::new(), None), "");
    }

    #[test]
    fn parse_params() {
        let p = params("/x", "1920,1080,2", "150").parse().unwrap();
        assert_eq!(p.bot, 150);
        assert_eq!(p.size.map(|s| s.width), Some(1920.0));

        assert!(matches!(
            CountParams::default().parse(),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            params("/x", "", "149").parse(),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            params("/x", "wide", "").parse(),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            params(&"a".repeat(MAX_PATH_LEN + 1), "", "").parse(),
            Err(AppError::UriTooLong)
        ));
    }
}
