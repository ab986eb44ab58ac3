//! Request-level bot checks layered on top of the User-Agent classifier.

use axum::http::HeaderMap;

use goatcounter_core::bot::{self, Bot};

/// Browsers announce speculative loads with one of these headers. Such
/// requests get a normal response but are never recorded.
pub fn is_prefetch(headers: &HeaderMap) -> bool {
    ["purpose", "sec-purpose", "x-moz", "x-purpose"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .any(|v| {
            let v = v.to_ascii_lowercase();
            v.contains("prefetch") || v.contains("preview")
        })
}

/// Final bot value for a hit: server-side checks on the request and the
/// User-Agent override a client-supplied hint when they find anything.
pub fn classify(headers: &HeaderMap, ua: &str, client_hint: u8) -> u8 {
    let mut detected = vec![bot::classify_user_agent(ua)];
    if is_prefetch(headers) {
        detected.push(Bot::Prefetch);
    }
    bot::resolve(client_hint, &detected)
}
