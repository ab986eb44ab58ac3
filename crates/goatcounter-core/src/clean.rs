//! Canonical forms for paths, referrers and campaigns.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;

/// Where a referrer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RefScheme {
    /// Anything that isn't an HTTP URL, including the empty ref.
    #[serde(rename = "o")]
    Other,
    #[serde(rename = "h")]
    Http,
    /// Taken from a campaign parameter such as `utm_source`.
    #[serde(rename = "c")]
    Campaign,
}

impl RefScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefScheme::Other => "o",
            RefScheme::Http => "h",
            RefScheme::Campaign => "c",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "o" => Some(RefScheme::Other),
            "h" => Some(RefScheme::Http),
            "c" => Some(RefScheme::Campaign),
            _ => None,
        }
    }
}

impl fmt::Display for RefScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The row ID reserved for the empty ref.
pub const EMPTY_REF_ID: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CleanRef {
    pub referrer: String,
    pub scheme: RefScheme,
}

impl CleanRef {
    pub fn empty() -> Self {
        Self {
            referrer: String::new(),
            scheme: RefScheme::Other,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.referrer.is_empty()
    }
}

const CAMPAIGN_REF_PARAMS: &[&str] = &["utm_source", "ref", "src", "source"];
const CAMPAIGN_NAME_PARAMS: &[&str] = &["utm_campaign", "campaign"];

/// Tracking parameters removed from paths and referrers.
fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || matches!(key, "fbclid" | "gclid" | "msclkid" | "mc_eid")
}

/// Hosts that are different spellings of the same site.
const HOST_ALIASES: &[(&str, &str)] = &[
    ("m.facebook.com", "facebook.com"),
    ("l.facebook.com", "facebook.com"),
    ("lm.facebook.com", "facebook.com"),
    ("old.reddit.com", "reddit.com"),
    ("np.reddit.com", "reddit.com"),
    ("i.reddit.com", "reddit.com"),
    ("out.reddit.com", "reddit.com"),
    ("mobile.twitter.com", "twitter.com"),
    ("t.co", "twitter.com"),
];

fn query_pairs(query: &str) -> impl Iterator<Item = (String, String)> + '_ {
    url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
}

fn first_param(query: &str, keys: &[&str]) -> Option<String> {
    let pairs: Vec<(String, String)> = query_pairs(query).collect();
    keys.iter().find_map(|key| {
        pairs
            .iter()
            .find(|(k, v)| k == key && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
    })
}

fn strip_tracking(query: &str) -> String {
    let kept: Vec<(String, String)> = query_pairs(query)
        .filter(|(k, _)| !is_tracking_param(k))
        .collect();
    if kept.is_empty() {
        return String::new();
    }
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(kept)
        .finish()
}

/// Canonical path: events are kept as-is, paths get a leading `/` and lose
/// tracking parameters.
pub fn clean_path(path: &str, event: bool) -> String {
    let path = path.trim();
    if event {
        return path.to_string();
    }
    let (base, query) = match path.split_once('?') {
        Some((b, q)) => (b, strip_tracking(q)),
        None => (path, String::new()),
    };
    let mut out = String::with_capacity(path.len() + 1);
    if !base.starts_with('/') {
        out.push('/');
    }
    out.push_str(base);
    if !query.is_empty() {
        out.push('?');
        out.push_str(&query);
    }
    out
}

/// Campaign name from `utm_campaign` or `campaign` in the extra query.
pub fn campaign_name(query: &str) -> Option<String> {
    first_param(query, CAMPAIGN_NAME_PARAMS)
}

/// Canonicalise a referrer.
///
/// A campaign source in `query` wins over the `Referer`. HTTP URLs lose their
/// scheme, a leading `www.`, tracking parameters and a trailing slash.
/// Refs with a newline or carriage return are rejected outright.
pub fn clean_ref(raw: &str, query: &str) -> Result<CleanRef, CoreError> {
    if raw.contains(['\n', '\r']) {
        return Err(CoreError::InvalidRef);
    }
    if let Some(source) = first_param(query, CAMPAIGN_REF_PARAMS) {
        if source.contains(['\n', '\r']) {
            return Err(CoreError::InvalidRef);
        }
        return Ok(CleanRef {
            referrer: source,
            scheme: RefScheme::Campaign,
        });
    }

    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(CleanRef::empty());
    }

    let url = match Url::parse(raw) {
        Ok(u) if matches!(u.scheme(), "http" | "https") && u.host_str().is_some() => u,
        _ => {
            return Ok(CleanRef {
                referrer: raw.to_string(),
                scheme: RefScheme::Other,
            })
        }
    };

    let host = url.host_str().unwrap_or_default().to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let host = HOST_ALIASES
        .iter()
        .find(|(from, _)| *from == host)
        .map(|(_, to)| *to)
        .unwrap_or(host);
    let host = match host.strip_suffix(".m.wikipedia.org") {
        Some(lang) => format!("{lang}.wikipedia.org"),
        None => host.to_string(),
    };

    let mut out = host;
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(url.path());
    let query = url.query().map(strip_tracking).unwrap_or_default();
    if !query.is_empty() {
        out.push('?');
        out.push_str(&query);
    }
    let out = out.trim_end_matches('/').to_string();

    Ok(CleanRef {
        referrer: out,
        scheme: RefScheme::Http,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_get_leading_slash() {
        assert_eq!(clean_path("a/b", false), "/a/b");
        assert_eq!(clean_path("/a/b", false), "/a/b");
        assert_eq!(clean_path("  /x ", false), "/x");
        assert_eq!(clean_path("signup-click", true), "signup-click");
    }

    #[test]
    fn paths_lose_tracking_params() {
        assert_eq!(clean_path("/a?utm_source=x&page=2", false), "/a?page=2");
        assert_eq!(clean_path("/a?fbclid=123", false), "/a");
    }

    #[test]
    fn http_refs_are_trimmed() {
        let r = clean_ref("https://www.example.com/page/", "").unwrap();
        assert_eq!(r.referrer, "example.com/page");
        assert_eq!(r.scheme, RefScheme::Http);

        let r = clean_ref("https://news.ycombinator.com/item?id=1&utm_medium=x", "").unwrap();
        assert_eq!(r.referrer, "news.ycombinator.com/item?id=1");

        let r = clean_ref("https://old.reddit.com/r/rust/", "").unwrap();
        assert_eq!(r.referrer, "reddit.com/r/rust");

        let r = clean_ref("https://en.m.wikipedia.org/wiki/Goat", "").unwrap();
        assert_eq!(r.referrer, "en.wikipedia.org/wiki/Goat");
    }

    #[test]
    fn non_http_refs_are_other() {
        let r = clean_ref("android-app://com.example", "").unwrap();
        assert_eq!(r.scheme, RefScheme::Other);
        assert_eq!(r.referrer, "android-app://com.example");

        let r = clean_ref("  newsletter ", "").unwrap();
        assert_eq!(r.referrer, "newsletter");
        assert_eq!(r.scheme, RefScheme::Other);
    }

    #[test]
    fn empty_ref() {
        assert_eq!(clean_ref("", "").unwrap(), CleanRef::empty());
        assert_eq!(clean_ref("   ", "").unwrap(), CleanRef::empty());
    }

    #[test]
    fn campaign_params_win() {
        let r = clean_ref("https://example.com", "?utm_source=newsletter&utm_campaign=spring").unwrap();
        assert_eq!(r.referrer, "newsletter");
        assert_eq!(r.scheme, RefScheme::Campaign);

        let r = clean_ref("", "ref=producthunt").unwrap();
        assert_eq!(r.scheme, RefScheme::Campaign);
        assert_eq!(campaign_name("?utm_campaign=spring"), Some("spring".to_string()));
        assert_eq!(campaign_name("?campaign=x&utm_campaign="), Some("x".to_string()));
        assert_eq!(campaign_name(""), None);
    }

    #[test]
    fn newlines_are_rejected() {
        assert!(clean_ref("https://example.com/\nfoo", "").is_err());
        assert!(clean_ref("a\rb", "").is_err());
    }

    #[test]
    fn scheme_round_trip() {
        for s in [RefScheme::Other, RefScheme::Http, RefScheme::Campaign] {
            assert_eq!(RefScheme::parse(s.as_str()), Some(s));
        }
        assert_eq!(RefScheme::parse("x"), None);
    }
}
