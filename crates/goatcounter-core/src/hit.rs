use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::session::SessionId;

/// Longest accepted path, in bytes.
pub const MAX_PATH_LEN: usize = 2048;

/// Client bot hints below this value (other than 0) are rejected; the range is
/// reserved for server-side classification.
pub const MIN_CLIENT_BOT: u8 = 150;

/// Screen size as sent by the client: width, height and device pixel ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
    pub scale: f64,
}

impl Size {
    /// Parse the `s` querystring value (`"w,h"` or `"w,h,scale"`).
    ///
    /// An empty string means "not sent" and yields `Ok(None)`.
    pub fn parse(raw: &str) -> Result<Option<Self>, CoreError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let nums = raw
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CoreError::InvalidSize(raw.to_string()))?;
        Self::from_slice(&nums).map_err(|_| CoreError::InvalidSize(raw.to_string()))
    }

    /// Build from the JSON array form used by the API (`[w, h, scale]`).
    pub fn from_slice(nums: &[f64]) -> Result<Option<Self>, CoreError> {
        if nums.is_empty() {
            return Ok(None);
        }
        if !(2..=3).contains(&nums.len()) || nums.iter().any(|n| !n.is_finite() || *n < 0.0) {
            return Err(CoreError::InvalidSize(format!("{nums:?}")));
        }
        Ok(Some(Self {
            width: nums[0],
            height: nums[1],
            scale: nums.get(2).copied().unwrap_or(1.0),
        }))
    }

    /// Width bucket used by `size_stats`.
    pub fn bucket(&self) -> i32 {
        width_bucket(self.width)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.width, self.height, self.scale)
    }
}

/// Group a screen width into phone (384), tablet (1024), desktop (1440) or
/// large display (1920). Zero means the width was unknown.
pub fn width_bucket(width: f64) -> i32 {
    match width {
        w if w <= 0.0 => 0,
        w if w <= 384.0 => 384,
        w if w <= 1024.0 => 1024,
        w if w <= 1440.0 => 1440,
        _ => 1920,
    }
}

/// A single pageview or event.
///
/// Handlers fill the raw request fields (`path`, `referrer`, `ua_header`,
/// `remote_addr`, ...). The Memstore resolves those into surrogate IDs and the
/// session before the hit is written; a hit with `path_id != 0` has been
/// fully resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: i64,
    pub site_id: i64,
    pub path_id: i64,
    pub ref_id: i64,
    pub user_agent_id: Option<i64>,
    pub browser_id: Option<i64>,
    pub system_id: Option<i64>,
    pub campaign_id: Option<i64>,
    pub session: Option<SessionId>,
    pub bot: u8,
    pub size: Option<Size>,
    /// ISO 3166-1 alpha-2, empty when unknown.
    pub location: String,
    /// ISO 639-3.
    pub language: Option<String>,
    pub first_visit: bool,
    pub created_at: DateTime<Utc>,

    pub path: String,
    pub title: String,
    pub event: bool,
    pub referrer: String,
    /// Extra querystring used for campaign parameters.
    pub query: String,
    pub ua_header: String,
    pub remote_addr: String,
    /// Client-provided grouping key; replaces the IP/UA fingerprint.
    pub client_session: Option<String>,
    pub no_sessions: bool,
}

impl Hit {
    pub fn new(site_id: i64, path: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            site_id,
            path: path.into(),
            created_at,
            ..Default::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.path_id != 0
    }
}

/// Request body for `POST /api/v0/count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCountRequest {
    #[serde(default)]
    pub no_sessions: bool,
    #[serde(default = "default_filter")]
    pub filter: Vec<String>,
    #[serde(default)]
    pub hits: Vec<ApiCountRequestHit>,
}

fn default_filter() -> Vec<String> {
    vec!["ip".to_string()]
}

impl ApiCountRequest {
    pub fn filters_ip(&self) -> bool {
        self.filter.iter().any(|f| f == "ip")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiCountRequestHit {
    pub path: String,
    pub title: String,
    pub event: bool,
    #[serde(rename = "ref")]
    pub referrer: String,
    pub size: Vec<f64>,
    pub query: String,
    pub bot: i64,
    pub user_agent: String,
    pub location: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub session: String,
}

impl ApiCountRequestHit {
    /// Check the fields that must be valid before the hit is queued.
    ///
    /// Returns the message reported for this hit's index.
    pub fn validate(&self, no_sessions: bool, now: DateTime<Utc>) -> Result<(), String> {
        if self.path.trim().is_empty() {
            return Err("path: must be set".to_string());
        }
        if self.path.len() > MAX_PATH_LEN {
            return Err(format!("path: longer than {MAX_PATH_LEN} bytes"));
        }
        validate_bot(self.bot).map_err(|e| format!("bot: {e}"))?;
        Size::from_slice(&self.size).map_err(|e| format!("size: {e}"))?;
        if let Some(created) = self.created_at {
            if created > now {
                return Err("created_at: in the future".to_string());
            }
        }
        if !no_sessions
            && self.session.is_empty()
            && (self.user_agent.is_empty() || self.ip.is_empty())
        {
            return Err(
                "session or user_agent and ip must be set; use no_sessions if this data isn't available"
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Accept 0 or anything in the JS-runtime hint range.
pub fn validate_bot(bot: i64) -> Result<u8, String> {
    match bot {
        0 => Ok(0),
        b if (i64::from(MIN_CLIENT_BOT)..=i64::from(u8::MAX)).contains(&b) => Ok(b as u8),
        b => Err(format!("wrong value: {b} (must be 0 or >= {MIN_CLIENT_BOT})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_parses_two_and_three_values() {
        let s = Size::parse("1920,1080,2").unwrap().unwrap();
        assert_eq!(s.width, 1920.0);
        assert_eq!(s.scale, 2.0);

        let s = Size::parse("800, 600").unwrap().unwrap();
        assert_eq!(s.scale, 1.0);

        assert_eq!(Size::parse("").unwrap(), None);
    }

    #[test]
    fn size_rejects_garbage() {
        assert!(Size::parse("abc").is_err());
        assert!(Size::parse("1,2,3,4").is_err());
        assert!(Size::parse("-1,2").is_err());
        assert!(Size::parse("100").is_err());
    }

    #[test]
    fn width_buckets() {
        assert_eq!(width_bucket(0.0), 0);
        assert_eq!(width_bucket(320.0), 384);
        assert_eq!(width_bucket(384.0), 384);
        assert_eq!(width_bucket(800.0), 1024);
        assert_eq!(width_bucket(1280.0), 1440);
        assert_eq!(width_bucket(1440.0), 1440);
        assert_eq!(width_bucket(2560.0), 1920);
    }

    #[test]
    fn bot_hint_range() {
        assert_eq!(validate_bot(0), Ok(0));
        assert!(validate_bot(1).is_err());
        assert!(validate_bot(149).is_err());
        assert_eq!(validate_bot(150), Ok(150));
        assert!(validate_bot(256).is_err());
        assert!(validate_bot(-1).is_err());
    }

    #[test]
    fn api_hit_needs_session_or_fingerprint() {
        let now = Utc::now();
        let mut hit = ApiCountRequestHit {
            path: "/x".into(),
            ..Default::default()
        };
        assert!(hit.validate(false, now).is_err());
        assert!(hit.validate(true, now).is_ok());

        hit.session = "a".into();
        assert!(hit.validate(false, now).is_ok());

        hit.session.clear();
        hit.user_agent = "Mozilla/5.0".into();
        hit.ip = "1.2.3.4".into();
        assert!(hit.validate(false, now).is_ok());
    }

    #[test]
    fn api_hit_rejects_future_and_empty_path() {
        let now = Utc::now();
        let hit = ApiCountRequestHit {
            path: "".into(),
            session: "a".into(),
            ..Default::default()
        };
        assert_eq!(hit.validate(false, now), Err("path: must be set".to_string()));

        let hit = ApiCountRequestHit {
            path: "/x".into(),
            session: "a".into(),
            created_at: Some(now + chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(hit.validate(false, now).is_err());
    }

    #[test]
    fn request_defaults_to_ip_filter() {
        let req: ApiCountRequest = serde_json::from_str(r#"{"hits":[{"path":"/a"}]}"#).unwrap();
        assert!(req.filters_ip());
        assert!(!req.no_sessions);

        let req: ApiCountRequest = serde_json::from_str(r#"{"filter":[],"hits":[]}"#).unwrap();
        assert!(!req.filters_ip());
    }
}
