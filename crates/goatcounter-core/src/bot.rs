//! User-agent based bot classification.
//!
//! Values below 150 mean "not a bot"; everything from 150 up is a bot, with
//! higher values taking precedence when several checks disagree.

/// Classification stored in `hits.bot` and `user_agents.isbot`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Bot {
    #[default]
    None = 0,
    /// Browser prefetch; never recorded.
    Prefetch = 150,
    /// Crawler reported by the User-Agent parser without a signature match.
    KnownBot = 153,
    /// Generic "bot", "spider" or "crawler" markers and headless browsers.
    Boty = 154,
    /// UA matches a known crawler or HTTP client signature, or is too short
    /// to come from a browser.
    Short = 155,
}

impl Bot {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

pub fn is_bot(value: u8) -> bool {
    value >= Bot::Prefetch.as_u8()
}

/// Browsers always send something longer than this.
const MIN_BROWSER_UA: usize = 10;

const SIGNATURES: &[&str] = &[
    "googlebot",
    "bingbot",
    "duckduckbot",
    "yandexbot",
    "baiduspider",
    "ahrefsbot",
    "semrushbot",
    "mj12bot",
    "applebot",
    "petalbot",
    "facebookexternalhit",
    "curl/",
    "wget/",
    "python-requests",
    "python-urllib",
    "go-http-client",
    "libwww-perl",
    "okhttp",
    "java/",
    "httpclient",
];

const BOTY: &[&str] = &["bot", "spider", "crawler", "headlesschrome", "phantomjs"];

/// Classify a `User-Agent` header. An empty header is not treated as a bot;
/// there is nothing to go on.
pub fn classify_user_agent(ua: &str) -> Bot {
    let ua = ua.trim();
    if ua.is_empty() {
        return Bot::None;
    }
    if ua.len() < MIN_BROWSER_UA {
        return Bot::Short;
    }
    let lower = ua.to_ascii_lowercase();
    if SIGNATURES.iter().any(|s| lower.contains(s)) {
        return Bot::Short;
    }
    if BOTY.iter().any(|s| lower.contains(s)) {
        return Bot::Boty;
    }
    Bot::None
}

/// Combine a stored or client-supplied value with server-side detection.
///
/// This is the only rule used to merge bot values: whatever the server
/// detected (the highest of `detected`) replaces `current`, and `current` is
/// kept only when detection found nothing.
pub fn resolve(current: u8, detected: &[Bot]) -> u8 {
    let server = detected.iter().copied().max().unwrap_or(Bot::None);
    if server != Bot::None {
        server.as_u8()
    } else {
        current
    }
}
