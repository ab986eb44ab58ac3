use crate::bot::{self, Bot};

/// Browser and OS extracted from a `User-Agent` header. Unknown parts are
/// empty strings, which is also how they are stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserAgentInfo {
    pub browser: String,
    pub browser_version: String,
    pub system: String,
    pub system_version: String,
    pub bot: Bot,
}

/// Tokens that carry no information for grouping, and their replacement.
const NOISE: &[(&str, &str)] = &[
    ("Mozilla/5.0 ", "~"),
    (" (KHTML, like Gecko)", ""),
    (" like Gecko", ""),
    ("; Win64; x64", ""),
    ("; WOW64", ""),
];

/// Shorter form of the header used as the dedup key for `user_agents`.
pub fn shorten(ua: &str) -> String {
    let mut s = ua.trim().to_string();
    for (from, to) in NOISE {
        s = s.replace(from, to);
    }
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn parse(ua: &str) -> UserAgentInfo {
    let mut info = UserAgentInfo {
        bot: bot::classify_user_agent(ua),
        ..Default::default()
    };
    let Some(result) = woothee::parser::Parser::new().parse(ua) else {
        return info;
    };

    if result.category == "crawler" && info.bot == Bot::None {
        info.bot = Bot::KnownBot;
    }
    // woothee reports "UNKNOWN" for anything it can't place.
    let known = |s: &str| if s == "UNKNOWN" { String::new() } else { s.to_string() };
    info.browser = known(result.name);
    info.browser_version = known(result.version);
    info.system = known(result.os);
    info.system_version = known(&result.os_version);
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIREFOX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0";
    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    #[test]
    fn shorten_drops_boilerplate() {
        assert_eq!(
            shorten(CHROME),
            "~(Windows NT 10.0) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36"
        );
        assert_eq!(shorten("  curl/7.8  "), "curl/7.8");
    }

    #[test]
    fn parse_browser_and_system() {
        let info = parse(FIREFOX);
        assert_eq!(info.browser, "Firefox");
        assert_eq!(info.browser_version, "120.0");
        assert_eq!(info.system, "Linux");
        assert_eq!(info.bot, Bot::None);
    }

    #[test]
    fn parse_unknown() {
        let info = parse("curl/7.8");
        assert_eq!(info.bot, Bot::Short);
    }

    #[test]
    fn crawler_category_is_bot() {
        let info = parse("Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)");
        assert!(bot::is_bot(info.bot.as_u8()));
    }
}
