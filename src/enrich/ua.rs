//! User-agent normalization

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static BOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)bot|crawl|spider|slurp|facebookexternalhit|headless|curl/|wget/|python-requests|go-http-client")
        .expect("valid regex")
});

/// `(family, pattern)` in match order; the first capture group is the version
static BROWSERS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("Edge", r"Edg(?:e|A|iOS)?/([\d.]+)"),
        ("Opera", r"(?:OPR|Opera)/([\d.]+)"),
        ("Samsung Internet", r"SamsungBrowser/([\d.]+)"),
        ("Chrome", r"(?:Chrome|CriOS)/([\d.]+)"),
        ("Firefox", r"(?:Firefox|FxiOS)/([\d.]+)"),
        ("Safari", r"Version/([\d.]+).*Safari/"),
        ("Internet Explorer", r"(?:MSIE |Trident/.*rv:)([\d.]+)"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid regex")))
    .collect()
});

static OPERATING_SYSTEMS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("Windows", r"Windows NT ([\d.]+)"),
        ("iOS", r"(?:iPhone|CPU) OS ([\d_]+)"),
        ("Mac OS", r"Mac OS X ([\d_.]+)"),
        ("Android", r"Android ([\d.]+)"),
        ("Chrome OS", r"CrOS \S+ ([\d.]+)"),
        ("Linux", r"Linux()"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid regex")))
    .collect()
});

static TABLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ipad|tablet|kindle|silk/").expect("valid regex"));
static MOBILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)mobi|iphone|ipod|android").expect("valid regex"));

/// Family and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Software {
    /// Family name
    pub name: String,
    /// Version with `.` separators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Parsed user agent stored at `context.ua`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAgent {
    /// Browser
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<Software>,
    /// Operating system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Software>,
    /// `desktop`, `mobile`, `tablet` or `bot`
    pub device_type: String,
    /// Crawler or script
    pub bot: bool,
}

fn find(table: &[(&'static str, Regex)], ua: &str) -> Option<Software> {
    table.iter().find_map(|(name, re)| {
        re.captures(ua).map(|caps| Software {
            name: (*name).to_string(),
            version: caps
                .get(1)
                .map(|m| m.as_str().replace('_', "."))
                .filter(|v| !v.is_empty()),
        })
    })
}

/// Parse a user-agent header
pub fn parse(ua: &str) -> UserAgent {
    let bot = BOT.is_match(ua);
    let device_type = if bot {
        "bot"
    } else if TABLET.is_match(ua) {
        "tablet"
    } else if MOBILE.is_match(ua) {
        "mobile"
    } else {
        "desktop"
    };
    UserAgent {
        browser: find(&BROWSERS, ua),
        os: find(&OPERATING_SYSTEMS, ua),
        device_type: device_type.to_string(),
        bot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Chrome",
        "Windows",
        "desktop"
    )]
    #[case(
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1",
        "Safari",
        "iOS",
        "mobile"
    )]
    #[case(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91",
        "Edge",
        "Windows",
        "desktop"
    )]
    #[case(
        "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
        "Chrome",
        "Android",
        "mobile"
    )]
    fn test_browsers(
        #[case] ua: &str,
        #[case] browser: &str,
        #[case] os: &str,
        #[case] device: &str,
    ) {
        let parsed = parse(ua);
        assert_eq!(parsed.browser.map(|b| b.name).as_deref(), Some(browser));
        assert_eq!(parsed.os.map(|o| o.name).as_deref(), Some(os));
        assert_eq!(parsed.device_type, device);
        assert!(!parsed.bot);
    }

    #[test]
    fn test_ios_version_uses_dots() {
        let parsed =
            parse("Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) Version/17.1 Safari/604.1");
        assert_eq!(parsed.os.and_then(|o| o.version).as_deref(), Some("17.1"));
    }

    #[test]
    fn test_bots() {
        let parsed =
            parse("Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)");
        assert!(parsed.bot);
        assert_eq!(parsed.device_type, "bot");
        assert!(parse("curl/8.4.0").bot);
    }
}
