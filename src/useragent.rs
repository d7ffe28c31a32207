//! Best-effort user agent classification for tracking hits.
//!
//! Never fails: anything unrecognised comes back as `unknown`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Coarse device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
    Bot,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
            DeviceType::Bot => "bot",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed user agent fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub browser: String,
    pub os: String,
    pub device_type: DeviceType,
    pub is_bot: bool,
}

struct Patterns {
    bot: Option<Regex>,
    browsers: Vec<(Regex, &'static str)>,
    systems: Vec<(Regex, &'static str)>,
}

// First match wins, so more specific tokens come first (Edge and Opera also
// advertise Chrome, Chrome also advertises Safari).
const BROWSERS: &[(&str, &str)] = &[
    (r"(?i)\bEdg(e|A|iOS)?/", "Edge"),
    (r"(?i)\b(OPR|Opera)\b", "Opera"),
    (r"(?i)\bSamsungBrowser/", "Samsung Internet"),
    (r"(?i)\bThunderbird/", "Thunderbird"),
    (r"(?i)\bMicrosoft Outlook\b|\bMSOffice\b", "Outlook"),
    (r"(?i)\b(Firefox|FxiOS)/", "Firefox"),
    (r"(?i)\b(Chrome|CriOS|Chromium)/", "Chrome"),
    (r"(?i)\bVersion/[\d.]+.*\bSafari/", "Safari"),
    (r"(?i)\b(MSIE|Trident/)", "Internet Explorer"),
    (r"(?i)\bAppleWebKit/", "WebKit"),
];

const SYSTEMS: &[(&str, &str)] = &[
    (r"(?i)\b(iPhone|iPad|iPod)\b", "iOS"),
    (r"(?i)\bAndroid\b", "Android"),
    (r"(?i)\bWindows (NT|Phone)\b|\bWin64\b", "Windows"),
    (r"(?i)\bCrOS\b", "Chrome OS"),
    (r"(?i)\b(Mac OS X|Macintosh)\b", "macOS"),
    (r"(?i)\bLinux\b", "Linux"),
];

const BOT: &str = r"(?i)bot\b|crawl|spider|slurp|scanner|monitor|preview|headless|\b(curl|wget|python-requests|go-http-client|okhttp|java|libwww-perl)\b";

fn compile(table: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    table
        .iter()
        .filter_map(|(pattern, name)| Regex::new(pattern).ok().map(|re| (re, *name)))
        .collect()
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        bot: Regex::new(BOT).ok(),
        browsers: compile(BROWSERS),
        systems: compile(SYSTEMS),
    })
}

fn first_match(table: &[(Regex, &'static str)], ua: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(re, _)| re.is_match(ua))
        .map(|(_, name)| *name)
}

/// Classify a raw `User-Agent` header.
///
/// An empty agent is treated as a bot: mail clients always send one.
///
/// ```
/// use mailtrack::useragent::{parse, DeviceType};
///
/// let info = parse("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1");
/// assert_eq!(info.browser, "Safari");
/// assert_eq!(info.os, "iOS");
/// assert_eq!(info.device_type, DeviceType::Mobile);
/// assert!(!info.is_bot);
/// ```
pub fn parse(user_agent: &str) -> UserAgentInfo {
    let ua = user_agent.trim();
    let patterns = patterns();

    let is_bot = ua.is_empty() || patterns.bot.as_ref().is_some_and(|re| re.is_match(ua));
    let browser = first_match(&patterns.browsers, ua).unwrap_or("unknown");
    let os = first_match(&patterns.systems, ua).unwrap_or("unknown");

    let lower = ua.to_ascii_lowercase();
    let device_type = if is_bot {
        DeviceType::Bot
    } else if lower.contains("ipad") || lower.contains("tablet") {
        DeviceType::Tablet
    } else if os == "Android" && !lower.contains("mobile") {
        DeviceType::Tablet
    } else if lower.contains("mobi") || lower.contains("iphone") || lower.contains("ipod") {
        DeviceType::Mobile
    } else if matches!(os, "Windows" | "macOS" | "Linux" | "Chrome OS") {
        DeviceType::Desktop
    } else {
        DeviceType::Unknown
    };

    UserAgentInfo {
        browser: browser.to_string(),
        os: os.to_string(),
        device_type,
        is_bot,
    }
}
