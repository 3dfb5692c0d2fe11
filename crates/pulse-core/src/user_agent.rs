//! User-agent classification by ordered substring rules.
//!
//! Rules are checked top to bottom against the lowercased user agent and the
//! first match wins, so more specific tokens (`edg/` before `chrome`,
//! `iphone` before `mac os`) must come first.

use serde::{Deserialize, Serialize};

pub const UNKNOWN: &str = "unknown";

/// Coarse device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
    Unknown,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Unknown => UNKNOWN,
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Parsed user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub browser: String,
    pub os: String,
    pub device: DeviceClass,
}

const BROWSER_RULES: &[(&[&str], &str)] = &[
    (&["edg/", "edge/", "edga/", "edgios/"], "Edge"),
    (&["opr/", "opera"], "Opera"),
    (&["samsungbrowser"], "Samsung Internet"),
    (&["chrome", "crios", "chromium"], "Chrome"),
    (&["firefox", "fxios"], "Firefox"),
    (&["safari"], "Safari"),
    (&["msie", "trident/"], "Internet Explorer"),
];

const OS_RULES: &[(&[&str], &str)] = &[
    (&["windows"], "Windows"),
    (&["android"], "Android"),
    (&["iphone", "ipad", "ipod"], "iOS"),
    (&["mac os", "macintosh"], "macOS"),
    (&["cros"], "ChromeOS"),
    (&["linux", "x11"], "Linux"),
];

/// Tablet rules come first: Android tablets omit the `mobile` token.
fn device_of(ua: &str) -> DeviceClass {
    let android_tablet = ua.contains("android") && !ua.contains("mobile");
    if ua.contains("ipad") || ua.contains("tablet") || ua.contains("kindle") || android_tablet {
        DeviceClass::Tablet
    } else if ua.contains("mobi") || ua.contains("iphone") || ua.contains("ipod") {
        DeviceClass::Mobile
    } else if ["windows", "macintosh", "x11", "linux", "cros"]
        .iter()
        .any(|t| ua.contains(t))
    {
        DeviceClass::Desktop
    } else {
        DeviceClass::Unknown
    }
}

fn first_match(ua: &str, rules: &[(&[&str], &str)]) -> String {
    rules
        .iter()
        .find(|(tokens, _)| tokens.iter().any(|t| ua.contains(t)))
        .map(|(_, name)| (*name).to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Classify a raw user-agent string.
pub fn parse(user_agent: &str) -> UserAgentInfo {
    let ua = user_agent.to_lowercase();
    UserAgentInfo {
        browser: first_match(&ua, BROWSER_RULES),
        os: first_match(&ua, OS_RULES),
        device: device_of(&ua),
    }
}
