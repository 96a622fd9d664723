//! User-Agent parsing for metadata enrichment (spec.md §4.3, C3).
//!
//! Two compiled regexes classify browser family and OS family; a third
//! matches common bot substrings. Never fails — an unparseable or absent
//! UA string falls back to `UserAgentInfo::unknown`.

use crate::model::UserAgentInfo;
use regex::Regex;
use std::sync::LazyLock;

static BROWSER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(Edg|Chrome|CriOS|Firefox|FxiOS|Safari|OPR|Opera)/([\d.]+)").expect("static browser regex compiles")
});

static OS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(Windows NT|Mac OS X|Android|iPhone OS|CPU OS|Linux)[ /]?([\d._]+)?").expect("static os regex compiles")
});

static BOT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)bot|crawl|spider|slurp|curl|wget|monitor|pingdom|uptime").expect("static bot regex compiles")
});

fn browser_family(raw: &str) -> (String, String) {
    let Some(captures) = BROWSER_PATTERN.captures(raw) else {
        return ("Unknown".to_string(), "Unknown".to_string());
    };
    let name = match captures.get(1).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(name) if name == "crios" => "Chrome".to_string(),
        Some(name) if name == "fxios" => "Firefox".to_string(),
        Some(name) if name == "opr" => "Opera".to_string(),
        Some(name) => capitalize(&name),
        None => "Unknown".to_string(),
    };
    let version = captures
        .get(2)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    (name, version)
}

fn os_family(raw: &str) -> (String, String) {
    let Some(captures) = OS_PATTERN.captures(raw) else {
        return ("Unknown".to_string(), "Unknown".to_string());
    };
    let name = match captures.get(1).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(name) if name == "mac os x" => "macOS".to_string(),
        Some(name) if name == "windows nt" => "Windows".to_string(),
        Some(name) if name == "iphone os" || name == "cpu os" => "iOS".to_string(),
        Some(name) => capitalize(&name),
        None => "Unknown".to_string(),
    };
    let version = captures
        .get(2)
        .map(|m| m.as_str().replace('_', "."))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());
    (name, version)
}

fn device_type(lowered: &str) -> String {
    if lowered.contains("ipad") || lowered.contains("tablet") {
        "tablet".to_string()
    } else if lowered.contains("mobile") || lowered.contains("iphone") || lowered.contains("android") {
        "mobile".to_string()
    } else {
        "desktop".to_string()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Parses a raw `User-Agent` header value into `UserAgentInfo`. Never
/// fails — unrecognized fields default to `"Unknown"` (spec.md §4.3).
pub fn parse_user_agent(raw: &str) -> UserAgentInfo {
    if raw.trim().is_empty() {
        return UserAgentInfo::unknown(raw);
    }

    let lowered = raw.to_ascii_lowercase();
    let (browser, browser_version) = browser_family(raw);
    let (os, os_version) = os_family(raw);

    UserAgentInfo {
        raw: raw.to_string(),
        browser,
        browser_version,
        os,
        os_version,
        device_type: device_type(&lowered),
        is_bot: BOT_PATTERN.is_match(&lowered),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_user_agent_is_unknown() {
        let info = parse_user_agent("");
        assert_eq!(info.browser, "Unknown");
        assert_eq!(info.device_type, "desktop");
    }

    #[test]
    fn parses_desktop_chrome_on_windows() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36";
        let info = parse_user_agent(ua);
        assert_eq!(info.browser, "Chrome");
        assert_eq!(info.os, "Windows");
        assert_eq!(info.device_type, "desktop");
        assert!(!info.is_bot);
    }

    #[test]
    fn parses_mobile_safari_on_ios() {
        let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 Safari/604.1";
        let info = parse_user_agent(ua);
        assert_eq!(info.os, "iOS");
        assert_eq!(info.device_type, "mobile");
    }

    #[test]
    fn detects_ipad_as_tablet() {
        let ua = "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X) AppleWebKit/605.1.15";
        assert_eq!(parse_user_agent(ua).device_type, "tablet");
    }

    #[test]
    fn detects_bot_substrings_case_insensitively() {
        assert!(parse_user_agent("Mozilla/5.0 (compatible; Googlebot/2.1)").is_bot);
        assert!(parse_user_agent("curl/8.4.0").is_bot);
        assert!(!parse_user_agent("Mozilla/5.0 Firefox/120.0").is_bot);
    }
}
