//! Automated client detection
//!
//! Classifies a request as automated from its user-agent, HTTP method and
//! the content negotiation headers every browser sends. A separate, much smaller list names the search and social crawlers that are
//! allowed through even though the generic patterns flag them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Lower-case user-agent fragments that mark automation.
const BOT_PATTERNS: &[&str] = &[
    // Search engines
    "googlebot", "bingbot", "slurp", "duckduckbot", "baiduspider", "yandexbot",
    "sogou", "exabot", "facebot", "ia_archiver", "msnbot", "yahoo", "ask jeeves",
    "teoma", "gigabot",
    // Social link previews
    "facebookexternalhit", "twitterbot", "linkedinbot", "whatsapp", "telegrambot",
    "skypeuripreview", "vkshare", "pinterest", "slack", "discord", "line",
    "kakaotalk",
    // SEO crawlers and monitors
    "ahrefsbot", "semrushbot", "mj12bot", "dotbot", "rogerbot", "screaming frog",
    "siteimprove", "gtmetrix", "pingdom", "majestic", "spyfu", "opensiteexplorer",
    "seokicks",
    // Scanners
    "nmap", "masscan", "zmap", "sqlmap", "nikto", "w3af", "skipfish", "grabber",
    "wpscan",
    // Generic markers
    "bot", "crawler", "spider", "scraper", "fetcher", "checker", "monitor",
    "test", "validator", "analyzer", "audit", "indexer", "harvester", "archiver",
    // Headless browsers
    "headlesschrome", "phantomjs", "selenium", "playwright", "puppeteer",
    "chrome-lighthouse", "pagespeed", "browserless", "splash",
    // HTTP libraries and tools
    "curl", "wget", "python-requests", "python-urllib", "go-http-client", "ruby",
    "perl", "java", "node.js", "axios", "httpclient", "okhttp", "apache-httpclient",
    "libwww", "postman", "insomnia", "httpie", "rest-client", "api-client",
    "test-client",
];

/// Crawlers that are let through despite matching the patterns above.
const WHITELISTED_CRAWLERS: &[&str] = &[
    "googlebot", "bingbot", "slurp", "duckduckbot", "baiduspider", "yandexbot",
    "facebookexternalhit", "twitterbot", "linkedinbot", "whatsapp", "telegram",
    "pinterest",
];

/// User-agents shorter than this are treated as hand-written
const MIN_USER_AGENT_LEN: usize = 15;

static NAME_SLASH_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[a-z]+/[\d.]+$").expect("version pattern is valid")
});

static NAME_SPACE_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[a-z]+ [\d.]+$").expect("version pattern is valid")
});

static EMBEDDED_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\+?https?://").expect("url pattern is valid")
});

/// `Accept` values sent by HTTP libraries but never by a browser navigation
const BARE_ACCEPT_VALUES: &[&str] = &["*/*", "text/html"];

/// Content negotiation headers of the request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrowserHeaders<'a> {
    pub accept: Option<&'a str>,
    pub accept_language: Option<&'a str>,
}

impl<'a> BrowserHeaders<'a> {
    pub fn new(accept: Option<&'a str>, accept_language: Option<&'a str>) -> Self {
        Self {
            accept,
            accept_language,
        }
    }
}

/// First signal that marked a request as automated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", content = "detail", rename_all = "snake_case")]
pub enum BotSignal {
    EmptyUserAgent,
    NonGetMethod(String),
    KnownPattern(&'static str),
    SimpleVersionString,
    EmbeddedUrl,
    TooShort,
    NoLetters,
    /// Neither `Accept` nor `Accept-Language` was sent
    MissingBrowserHeaders,
    /// `Accept` is a bare `*/*` or `text/html`
    BareAccept(String),
}

/// Outcome of classifying one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotVerdict {
    /// Why the request looks automated, if it does
    pub signal: Option<BotSignal>,
    /// The user-agent names a crawler on the allow list
    pub whitelisted_crawler: bool,
}

impl BotVerdict {
    /// Looks automated, regardless of the allow list
    pub fn is_automated(&self) -> bool {
        self.signal.is_some()
    }

    /// Automated and not rescued by the crawler allow list
    pub fn is_blocked(&self) -> bool {
        self.is_automated() && !self.whitelisted_crawler
    }
}

/// Classify a request from its user-agent, method and browser headers.
pub fn classify(user_agent: &str, method: &str, headers: BrowserHeaders<'_>) -> BotVerdict {
    BotVerdict {
        signal: detect_signal(user_agent, method, headers),
        whitelisted_crawler: is_whitelisted_crawler(user_agent),
    }
}

/// Whether the user-agent names an allow-listed crawler
pub fn is_whitelisted_crawler(user_agent: &str) -> bool {
    let ua = user_agent.to_lowercase();
    WHITELISTED_CRAWLERS.iter().any(|name| ua.contains(name))
}

fn detect_signal(user_agent: &str, method: &str, headers: BrowserHeaders<'_>) -> Option<BotSignal> {
    let ua = user_agent.trim();
    if ua.is_empty() {
        return Some(BotSignal::EmptyUserAgent);
    }

    if !method.eq_ignore_ascii_case("GET") {
        return Some(BotSignal::NonGetMethod(method.to_uppercase()));
    }

    let lowered = ua.to_lowercase();
    if let Some(pattern) = BOT_PATTERNS.iter().find(|p| lowered.contains(*p)) {
        return Some(BotSignal::KnownPattern(pattern));
    }

    if NAME_SLASH_VERSION.is_match(ua) || NAME_SPACE_VERSION.is_match(ua) {
        return Some(BotSignal::SimpleVersionString);
    }

    if lowered.contains("http") || EMBEDDED_URL.is_match(ua) {
        return Some(BotSignal::EmbeddedUrl);
    }

    if ua.chars().count() < MIN_USER_AGENT_LEN {
        return Some(BotSignal::TooShort);
    }

    if !ua.chars().any(|c| c.is_alphabetic()) {
        return Some(BotSignal::NoLetters);
    }

    header_signal(headers)
}

fn header_signal(headers: BrowserHeaders<'_>) -> Option<BotSignal> {
    let present = |value: Option<&str>| value.is_some_and(|v| !v.trim().is_empty());
    if !present(headers.accept) && !present(headers.accept_language) {
        return Some(BotSignal::MissingBrowserHeaders);
    }

    let accept = headers.accept.map(|v| v.trim().to_lowercase())?;
    if BARE_ACCEPT_VALUES.contains(&accept.as_str()) {
        return Some(BotSignal::BareAccept(accept));
    }
    None
}
