//! Redirect eligibility evaluator
//!
//! Runs the ordered check pipeline for one request against a settings
//! snapshot and returns a [`Decision`]. The feature gate, the scope check and
//! the IP lists end evaluation early; every later check runs and all failures
//! are collected.
//!
//! The only state touched is the per-IP rate limit counter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use url::Url;

use crate::services::bot_detection::{self, BotVerdict, BrowserHeaders};
use crate::services::rate_limiter::{RateLimitOutcome, RedirectRateLimiter};
use crate::services::request_guard::{self, ThreatKind};
use crate::services::settings::RedirectSettings;
use crate::services::validation::{normalize_host, parse_redirect_url};

/// Per-request input to the evaluator
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: IpAddr,
    pub user_agent: String,
    pub http_method: String,
    pub referrer_url: Option<String>,
    /// Path and query as received
    pub request_uri: String,
    /// Lower-cased header names
    pub headers: HashMap<String, String>,
    /// Served over TLS, directly or behind a trusted proxy
    pub is_secure: bool,
    /// Browser history length reported by the client, if any
    pub history_length: Option<u32>,
}

impl RequestContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn browser_headers(&self) -> BrowserHeaders<'_> {
        BrowserHeaders::new(self.header("accept"), self.header("accept-language"))
    }

    fn classify_bot(&self) -> BotVerdict {
        bot_detection::classify(&self.user_agent, &self.http_method, self.browser_headers())
    }

    /// Request path without query or fragment
    pub fn path(&self) -> &str {
        let path = self.request_uri.split(['?', '#']).next().unwrap_or_default();
        if path.is_empty() { "/" } else { path }
    }
}

/// Why a request was not redirected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Reason {
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "out of scope")]
    OutOfScope,
    #[serde(rename = "ip blocked")]
    IpBlocked,
    #[serde(rename = "ip whitelisted")]
    IpWhitelisted,
    #[serde(rename = "rate limited")]
    RateLimited,
    #[serde(rename = "bot detected")]
    BotDetected,
    #[serde(rename = "suspicious request")]
    SuspiciousRequest,
    #[serde(rename = "invalid redirect url")]
    InvalidRedirectUrl,
    #[serde(rename = "https downgrade blocked")]
    HttpsDowngradeBlocked,
    #[serde(rename = "referrer mismatch")]
    ReferrerMismatch,
    #[serde(rename = "history too short")]
    HistoryTooShort,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Disabled => "disabled",
            Reason::OutOfScope => "out of scope",
            Reason::IpBlocked => "ip blocked",
            Reason::IpWhitelisted => "ip whitelisted",
            Reason::RateLimited => "rate limited",
            Reason::BotDetected => "bot detected",
            Reason::SuspiciousRequest => "suspicious request",
            Reason::InvalidRedirectUrl => "invalid redirect url",
            Reason::HttpsDowngradeBlocked => "https downgrade blocked",
            Reason::ReferrerMismatch => "referrer mismatch",
            Reason::HistoryTooShort => "history too short",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller should reject the request instead of serving the page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "threat", rename_all = "snake_case")]
pub enum BlockReason {
    IpBlocked,
    Suspicious(ThreatKind),
}

/// How an approved redirect reaches the browser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// HTTP 302 from the server
    Server,
    /// Script in the rendered page, which still checks the history length
    Client,
}

/// Outcome of evaluating one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub redirect: bool,
    pub reasons: Vec<Reason>,
    pub block: Option<BlockReason>,
    pub delivery: Delivery,
    /// Validated redirect target, when it parsed
    pub target: Option<Url>,
}

impl Decision {
    fn stop(reason: Reason, block: Option<BlockReason>) -> Self {
        Self {
            redirect: false,
            reasons: vec![reason],
            block,
            delivery: Delivery::Server,
            target: None,
        }
    }
}

/// Result of one pipeline stage, as shown in diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub check: &'static str,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Every check for one request, without short-circuiting
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub client_ip: IpAddr,
    pub would_redirect: bool,
    pub reasons: Vec<Reason>,
    pub delivery: Delivery,
    pub checks: Vec<CheckResult>,
    pub rate_limit: RateLimitOutcome,
    pub bot: BotVerdict,
}

#[derive(Default)]
struct Assessment {
    checks: Vec<CheckResult>,
    reasons: Vec<Reason>,
    block: Option<BlockReason>,
    client_delivery: bool,
    target: Option<Url>,
}

impl Assessment {
    fn pass(&mut self, check: &'static str, detail: Option<String>) {
        self.checks.push(CheckResult { check, passed: true, detail });
    }

    fn fail(&mut self, check: &'static str, reason: Reason, detail: Option<String>) {
        self.checks.push(CheckResult { check, passed: false, detail });
        self.reasons.push(reason);
    }

    fn delivery(&self) -> Delivery {
        if self.client_delivery { Delivery::Client } else { Delivery::Server }
    }
}

/// Ordered redirect eligibility pipeline
pub struct RedirectEvaluator {
    limiter: Arc<RedirectRateLimiter>,
    home_path: String,
}

impl RedirectEvaluator {
    pub fn new(limiter: Arc<RedirectRateLimiter>, home_path: impl Into<String>) -> Self {
        Self {
            limiter,
            home_path: home_path.into(),
        }
    }

    pub fn home_path(&self) -> &str {
        &self.home_path
    }

    /// Whether a request path targets the homepage
    pub fn is_in_scope(&self, path: &str) -> bool {
        trim_trailing_slash(path) == trim_trailing_slash(&self.home_path)
    }

    /// Decide whether `request` should be redirected
    pub async fn evaluate(&self, settings: &RedirectSettings, request: &RequestContext) -> Decision {
        self.evaluate_at(settings, request, Utc::now()).await
    }

    /// Same as [`evaluate`](Self::evaluate) with an explicit clock
    pub async fn evaluate_at(
        &self,
        settings: &RedirectSettings,
        request: &RequestContext,
        now: DateTime<Utc>,
    ) -> Decision {
        if !settings.redirect_enabled {
            return Decision::stop(Reason::Disabled, None);
        }

        if !self.is_in_scope(request.path()) {
            return Decision::stop(Reason::OutOfScope, None);
        }

        if settings.blacklist_ips.contains(&request.client_ip) {
            let decision = Decision::stop(Reason::IpBlocked, Some(BlockReason::IpBlocked));
            log_decision(settings, request, &decision);
            return decision;
        }
        if settings.whitelist_ips.contains(&request.client_ip) {
            let decision = Decision::stop(Reason::IpWhitelisted, None);
            log_decision(settings, request, &decision);
            return decision;
        }

        let rate = self.limiter.check_at(request.client_ip, now).await;
        let mut assessment = Assessment::default();
        assess(settings, request, rate, &mut assessment);

        let decision = Decision {
            redirect: assessment.reasons.is_empty(),
            delivery: assessment.delivery(),
            reasons: assessment.reasons,
            block: assessment.block,
            target: assessment.target,
        };
        log_decision(settings, request, &decision);
        decision
    }

    /// Run every check and report each result. No rate limit attempt is
    /// consumed.
    pub async fn diagnose(
        &self,
        settings: &RedirectSettings,
        request: &RequestContext,
    ) -> DiagnosticReport {
        let mut assessment = Assessment::default();

        if settings.redirect_enabled {
            assessment.pass("feature_gate", None);
        } else {
            assessment.fail("feature_gate", Reason::Disabled, None);
        }

        let path = request.path();
        if self.is_in_scope(path) {
            assessment.pass("scope", None);
        } else {
            assessment.fail("scope", Reason::OutOfScope, Some(path.to_string()));
        }

        if settings.blacklist_ips.contains(&request.client_ip) {
            assessment.block = Some(BlockReason::IpBlocked);
            assessment.fail("ip_lists", Reason::IpBlocked, Some("blacklisted".to_string()));
        } else if settings.whitelist_ips.contains(&request.client_ip) {
            assessment.fail("ip_lists", Reason::IpWhitelisted, Some("whitelisted".to_string()));
        } else {
            assessment.pass("ip_lists", None);
        }

        let rate = self.limiter.peek(request.client_ip).await;
        assess(settings, request, rate, &mut assessment);

        DiagnosticReport {
            client_ip: request.client_ip,
            would_redirect: assessment.reasons.is_empty(),
            delivery: assessment.delivery(),
            reasons: assessment.reasons,
            checks: assessment.checks,
            rate_limit: rate,
            bot: request.classify_bot(),
        }
    }
}

/// Steps after the IP gate: rate limit through history
fn assess(
    settings: &RedirectSettings,
    request: &RequestContext,
    rate: RateLimitOutcome,
    out: &mut Assessment,
) {
    match rate {
        RateLimitOutcome::Limited { attempts } => out.fail(
            "rate_limit",
            Reason::RateLimited,
            Some(format!("{} attempts in window", attempts)),
        ),
        RateLimitOutcome::Allowed { attempts } => {
            out.pass("rate_limit", Some(format!("{} attempts in window", attempts)))
        }
        RateLimitOutcome::Inconclusive => {
            out.pass("rate_limit", Some("counter store unavailable".to_string()))
        }
    }

    let verdict = request.classify_bot();
    match (&verdict.signal, verdict.whitelisted_crawler) {
        (Some(signal), false) => {
            out.fail("bot_detection", Reason::BotDetected, Some(format!("{:?}", signal)))
        }
        (Some(_), true) => out.pass("bot_detection", Some("whitelisted crawler".to_string())),
        (None, _) => out.pass("bot_detection", None),
    }

    match request_guard::inspect_uri(&request.request_uri) {
        Some(threat) => {
            out.block.get_or_insert(BlockReason::Suspicious(threat));
            out.fail("request_uri", Reason::SuspiciousRequest, Some(threat.to_string()));
        }
        None => out.pass("request_uri", None),
    }

    match parse_redirect_url(&settings.redirect_url) {
        Ok(url) => {
            out.pass("redirect_url", None);
            out.target = Some(url);
        }
        Err(e) => out.fail("redirect_url", Reason::InvalidRedirectUrl, Some(e.to_string())),
    }

    let target_scheme = Url::parse(settings.redirect_url.trim())
        .map(|url| url.scheme().to_string())
        .ok();
    match target_scheme {
        Some(scheme) if request.is_secure && scheme != "https" => out.fail(
            "https_downgrade",
            Reason::HttpsDowngradeBlocked,
            Some(format!("{} target from a secure page", scheme)),
        ),
        _ => out.pass("https_downgrade", None),
    }

    if settings.referrer_check_enabled {
        let matched = request
            .referrer_url
            .as_deref()
            .is_some_and(|referrer| referrer_matches(referrer, &settings.referrer_domain));
        if matched {
            out.pass("referrer", None);
        } else {
            let detail = request.referrer_url.clone().unwrap_or_else(|| "no referrer".to_string());
            out.fail("referrer", Reason::ReferrerMismatch, Some(detail));
        }
    } else {
        out.pass("referrer", Some("disabled".to_string()));
    }

    if settings.history_check_enabled {
        match request.history_length {
            Some(length) if length > settings.min_history_length => {
                out.pass("history", Some(format!("length {}", length)))
            }
            Some(length) => out.fail(
                "history",
                Reason::HistoryTooShort,
                Some(format!("length {} <= {}", length, settings.min_history_length)),
            ),
            None => {
                // Unknown on the server; the page script makes the comparison
                out.client_delivery = true;
                out.pass("history", Some("checked in browser".to_string()));
            }
        }
    } else {
        out.pass("history", Some("disabled".to_string()));
    }
}

/// Whether the referrer host is `domain` or one of its subdomains.
/// Case and a leading `www.` are ignored on both sides.
pub fn referrer_matches(referrer: &str, domain: &str) -> bool {
    let domain = normalize_host(domain);
    if domain.is_empty() {
        return false;
    }

    let Some(host) = Url::parse(referrer.trim())
        .ok()
        .and_then(|url| url.host_str().map(normalize_host))
    else {
        return false;
    };

    host == domain || host.ends_with(&format!(".{}", domain))
}

fn trim_trailing_slash(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

fn log_decision(settings: &RedirectSettings, request: &RequestContext, decision: &Decision) {
    let reasons = decision
        .reasons
        .iter()
        .map(Reason::as_str)
        .collect::<Vec<_>>()
        .join(", ");

    if settings.logging_enabled {
        tracing::info!(
            ip = %request.client_ip,
            user_agent = %request.user_agent,
            redirect = decision.redirect,
            reasons = %reasons,
            "Redirect evaluated"
        );
    } else {
        tracing::debug!(ip = %request.client_ip, redirect = decision.redirect, reasons = %reasons, "Redirect evaluated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use chrono::TimeZone;

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36";
    const GOOGLEBOT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

    fn evaluator() -> RedirectEvaluator {
        let cache = Arc::new(Cache::Memory(MemoryCache::new()));
        RedirectEvaluator::new(Arc::new(RedirectRateLimiter::new(cache)), "/")
    }

    fn settings() -> RedirectSettings {
        RedirectSettings::default()
    }

    fn request() -> RequestContext {
        RequestContext {
            client_ip: "8.8.8.8".parse().unwrap(),
            user_agent: CHROME.to_string(),
            http_method: "GET".to_string(),
            referrer_url: Some("https://www.google.com/search?q=x".to_string()),
            request_uri: "/".to_string(),
            headers: HashMap::from([
                ("accept".to_string(), "text/html,application/xhtml+xml,*/*;q=0.8".to_string()),
                ("accept-language".to_string(), "en-US,en;q=0.9".to_string()),
            ]),
            is_secure: false,
            history_length: Some(3),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_eligible_request_redirects_from_server() {
        let decision = evaluator().evaluate(&settings(), &request()).await;

        assert!(decision.redirect, "reasons: {:?}", decision.reasons);
        assert!(decision.reasons.is_empty());
        assert_eq!(decision.delivery, Delivery::Server);
        assert_eq!(decision.target.map(|u| u.to_string()), Some("https://example.com/".to_string()));
        assert_eq!(decision.block, None);
    }

    #[tokio::test]
    async fn test_missing_history_uses_client_delivery() {
        let mut req = request();
        req.history_length = None;

        let decision = evaluator().evaluate(&settings(), &req).await;
        assert!(decision.redirect);
        assert_eq!(decision.delivery, Delivery::Client);
    }

    #[tokio::test]
    async fn test_disabled_is_terminal() {
        let mut s = settings();
        s.redirect_enabled = false;
        let mut req = request();
        req.user_agent = String::new();

        let decision = evaluator().evaluate(&s, &req).await;
        assert!(!decision.redirect);
        assert_eq!(decision.reasons, vec![Reason::Disabled]);
    }

    #[tokio::test]
    async fn test_other_paths_are_out_of_scope() {
        let mut req = request();
        req.request_uri = "/blog/post?id=1".to_string();

        let decision = evaluator().evaluate(&settings(), &req).await;
        assert_eq!(decision.reasons, vec![Reason::OutOfScope]);
        assert_eq!(decision.block, None);
    }

    #[tokio::test]
    async fn test_query_string_keeps_homepage_in_scope() {
        let mut req = request();
        req.request_uri = "/?utm_source=google".to_string();

        assert!(evaluator().evaluate(&settings(), &req).await.redirect);
    }

    #[tokio::test]
    async fn test_blacklist_blocks_and_wins_over_whitelist() {
        let mut s = settings();
        let ip = request().client_ip;
        s.blacklist_ips.insert(ip);
        s.whitelist_ips.insert(ip);

        let decision = evaluator().evaluate(&s, &request()).await;
        assert_eq!(decision.reasons, vec![Reason::IpBlocked]);
        assert_eq!(decision.block, Some(BlockReason::IpBlocked));
    }

    #[tokio::test]
    async fn test_whitelisted_ip_is_never_redirected() {
        let mut s = settings();
        s.whitelist_ips.insert(request().client_ip);

        let decision = evaluator().evaluate(&s, &request()).await;
        assert_eq!(decision.reasons, vec![Reason::IpWhitelisted]);
        assert_eq!(decision.block, None);
    }

    #[tokio::test]
    async fn test_rate_limit_after_five_attempts() {
        let evaluator = evaluator();
        for _ in 0..5 {
            assert!(evaluator.evaluate_at(&settings(), &request(), now()).await.redirect);
        }

        let sixth = evaluator.evaluate_at(&settings(), &request(), now()).await;
        assert_eq!(sixth.reasons, vec![Reason::RateLimited]);

        let later = now() + chrono::Duration::seconds(301);
        assert!(evaluator.evaluate_at(&settings(), &request(), later).await.redirect);
    }

    #[tokio::test]
    async fn test_failed_evaluations_still_count() {
        let evaluator = evaluator();
        let mut bot = request();
        bot.user_agent = "curl/7.68.0".to_string();
        for _ in 0..5 {
            evaluator.evaluate_at(&settings(), &bot, now()).await;
        }

        let decision = evaluator.evaluate_at(&settings(), &request(), now()).await;
        assert!(decision.reasons.contains(&Reason::RateLimited));
    }

    #[tokio::test]
    async fn test_bot_detected() {
        let mut req = request();
        req.user_agent = "python-requests/2.31.0".to_string();

        let decision = evaluator().evaluate(&settings(), &req).await;
        assert_eq!(decision.reasons, vec![Reason::BotDetected]);
        assert_eq!(decision.block, None);
    }

    #[tokio::test]
    async fn test_browser_ua_with_library_headers_is_bot() {
        let mut req = request();
        req.headers = HashMap::from([("accept".to_string(), "*/*".to_string())]);

        let decision = evaluator().evaluate(&settings(), &req).await;
        assert_eq!(decision.reasons, vec![Reason::BotDetected]);

        req.headers.clear();
        let report = evaluator().diagnose(&settings(), &req).await;
        assert_eq!(report.bot.signal, Some(bot_detection::BotSignal::MissingBrowserHeaders));
    }

    #[tokio::test]
    async fn test_whitelisted_crawler_continues() {
        let mut req = request();
        req.user_agent = GOOGLEBOT.to_string();

        let decision = evaluator().evaluate(&settings(), &req).await;
        assert!(decision.redirect);
    }

    #[tokio::test]
    async fn test_suspicious_uri_blocks() {
        let mut req = request();
        req.request_uri = "/?q=<script>alert(1)</script>".to_string();

        let decision = evaluator().evaluate(&settings(), &req).await;
        assert!(decision.reasons.contains(&Reason::SuspiciousRequest));
        assert_eq!(decision.block, Some(BlockReason::Suspicious(ThreatKind::ScriptInjection)));
    }

    #[tokio::test]
    async fn test_invalid_redirect_url() {
        let mut s = settings();
        s.redirect_url = "http://localhost/landing".to_string();

        let decision = evaluator().evaluate(&s, &request()).await;
        assert_eq!(decision.reasons, vec![Reason::InvalidRedirectUrl]);
        assert!(decision.target.is_none());
    }

    #[tokio::test]
    async fn test_https_downgrade_blocked() {
        let mut s = settings();
        s.redirect_url = "http://example.com".to_string();
        let mut req = request();
        req.is_secure = true;

        let decision = evaluator().evaluate(&s, &req).await;
        assert_eq!(decision.reasons, vec![Reason::HttpsDowngradeBlocked]);

        req.is_secure = false;
        assert!(evaluator().evaluate(&s, &req).await.redirect);
    }

    #[tokio::test]
    async fn test_referrer_mismatch_and_missing() {
        let mut req = request();
        req.referrer_url = Some("https://www.bing.com/".to_string());
        assert_eq!(
            evaluator().evaluate(&settings(), &req).await.reasons,
            vec![Reason::ReferrerMismatch]
        );

        req.referrer_url = None;
        assert_eq!(
            evaluator().evaluate(&settings(), &req).await.reasons,
            vec![Reason::ReferrerMismatch]
        );
    }

    #[tokio::test]
    async fn test_referrer_check_disabled_passes() {
        let mut s = settings();
        s.referrer_check_enabled = false;
        let mut req = request();
        req.referrer_url = None;

        assert!(evaluator().evaluate(&s, &req).await.redirect);
    }

    #[tokio::test]
    async fn test_empty_referrer_domain_fails() {
        let mut s = settings();
        s.referrer_domain = String::new();

        let decision = evaluator().evaluate(&s, &request()).await;
        assert_eq!(decision.reasons, vec![Reason::ReferrerMismatch]);
    }

    #[tokio::test]
    async fn test_history_too_short() {
        let mut req = request();
        req.history_length = Some(1);

        let decision = evaluator().evaluate(&settings(), &req).await;
        assert_eq!(decision.reasons, vec![Reason::HistoryTooShort]);
    }

    #[tokio::test]
    async fn test_all_failures_are_collected() {
        let mut s = settings();
        s.redirect_url = "ftp://example.com".to_string();
        let mut req = request();
        req.user_agent = String::new();
        req.referrer_url = None;
        req.history_length = Some(0);

        let decision = evaluator().evaluate(&s, &req).await;
        assert_eq!(
            decision.reasons,
            vec![
                Reason::BotDetected,
                Reason::InvalidRedirectUrl,
                Reason::ReferrerMismatch,
                Reason::HistoryTooShort,
            ]
        );
    }

    #[tokio::test]
    async fn test_diagnose_does_not_consume_attempts() {
        let evaluator = evaluator();
        for _ in 0..10 {
            let report = evaluator.diagnose(&settings(), &request()).await;
            assert!(report.would_redirect);
        }
        assert!(evaluator.evaluate(&settings(), &request()).await.redirect);
    }

    #[tokio::test]
    async fn test_diagnose_reports_every_check() {
        let mut s = settings();
        s.redirect_enabled = false;
        let mut req = request();
        req.user_agent = "curl/8.0".to_string();

        let report = evaluator().diagnose(&s, &req).await;
        assert!(!report.would_redirect);
        assert_eq!(report.reasons, vec![Reason::Disabled, Reason::BotDetected]);
        assert_eq!(report.checks.len(), 10);
        assert!(report.bot.is_blocked());
    }

    #[test]
    fn test_referrer_matches() {
        assert!(referrer_matches("https://www.google.com/search", "google.com"));
        assert!(referrer_matches("https://news.google.com/", "GOOGLE.com"));
        assert!(referrer_matches("https://google.com", "www.google.com"));
        assert!(!referrer_matches("https://notgoogle.com/", "google.com"));
        assert!(!referrer_matches("https://google.com.evil.io/", "google.com"));
        assert!(!referrer_matches("not a url", "google.com"));
        assert!(!referrer_matches("https://google.com/", ""));
    }

    #[test]
    fn test_reason_labels_serialize() {
        let json = serde_json::to_string(&vec![Reason::RateLimited, Reason::HttpsDowngradeBlocked]).unwrap();
        assert_eq!(json, r#"["rate limited","https downgrade blocked"]"#);
    }

    #[tokio::test]
    async fn test_decision_serializes_target_as_string() {
        let decision = evaluator().evaluate(&settings(), &request()).await;

        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["redirect"], true);
        assert_eq!(json["target"], "https://example.com/");
    }

    #[test]
    fn test_request_path() {
        let mut req = request();
        req.request_uri = "?a=1".to_string();
        assert_eq!(req.path(), "/");
        req.request_uri = "/index?a=1#top".to_string();
        assert_eq!(req.path(), "/index");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::net::Ipv4Addr;

        fn run<F: std::future::Future>(future: F) -> F::Output {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(future)
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(20))]

            /// A disabled gate never redirects, whatever the request.
            #[test]
            fn disabled_never_redirects(ua in ".{0,40}", history in proptest::option::of(0u32..10)) {
                let mut s = settings();
                s.redirect_enabled = false;
                let mut req = request();
                req.user_agent = ua;
                req.history_length = history;

                let decision = run(evaluator().evaluate(&s, &req));
                prop_assert!(!decision.redirect);
                prop_assert_eq!(decision.reasons, vec![Reason::Disabled]);
            }

            /// Listed IPs are never redirected.
            #[test]
            fn listed_ips_never_redirect(octets in any::<[u8; 4]>(), blacklist in any::<bool>()) {
                let ip = IpAddr::V4(Ipv4Addr::from(octets));
                let mut s = settings();
                if blacklist {
                    s.blacklist_ips.insert(ip);
                } else {
                    s.whitelist_ips.insert(ip);
                }
                let mut req = request();
                req.client_ip = ip;

                let decision = run(evaluator().evaluate(&s, &req));
                prop_assert!(!decision.redirect);
                prop_assert_eq!(decision.block.is_some(), blacklist);
            }

            /// Any subdomain of the configured domain matches.
            #[test]
            fn subdomains_match(sub in "[a-z]{1,10}", label in "[a-z]{1,10}", tld in "[a-z]{2,4}") {
                let domain = format!("{}.{}", label, tld);
                let referrer = format!("https://{}.{}/path", sub, domain);
                prop_assert!(referrer_matches(&referrer, &domain));
                prop_assert!(referrer_matches(&referrer.to_uppercase(), &domain));
            }

            /// History lengths above the threshold pass, the rest fail.
            #[test]
            fn history_threshold(length in 0u32..20, min in 0u32..20) {
                let mut s = settings();
                s.min_history_length = min;
                let mut req = request();
                req.history_length = Some(length);

                let decision = run(evaluator().evaluate(&s, &req));
                prop_assert_eq!(decision.redirect, length > min);
            }
        }
    }
}
