//! API middleware
//!
//! Contains middleware for:
//! - The redirect gate (evaluates homepage requests)
//! - Admin authorization (static bearer token)
//! - Redirect statistics
//!
//! Also home to the shared [`AppState`] and the JSON [`ApiError`] type.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

use crate::api::home::{ClientRedirect, HomeRenderer};
use crate::config::{AdminConfig, GateConfig};
use crate::services::evaluator::{BlockReason, Decision, Delivery, Reason, RedirectEvaluator, RequestContext};
use crate::services::request_guard;
use crate::services::settings::SettingsService;
use crate::services::validation::is_public_ip;

// ============================================================================
// Redirect Statistics
// ============================================================================

/// Gate outcome counters using atomic operations (no locks)
pub struct RedirectStats {
    evaluated: AtomicU64,
    redirects: AtomicU64,
    blocked_bots: AtomicU64,
    blocked_ips: AtomicU64,
    referrer_mismatches: AtomicU64,
    rate_limited: AtomicU64,
    suspicious: AtomicU64,
    /// Application start time
    start_time: Instant,
}

/// Point-in-time copy of [`RedirectStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectStatsSnapshot {
    pub evaluated: u64,
    pub redirects: u64,
    pub blocked_bots: u64,
    pub blocked_ips: u64,
    pub referrer_mismatches: u64,
    pub rate_limited: u64,
    pub suspicious: u64,
    pub uptime_seconds: u64,
}

impl RedirectStats {
    pub fn new() -> Self {
        Self {
            evaluated: AtomicU64::new(0),
            redirects: AtomicU64::new(0),
            blocked_bots: AtomicU64::new(0),
            blocked_ips: AtomicU64::new(0),
            referrer_mismatches: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            suspicious: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Count one evaluated request
    pub fn record(&self, decision: &Decision) {
        self.evaluated.fetch_add(1, Ordering::Relaxed);
        if decision.redirect {
            self.redirects.fetch_add(1, Ordering::Relaxed);
        }
        for reason in &decision.reasons {
            let counter = match reason {
                Reason::BotDetected => &self.blocked_bots,
                Reason::IpBlocked => &self.blocked_ips,
                Reason::ReferrerMismatch => &self.referrer_mismatches,
                Reason::RateLimited => &self.rate_limited,
                Reason::SuspiciousRequest => &self.suspicious,
                _ => continue,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a request turned away by the URI screen before evaluation
    pub fn record_rejected(&self) {
        self.suspicious.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RedirectStatsSnapshot {
        RedirectStatsSnapshot {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
            blocked_bots: self.blocked_bots.load(Ordering::Relaxed),
            blocked_ips: self.blocked_ips.load(Ordering::Relaxed),
            referrer_mismatches: self.referrer_mismatches.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            suspicious: self.suspicious.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for RedirectStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub settings_service: Arc<SettingsService>,
    pub evaluator: Arc<RedirectEvaluator>,
    pub redirect_stats: Arc<RedirectStats>,
    pub home: Arc<HomeRenderer>,
    pub gate: Arc<GateConfig>,
    pub admin: Arc<AdminConfig>,
}

/// Error response for API errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.error.code.as_str() {
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "FORBIDDEN" => StatusCode::FORBIDDEN,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self)).into_response()
    }
}

// ============================================================================
// Admin authorization
// ============================================================================

/// Extract bearer token from request
fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn tokens_match(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Admin authorization middleware
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state
        .admin
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::forbidden("Admin API is disabled"))?;

    let token = extract_bearer_token(&request)
        .ok_or_else(|| ApiError::unauthorized("Missing authentication token"))?;

    if !tokens_match(token, expected) {
        tracing::warn!("Rejected admin request with invalid token");
        return Err(ApiError::unauthorized("Invalid token"));
    }

    Ok(next.run(request).await)
}

// ============================================================================
// Redirect gate
// ============================================================================

/// Proxy headers carrying the client address, in order of preference
const CLIENT_IP_HEADERS: &[&str] = &[
    "cf-connecting-ip",
    "client-ip",
    "x-forwarded-for",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

const HISTORY_LENGTH_HEADER: &str = "x-history-length";

/// Redirect gate middleware
///
/// Every request URI is screened for attack patterns first and rejected with
/// a 403 on a match, whatever the redirect settings say. After that only
/// requests for the homepage are evaluated. Blocked requests get a 403,
/// approved ones a 302 or, when the browser has to confirm the history
/// length, a [`ClientRedirect`] extension for the homepage handler.
pub async fn redirect_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let uri = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    if let Some(threat) = request_guard::inspect_uri(uri) {
        state.redirect_stats.record_rejected();
        tracing::warn!(%uri, %threat, "Rejected suspicious request");
        return ApiError::forbidden("Request rejected").into_response();
    }

    if !state.evaluator.is_in_scope(request.uri().path()) {
        return next.run(request).await;
    }

    let context = request_context(&request, state.gate.trust_proxy_headers);
    let settings = state.settings_service.redirect_settings_or_fail_safe().await;
    let decision = state.evaluator.evaluate(&settings, &context).await;
    state.redirect_stats.record(&decision);

    match decision.block {
        Some(BlockReason::IpBlocked) => {
            return ApiError::forbidden("Access denied").into_response();
        }
        Some(BlockReason::Suspicious(threat)) => {
            tracing::warn!(ip = %context.client_ip, %threat, "Rejected suspicious request");
            return ApiError::forbidden("Request rejected").into_response();
        }
        None => {}
    }

    if let (true, Some(target)) = (decision.redirect, &decision.target) {
        match decision.delivery {
            Delivery::Server => return server_redirect(target),
            Delivery::Client => {
                request
                    .extensions_mut()
                    .insert(ClientRedirect::new(target, &settings));
            }
        }
    }

    next.run(request).await
}

/// 302 to `target` with caching disabled
pub fn server_redirect(target: &Url) -> Response {
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, target.as_str()),
            (HeaderName::from_static("x-redirect-by"), "homegate"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
    )
        .into_response()
}

/// Build the evaluator input for a request
pub fn request_context(request: &Request, trust_proxy_headers: bool) -> RequestContext {
    let headers = request.headers();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    RequestContext {
        client_ip: client_ip(headers, peer, trust_proxy_headers),
        user_agent: header_str(headers, header::USER_AGENT.as_str())
            .unwrap_or_default()
            .to_string(),
        http_method: request.method().as_str().to_string(),
        referrer_url: header_str(headers, header::REFERER.as_str()).map(str::to_string),
        request_uri: request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: header_map(headers),
        is_secure: is_secure(request, trust_proxy_headers),
        history_length: header_str(headers, HISTORY_LENGTH_HEADER)
            .and_then(|v| v.trim().parse::<u32>().ok()),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Resolve the client address.
///
/// With trusted proxies, the first public address found in the proxy
/// headers wins. Otherwise, or when none is found, the socket peer is used.
/// IPv4-mapped IPv6 addresses (a dual-stack listener on `::`) come back as
/// plain IPv4 so they line up with the IP lists and rate limit keys.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy_headers: bool) -> IpAddr {
    if trust_proxy_headers {
        for name in CLIENT_IP_HEADERS {
            let Some(value) = header_str(headers, name) else {
                continue;
            };
            let candidates: Vec<IpAddr> = if *name == "forwarded" {
                forwarded_params(value, "for").filter_map(parse_ip_token).collect()
            } else {
                value.split(',').filter_map(parse_ip_token).collect()
            };
            if let Some(ip) = candidates
                .into_iter()
                .map(|ip| ip.to_canonical())
                .find(|ip| is_public_ip(*ip))
            {
                return ip;
            }
        }
    }

    peer.map(|ip| ip.to_canonical())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Parse `1.2.3.4`, `1.2.3.4:80`, `[2001:db8::1]:80` or a quoted form
fn parse_ip_token(token: &str) -> Option<IpAddr> {
    let token = token.trim().trim_matches('"');
    if let Ok(ip) = token.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = token.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    token
        .strip_prefix('[')
        .and_then(|rest| rest.split(']').next())
        .and_then(|inner| inner.parse().ok())
}

/// Values of `key=` pairs in an RFC 7239 `Forwarded` header
fn forwarded_params<'a>(value: &'a str, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    value
        .split([',', ';'])
        .filter_map(|pair| pair.split_once('='))
        .filter(move |(k, _)| k.trim().eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
}

fn is_secure(request: &Request, trust_proxy_headers: bool) -> bool {
    if request.uri().scheme_str() == Some("https") {
        return true;
    }
    if !trust_proxy_headers {
        return false;
    }

    let headers = request.headers();
    let forwarded_proto = header_str(headers, "x-forwarded-proto")
        .and_then(|v| v.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"));

    forwarded_proto
        || header_str(headers, "forwarded").is_some_and(|value| {
            forwarded_params(value, "proto")
                .any(|proto| proto.trim_matches('"').eq_ignore_ascii_case("https"))
        })
}

// ============================================================================
// Tests
// ============================================================================
