//! Services layer - Business logic
//!
//! This module contains the redirect gate services:
//! - Settings loading, conversion and validated updates
//! - Request classification (bots, malicious URIs)
//! - Per-IP rate limiting
//! - The eligibility pipeline that combines them

pub mod bot_detection;
pub mod evaluator;
pub mod rate_limiter;
pub mod request_guard;
pub mod settings;
pub mod validation;

pub use bot_detection::{classify, is_whitelisted_crawler, BotSignal, BotVerdict, BrowserHeaders};
pub use evaluator::{
    referrer_matches, BlockReason, CheckResult, Decision, Delivery, DiagnosticReport, Reason,
    RedirectEvaluator, RequestContext,
};
pub use rate_limiter::{RateLimitOutcome, RateLimitPolicy, RedirectRateLimiter};
pub use request_guard::{inspect_uri, ThreatKind};
pub use settings::{
    RedirectSettings, SettingsService, SettingsServiceError, SettingsUpdate,
    UpdateRedirectSettingsInput,
};
pub use validation::{parse_redirect_url, sanitize_domain, InvalidRedirectUrl};
