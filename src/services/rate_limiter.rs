//! Per-IP rate limiter for homepage redirects
//!
//! Each client IP gets a fixed window: the first request starts it, at most
//! `max_attempts` requests inside it are allowed, and the first request after
//! the window has run out starts a new one. Counters live in the cache layer
//! under `redirect_rate:<md5 of ip>` and expire with the window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Cache, CacheLayer};

const KEY_PREFIX: &str = "redirect_rate:";

/// Window size and allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(300),
        }
    }
}

/// Stored counter for one IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl WindowCounter {
    fn is_expired(&self, now: DateTime<Utc>, policy: &RateLimitPolicy) -> bool {
        let elapsed_ms = (now - self.window_start).num_milliseconds();
        elapsed_ms > policy.window.as_millis() as i64
    }

    /// Count one more attempt. The count stops one past the limit.
    fn record(current: Option<Self>, now: DateTime<Utc>, policy: &RateLimitPolicy) -> Self {
        match current {
            Some(counter) if !counter.is_expired(now, policy) => Self {
                count: counter.count.saturating_add(1).min(policy.max_attempts + 1),
                window_start: counter.window_start,
            },
            _ => Self {
                count: 1,
                window_start: now,
            },
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RateLimitOutcome {
    /// Within the allowance; `attempts` counts this request
    Allowed { attempts: u32 },
    /// Allowance used up for the current window
    Limited { attempts: u32 },
    /// The counter store failed; the request is let through
    Inconclusive,
}

/// Fixed-window rate limiter keyed by client IP
pub struct RedirectRateLimiter {
    cache: Arc<Cache>,
    policy: RateLimitPolicy,
}

impl RedirectRateLimiter {
    /// Create a limiter with the default 5 per 300s policy
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            policy: RateLimitPolicy::default(),
        }
    }

    /// Counter key for an IP. The address itself is never stored.
    pub fn key_for(ip: IpAddr) -> String {
        format!("{}{:x}", KEY_PREFIX, md5::compute(ip.to_string()))
    }

    /// Record an attempt from `ip` at `now` and report whether it is allowed
    pub async fn check_at(&self, ip: IpAddr, now: DateTime<Utc>) -> RateLimitOutcome {
        let policy = self.policy;
        let result = self
            .cache
            .update(&Self::key_for(ip), policy.window, move |current: Option<WindowCounter>| {
                WindowCounter::record(current, now, &policy)
            })
            .await;

        match result {
            Ok(counter) if counter.count > policy.max_attempts => {
                tracing::debug!(%ip, attempts = counter.count, "Redirect rate limit reached");
                RateLimitOutcome::Limited { attempts: counter.count }
            }
            Ok(counter) => RateLimitOutcome::Allowed { attempts: counter.count },
            Err(e) => {
                tracing::warn!(%ip, error = %e, "Rate limit store unavailable, allowing request");
                RateLimitOutcome::Inconclusive
            }
        }
    }

    /// Report what the next attempt would get without recording one
    pub async fn peek(&self, ip: IpAddr) -> RateLimitOutcome {
        self.peek_at(ip, Utc::now()).await
    }

    pub async fn peek_at(&self, ip: IpAddr, now: DateTime<Utc>) -> RateLimitOutcome {
        match self.cache.get::<WindowCounter>(&Self::key_for(ip)).await {
            Ok(Some(counter)) if !counter.is_expired(now, &self.policy) => {
                if counter.count >= self.policy.max_attempts {
                    RateLimitOutcome::Limited { attempts: counter.count }
                } else {
                    RateLimitOutcome::Allowed { attempts: counter.count + 1 }
                }
            }
            Ok(_) => RateLimitOutcome::Allowed { attempts: 1 },
            Err(e) => {
                tracing::warn!(%ip, error = %e, "Rate limit store unavailable");
                RateLimitOutcome::Inconclusive
            }
        }
    }
}
