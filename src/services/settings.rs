//! Settings service
//!
//! Redirect settings are stored as strings ("0"/"1" flags, comma separated IP
//! lists). This service is the only place that converts them: callers get a
//! typed [`RedirectSettings`] snapshot and never see the raw values.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::cache::{Cache, CacheLayer};
use crate::db::repositories::{SettingsRepository, SqlxSettingsRepository};
use crate::services::validation::{
    format_ip_list, parse_ip_list, parse_redirect_url, sanitize_domain,
};

/// Known setting keys
pub mod keys {
    pub const REDIRECT_ENABLED: &str = "redirect_enabled";
    pub const REDIRECT_URL: &str = "redirect_url";
    pub const REDIRECT_DELAY_MS: &str = "redirect_delay_ms";
    pub const REFERRER_CHECK_ENABLED: &str = "referrer_check_enabled";
    pub const REFERRER_DOMAIN: &str = "referrer_domain";
    pub const HISTORY_CHECK_ENABLED: &str = "history_check_enabled";
    pub const MIN_HISTORY_LENGTH: &str = "min_history_length";
    pub const WHITELIST_IPS: &str = "whitelist_ips";
    pub const BLACKLIST_IPS: &str = "blacklist_ips";
    pub const LOGGING_ENABLED: &str = "logging_enabled";

    pub const ALL: &[&str] = &[
        REDIRECT_ENABLED,
        REDIRECT_URL,
        REDIRECT_DELAY_MS,
        REFERRER_CHECK_ENABLED,
        REFERRER_DOMAIN,
        HISTORY_CHECK_ENABLED,
        MIN_HISTORY_LENGTH,
        WHITELIST_IPS,
        BLACKLIST_IPS,
        LOGGING_ENABLED,
    ];
}

/// Upper bound for the browser redirect delay
pub const MAX_DELAY_MS: u32 = 10_000;
/// Upper bound for the history length threshold
pub const MAX_HISTORY_LENGTH: u32 = 100;

const CACHE_KEY: &str = "settings:redirect";

/// Typed redirect settings snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectSettings {
    pub redirect_enabled: bool,
    pub redirect_url: String,
    pub redirect_delay_ms: u32,
    pub referrer_check_enabled: bool,
    pub referrer_domain: String,
    pub history_check_enabled: bool,
    pub min_history_length: u32,
    pub whitelist_ips: BTreeSet<IpAddr>,
    pub blacklist_ips: BTreeSet<IpAddr>,
    pub logging_enabled: bool,
}

impl Default for RedirectSettings {
    fn default() -> Self {
        Self {
            redirect_enabled: true,
            redirect_url: "https://example.com".to_string(),
            redirect_delay_ms: 100,
            referrer_check_enabled: true,
            referrer_domain: "google.com".to_string(),
            history_check_enabled: true,
            min_history_length: 1,
            whitelist_ips: BTreeSet::new(),
            blacklist_ips: BTreeSet::new(),
            logging_enabled: false,
        }
    }
}

impl RedirectSettings {
    /// Settings used when the store cannot be read: never redirect.
    pub fn fail_safe() -> Self {
        Self {
            redirect_enabled: false,
            ..Self::default()
        }
    }

    /// Build a snapshot from stored strings. Missing or unreadable values
    /// fall back to the defaults.
    pub fn from_raw(raw: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| raw.get(key).map(|v| v.trim());

        Self {
            redirect_enabled: get(keys::REDIRECT_ENABLED)
                .and_then(parse_flag)
                .unwrap_or(defaults.redirect_enabled),
            redirect_url: get(keys::REDIRECT_URL)
                .map(str::to_string)
                .unwrap_or(defaults.redirect_url),
            redirect_delay_ms: get(keys::REDIRECT_DELAY_MS)
                .and_then(|v| v.parse::<u32>().ok())
                .map(|v| v.min(MAX_DELAY_MS))
                .unwrap_or(defaults.redirect_delay_ms),
            referrer_check_enabled: get(keys::REFERRER_CHECK_ENABLED)
                .and_then(parse_flag)
                .unwrap_or(defaults.referrer_check_enabled),
            referrer_domain: get(keys::REFERRER_DOMAIN)
                .map(str::to_string)
                .unwrap_or(defaults.referrer_domain),
            history_check_enabled: get(keys::HISTORY_CHECK_ENABLED)
                .and_then(parse_flag)
                .unwrap_or(defaults.history_check_enabled),
            min_history_length: get(keys::MIN_HISTORY_LENGTH)
                .and_then(|v| v.parse::<u32>().ok())
                .map(|v| v.min(MAX_HISTORY_LENGTH))
                .unwrap_or(defaults.min_history_length),
            whitelist_ips: get(keys::WHITELIST_IPS)
                .map(|v| parse_ip_list(v).addresses)
                .unwrap_or_default(),
            blacklist_ips: get(keys::BLACKLIST_IPS)
                .map(|v| parse_ip_list(v).addresses)
                .unwrap_or_default(),
            logging_enabled: get(keys::LOGGING_ENABLED)
                .and_then(parse_flag)
                .unwrap_or(defaults.logging_enabled),
        }
    }

    /// Stored string form of this snapshot
    pub fn to_raw(&self) -> HashMap<String, String> {
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();
        HashMap::from([
            (keys::REDIRECT_ENABLED.to_string(), flag(self.redirect_enabled)),
            (keys::REDIRECT_URL.to_string(), self.redirect_url.clone()),
            (keys::REDIRECT_DELAY_MS.to_string(), self.redirect_delay_ms.to_string()),
            (keys::REFERRER_CHECK_ENABLED.to_string(), flag(self.referrer_check_enabled)),
            (keys::REFERRER_DOMAIN.to_string(), self.referrer_domain.clone()),
            (keys::HISTORY_CHECK_ENABLED.to_string(), flag(self.history_check_enabled)),
            (keys::MIN_HISTORY_LENGTH.to_string(), self.min_history_length.to_string()),
            (keys::WHITELIST_IPS.to_string(), format_ip_list(&self.whitelist_ips)),
            (keys::BLACKLIST_IPS.to_string(), format_ip_list(&self.blacklist_ips)),
            (keys::LOGGING_ENABLED.to_string(), flag(self.logging_enabled)),
        ])
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Partial update of the redirect settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRedirectSettingsInput {
    pub redirect_enabled: Option<bool>,
    pub redirect_url: Option<String>,
    pub redirect_delay_ms: Option<u32>,
    pub referrer_check_enabled: Option<bool>,
    pub referrer_domain: Option<String>,
    pub history_check_enabled: Option<bool>,
    pub min_history_length: Option<u32>,
    /// Comma separated IP list; invalid entries are dropped
    pub whitelist_ips: Option<String>,
    /// Comma separated IP list; invalid entries are dropped
    pub blacklist_ips: Option<String>,
    pub logging_enabled: Option<bool>,
}

/// Result of a successful update
#[derive(Debug, Clone, Serialize)]
pub struct SettingsUpdate {
    pub settings: RedirectSettings,
    /// Entries that were dropped while sanitising the input
    pub warnings: Vec<String>,
}

impl UpdateRedirectSettingsInput {
    /// Validate this update against `current` and return the merged snapshot.
    pub fn apply(self, current: &RedirectSettings) -> Result<SettingsUpdate, SettingsServiceError> {
        let mut next = current.clone();
        let mut warnings = Vec::new();

        if let Some(enabled) = self.redirect_enabled {
            next.redirect_enabled = enabled;
        }
        if let Some(url) = self.redirect_url {
            let parsed = parse_redirect_url(&url).map_err(|e| {
                SettingsServiceError::InvalidValue(format!("{}: {}", keys::REDIRECT_URL, e))
            })?;
            next.redirect_url = parsed.to_string();
        }
        if let Some(delay) = self.redirect_delay_ms {
            if delay > MAX_DELAY_MS {
                return Err(SettingsServiceError::InvalidValue(format!(
                    "{} must be between 0 and {}",
                    keys::REDIRECT_DELAY_MS,
                    MAX_DELAY_MS
                )));
            }
            next.redirect_delay_ms = delay;
        }
        if let Some(enabled) = self.referrer_check_enabled {
            next.referrer_check_enabled = enabled;
        }
        if let Some(domain) = self.referrer_domain {
            next.referrer_domain = if domain.trim().is_empty() {
                String::new()
            } else {
                sanitize_domain(&domain).ok_or_else(|| {
                    SettingsServiceError::InvalidValue(format!(
                        "{}: '{}' is not a domain name",
                        keys::REFERRER_DOMAIN,
                        domain
                    ))
                })?
            };
        }
        if let Some(enabled) = self.history_check_enabled {
            next.history_check_enabled = enabled;
        }
        if let Some(length) = self.min_history_length {
            if length > MAX_HISTORY_LENGTH {
                return Err(SettingsServiceError::InvalidValue(format!(
                    "{} must be between 0 and {}",
                    keys::MIN_HISTORY_LENGTH,
                    MAX_HISTORY_LENGTH
                )));
            }
            next.min_history_length = length;
        }
        if let Some(list) = self.whitelist_ips {
            let parsed = parse_ip_list(&list);
            warnings.extend(
                parsed
                    .rejected
                    .iter()
                    .map(|entry| format!("{}: ignored invalid IP '{}'", keys::WHITELIST_IPS, entry)),
            );
            next.whitelist_ips = parsed.addresses;
        }
        if let Some(list) = self.blacklist_ips {
            let parsed = parse_ip_list(&list);
            warnings.extend(
                parsed
                    .rejected
                    .iter()
                    .map(|entry| format!("{}: ignored invalid IP '{}'", keys::BLACKLIST_IPS, entry)),
            );
            next.blacklist_ips = parsed.addresses;
        }
        if let Some(enabled) = self.logging_enabled {
            next.logging_enabled = enabled;
        }

        Ok(SettingsUpdate { settings: next, warnings })
    }
}

/// Settings service errors
#[derive(Debug, Error)]
pub enum SettingsServiceError {
    #[error("Failed to load settings: {0}")]
    LoadError(String),

    #[error("Failed to save settings: {0}")]
    SaveError(String),

    #[error("Invalid setting value: {0}")]
    InvalidValue(String),
}

/// Settings service for the redirect configuration
pub struct SettingsService {
    repo: Arc<dyn SettingsRepository>,
    cache: Option<(Arc<Cache>, Duration)>,
}

impl SettingsService {
    /// Create a new settings service
    pub fn new(repo: Arc<dyn SettingsRepository>) -> Self {
        Self { repo, cache: None }
    }

    /// Create from SQLx repository
    pub fn from_sqlx(repo: SqlxSettingsRepository) -> Self {
        Self::new(Arc::new(repo))
    }

    /// Keep the loaded snapshot in `cache` for `ttl`
    pub fn with_cache(mut self, cache: Arc<Cache>, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    /// Load the current redirect settings
    pub async fn redirect_settings(&self) -> Result<RedirectSettings, SettingsServiceError> {
        if let Some((cache, _)) = &self.cache {
            match cache.get::<RedirectSettings>(CACHE_KEY).await {
                Ok(Some(settings)) => return Ok(settings),
                Ok(None) => {}
                Err(e) => tracing::debug!("Settings cache read failed: {}", e),
            }
        }

        let raw = self.repo.get_many(keys::ALL).await
            .map_err(|e| SettingsServiceError::LoadError(e.to_string()))?;
        let settings = RedirectSettings::from_raw(&raw);

        if let Some((cache, ttl)) = &self.cache {
            if let Err(e) = cache.set(CACHE_KEY, &settings, *ttl).await {
                tracing::debug!("Settings cache write failed: {}", e);
            }
        }

        Ok(settings)
    }

    /// Load the settings, or the never-redirect snapshot if the store is down
    pub async fn redirect_settings_or_fail_safe(&self) -> RedirectSettings {
        match self.redirect_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Redirect disabled for this request: {}", e);
                RedirectSettings::fail_safe()
            }
        }
    }

    /// Validate and persist a partial update
    pub async fn update_redirect_settings(
        &self,
        input: UpdateRedirectSettingsInput,
    ) -> Result<SettingsUpdate, SettingsServiceError> {
        let current = self.redirect_settings().await?;
        let update = input.apply(&current)?;

        for warning in &update.warnings {
            tracing::warn!("{}", warning);
        }

        self.repo.set_many(&update.settings.to_raw()).await
            .map_err(|e| SettingsServiceError::SaveError(e.to_string()))?;

        if let Some((cache, _)) = &self.cache {
            if let Err(e) = cache.delete(CACHE_KEY).await {
                tracing::warn!("Failed to invalidate settings cache: {}", e);
            }
        }

        tracing::info!("Redirect settings updated");
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db::repositories::Setting;
    use async_trait::async_trait;
    use tokio::sync::RwLock;

    /// In-memory repository double
    #[derive(Default)]
    struct FakeRepo {
        values: RwLock<HashMap<String, String>>,
        fail: bool,
    }

    #[async_trait]
    impl SettingsRepository for FakeRepo {
        async fn get_all(&self) -> anyhow::Result<Vec<Setting>> {
            if self.fail {
                anyhow::bail!("store offline");
            }
            Ok(self.values.read().await.iter().map(|(k, v)| Setting {
                key: k.clone(),
                value: v.clone(),
                updated_at: chrono::Utc::now(),
            }).collect())
        }

        async fn get_many(&self, keys: &[&str]) -> anyhow::Result<HashMap<String, String>> {
            if self.fail {
                anyhow::bail!("store offline");
            }
            let values = self.values.read().await;
            Ok(keys.iter()
                .filter_map(|k| values.get(*k).map(|v| (k.to_string(), v.clone())))
                .collect())
        }

        async fn set_many(&self, settings: &HashMap<String, String>) -> anyhow::Result<()> {
            self.values.write().await.extend(settings.clone());
            Ok(())
        }
    }

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_from_raw_converts_strings() {
        let settings = RedirectSettings::from_raw(&raw(&[
            (keys::REDIRECT_ENABLED, "0"),
            (keys::REDIRECT_URL, "https://landing.example.org"),
            (keys::REDIRECT_DELAY_MS, "250"),
            (keys::REFERRER_CHECK_ENABLED, "1"),
            (keys::REFERRER_DOMAIN, "bing.com"),
            (keys::HISTORY_CHECK_ENABLED, "false"),
            (keys::MIN_HISTORY_LENGTH, "3"),
            (keys::WHITELIST_IPS, "1.2.3.4, nope"),
            (keys::BLACKLIST_IPS, ""),
            (keys::LOGGING_ENABLED, "yes"),
        ]));

        assert!(!settings.redirect_enabled);
        assert_eq!(settings.redirect_url, "https://landing.example.org");
        assert_eq!(settings.redirect_delay_ms, 250);
        assert!(settings.referrer_check_enabled);
        assert_eq!(settings.referrer_domain, "bing.com");
        assert!(!settings.history_check_enabled);
        assert_eq!(settings.min_history_length, 3);
        assert_eq!(settings.whitelist_ips.len(), 1);
        assert!(settings.blacklist_ips.is_empty());
        assert!(settings.logging_enabled);
    }

    #[test]
    fn test_from_raw_falls_back_to_defaults() {
        let settings = RedirectSettings::from_raw(&raw(&[
            (keys::REDIRECT_ENABLED, "maybe"),
            (keys::REDIRECT_DELAY_MS, "-5"),
            (keys::MIN_HISTORY_LENGTH, "5000"),
        ]));

        assert!(settings.redirect_enabled);
        assert_eq!(settings.redirect_delay_ms, 100);
        assert_eq!(settings.min_history_length, MAX_HISTORY_LENGTH);
        assert_eq!(settings.referrer_domain, "google.com");
    }

    #[test]
    fn test_raw_round_trip() {
        let mut settings = RedirectSettings::default();
        settings.blacklist_ips.insert("9.9.9.9".parse().unwrap());
        settings.logging_enabled = true;

        assert_eq!(RedirectSettings::from_raw(&settings.to_raw()), settings);
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let current = RedirectSettings::default();

        let bad_url = UpdateRedirectSettingsInput {
            redirect_url: Some("http://localhost/".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad_url.apply(&current), Err(SettingsServiceError::InvalidValue(_))));

        let bad_delay = UpdateRedirectSettingsInput {
            redirect_delay_ms: Some(MAX_DELAY_MS + 1),
            ..Default::default()
        };
        assert!(bad_delay.apply(&current).is_err());

        let bad_domain = UpdateRedirectSettingsInput {
            referrer_domain: Some("not a domain".to_string()),
            ..Default::default()
        };
        assert!(bad_domain.apply(&current).is_err());
    }

    #[test]
    fn test_apply_sanitises_domain_and_ip_lists() {
        let update = UpdateRedirectSettingsInput {
            referrer_domain: Some("https://www.Bing.com/".to_string()),
            blacklist_ips: Some("1.1.1.1, 300.1.1.1".to_string()),
            ..Default::default()
        }
        .apply(&RedirectSettings::default())
        .unwrap();

        assert_eq!(update.settings.referrer_domain, "bing.com");
        assert_eq!(update.settings.blacklist_ips.len(), 1);
        assert_eq!(update.warnings.len(), 1);
        assert!(update.warnings[0].contains("300.1.1.1"));
    }

    #[tokio::test]
    async fn test_service_loads_defaults_from_empty_store() {
        let service = SettingsService::new(Arc::new(FakeRepo::default()));
        let settings = service.redirect_settings().await.unwrap();
        assert_eq!(settings, RedirectSettings::default());
    }

    #[tokio::test]
    async fn test_service_fail_safe_when_store_fails() {
        let repo = FakeRepo { fail: true, ..Default::default() };
        let service = SettingsService::new(Arc::new(repo));

        assert!(service.redirect_settings().await.is_err());
        assert!(!service.redirect_settings_or_fail_safe().await.redirect_enabled);
    }

    #[tokio::test]
    async fn test_update_persists_and_invalidates_cache() {
        let cache = Arc::new(Cache::Memory(MemoryCache::new()));
        let service = SettingsService::new(Arc::new(FakeRepo::default()))
            .with_cache(cache.clone(), Duration::from_secs(60));

        // Warm the cache
        assert!(service.redirect_settings().await.unwrap().redirect_enabled);

        service.update_redirect_settings(UpdateRedirectSettingsInput {
            redirect_enabled: Some(false),
            ..Default::default()
        }).await.unwrap();

        assert!(!service.redirect_settings().await.unwrap().redirect_enabled);
    }
}
