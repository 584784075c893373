//! Configuration management
//!
//! This module handles loading and parsing configuration for the Homegate service.
//! Configuration can be loaded from:
//! - config.yml file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.
//!
//! Redirect behaviour itself (target URL, referrer domain, IP lists, ...) is not
//! part of this file; it lives in the settings store and is edited at runtime
//! through the admin API.

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Redirect gate configuration
    #[serde(default)]
    pub gate: GateConfig,
    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminConfig,
    /// Site presentation
    #[serde(default)]
    pub site: SiteConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite or mysql)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "data/homegate.db".to_string()
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// MySQL
    Mysql,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache driver (memory or redis)
    #[serde(default)]
    pub driver: CacheDriver,
    /// Redis connection URL (optional)
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Default TTL in seconds for entries written without an explicit one
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            driver: CacheDriver::default(),
            redis_url: None,
            ttl_seconds: default_ttl(),
        }
    }
}

fn default_ttl() -> u64 {
    3600
}

/// Cache driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheDriver {
    /// In-memory cache (default)
    #[default]
    Memory,
    /// Redis cache
    Redis,
}

/// Redirect gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Path of the homepage; the only route the gate evaluates
    #[serde(default = "default_home_path")]
    pub home_path: String,
    /// Resolve the client IP and scheme from proxy headers (CF-Connecting-IP,
    /// X-Forwarded-For, X-Forwarded-Proto, ...). Any client can set these, so
    /// only enable this when a reverse proxy in front of the gate overwrites
    /// them. Otherwise the blacklist and the rate limit can be sidestepped.
    #[serde(default = "default_trust_proxy_headers")]
    pub trust_proxy_headers: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            home_path: default_home_path(),
            trust_proxy_headers: default_trust_proxy_headers(),
        }
    }
}

fn default_home_path() -> String {
    "/".to_string()
}

fn default_trust_proxy_headers() -> bool {
    false
}

/// Admin API configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Bearer token for the admin API. The admin API is disabled when unset.
    #[serde(default)]
    pub token: Option<String>,
}

/// Site presentation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site name shown on the homepage
    #[serde(default = "default_site_name")]
    pub name: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: default_site_name(),
        }
    }
}

fn default_site_name() -> String {
    "Homegate".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// tracing-subscriber filter directive, used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "homegate=info,tower_http=info".to_string()
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            }
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - HOMEGATE_SERVER_HOST
    /// - HOMEGATE_SERVER_PORT
    /// - HOMEGATE_DATABASE_DRIVER
    /// - HOMEGATE_DATABASE_URL
    /// - HOMEGATE_CACHE_DRIVER
    /// - HOMEGATE_CACHE_REDIS_URL
    /// - HOMEGATE_CACHE_TTL_SECONDS
    /// - HOMEGATE_GATE_HOME_PATH
    /// - HOMEGATE_GATE_TRUST_PROXY_HEADERS
    /// - HOMEGATE_ADMIN_TOKEN
    /// - HOMEGATE_SITE_NAME
    /// - HOMEGATE_LOG_FILTER
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        // Server configuration
        if let Ok(host) = std::env::var("HOMEGATE_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("HOMEGATE_SERVER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        // Database configuration
        if let Ok(driver) = std::env::var("HOMEGATE_DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "mysql" => self.database.driver = DatabaseDriver::Mysql,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(url) = std::env::var("HOMEGATE_DATABASE_URL") {
            self.database.url = url;
        }

        // Cache configuration
        if let Ok(driver) = std::env::var("HOMEGATE_CACHE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "memory" => self.cache.driver = CacheDriver::Memory,
                "redis" => self.cache.driver = CacheDriver::Redis,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(redis_url) = std::env::var("HOMEGATE_CACHE_REDIS_URL") {
            self.cache.redis_url = Some(redis_url);
        }
        if let Ok(ttl) = std::env::var("HOMEGATE_CACHE_TTL_SECONDS") {
            if let Ok(ttl) = ttl.parse::<u64>() {
                self.cache.ttl_seconds = ttl;
            }
        }

        // Gate configuration
        if let Ok(home_path) = std::env::var("HOMEGATE_GATE_HOME_PATH") {
            self.gate.home_path = home_path;
        }
        if let Ok(trust) = std::env::var("HOMEGATE_GATE_TRUST_PROXY_HEADERS") {
            match trust.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.gate.trust_proxy_headers = true,
                "0" | "false" | "no" => self.gate.trust_proxy_headers = false,
                _ => {}
            }
        }

        if let Ok(token) = std::env::var("HOMEGATE_ADMIN_TOKEN") {
            let token = token.trim().to_string();
            self.admin.token = if token.is_empty() { None } else { Some(token) };
        }
        if let Ok(name) = std::env::var("HOMEGATE_SITE_NAME") {
            self.site.name = name;
        }
        if let Ok(filter) = std::env::var("HOMEGATE_LOG_FILTER") {
            self.logging.filter = filter;
        }
    }

    /// Reject values that would leave the service unusable
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.gate.home_path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "gate.home_path must start with '/', got '{}'",
                self.gate.home_path
            )));
        }
        if self.cache.driver == CacheDriver::Redis && self.cache.redis_url.is_none() {
            return Err(ConfigError::ValidationError(
                "cache.redis_url is required when cache.driver is redis".to_string(),
            ));
        }
        Ok(())
    }
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
const ENV_VARS: &[&str] = &[
    "HOMEGATE_SERVER_HOST",
    "HOMEGATE_SERVER_PORT",
    "HOMEGATE_DATABASE_DRIVER",
    "HOMEGATE_DATABASE_URL",
    "HOMEGATE_CACHE_DRIVER",
    "HOMEGATE_CACHE_REDIS_URL",
    "HOMEGATE_CACHE_TTL_SECONDS",
    "HOMEGATE_GATE_HOME_PATH",
    "HOMEGATE_GATE_TRUST_PROXY_HEADERS",
    "HOMEGATE_ADMIN_TOKEN",
    "HOMEGATE_SITE_NAME",
    "HOMEGATE_LOG_FILTER",
];
