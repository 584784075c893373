//! Expiring key/value store shared by the gate
//!
//! Holds two kinds of entries:
//! - `redirect_rate:<md5>` window counters, written on every homepage hit
//! - `settings:redirect`, the cached settings snapshot
//!
//! Both need a per-entry TTL and the counters need a read-modify-write. The
//! in-memory backend (moka) is the default; the Redis backend lets several
//! gate instances share counters.

pub mod memory;
#[cfg(feature = "redis-cache")]
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, CacheDriver};

pub use memory::MemoryCache;
#[cfg(feature = "redis-cache")]
pub use redis::RedisCache;

/// Operations the gate needs from a backend.
///
/// The methods are generic over the stored type, so this is not object safe;
/// [`Cache`] dispatches over the concrete backends instead.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>>;

    /// Store `value`, replacing any previous entry and its TTL
    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Replace the value under `key` with `f(current)` and return it.
    ///
    /// `current` is `None` when the key is absent, expired or holds something
    /// that does not decode as `T`. The new value is stored with `ttl`.
    async fn update<T, F>(&self, key: &str, ttl: Duration, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> T + Send + 'static;
}

/// Backend selected by `cache.driver`
#[derive(Debug)]
pub enum Cache {
    Memory(MemoryCache),
    #[cfg(feature = "redis-cache")]
    Redis(RedisCache),
}

macro_rules! dispatch {
    ($cache:expr, $backend:ident => $call:expr) => {
        match $cache {
            Cache::Memory($backend) => $call,
            #[cfg(feature = "redis-cache")]
            Cache::Redis($backend) => $call,
        }
    };
}

#[async_trait]
impl CacheLayer for Cache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        dispatch!(self, backend => backend.get(key).await)
    }

    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        dispatch!(self, backend => backend.set(key, value, ttl).await)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        dispatch!(self, backend => backend.delete(key).await)
    }

    async fn update<T, F>(&self, key: &str, ttl: Duration, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> T + Send + 'static,
    {
        dispatch!(self, backend => backend.update(key, ttl, f).await)
    }
}

/// Build the configured backend.
///
/// Fails when Redis is selected without a URL, when the binary was built
/// without the `redis-cache` feature, or when Redis does not answer.
pub async fn create_cache(config: &CacheConfig) -> Result<Arc<Cache>> {
    let cache = match config.driver {
        CacheDriver::Memory => Cache::Memory(MemoryCache::with_capacity(memory::DEFAULT_MAX_CAPACITY)),
        CacheDriver::Redis => redis_backend(config).await?,
    };
    Ok(Arc::new(cache))
}

#[cfg(feature = "redis-cache")]
async fn redis_backend(config: &CacheConfig) -> Result<Cache> {
    let url = config.redis_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("cache.redis_url (or HOMEGATE_CACHE_REDIS_URL) is required for the redis driver")
    })?;
    Ok(Cache::Redis(RedisCache::new(url).await?))
}

#[cfg(not(feature = "redis-cache"))]
async fn redis_backend(_config: &CacheConfig) -> Result<Cache> {
    anyhow::bail!("the redis cache driver needs a build with the 'redis-cache' feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::settings::RedirectSettings;

    #[tokio::test]
    async fn test_settings_snapshot_through_enum() {
        let cache = create_cache(&CacheConfig::default()).await.unwrap();
        let settings = RedirectSettings {
            referrer_domain: "bing.com".to_string(),
            ..RedirectSettings::default()
        };

        cache.set("settings:redirect", &settings, Duration::from_secs(60)).await.unwrap();
        let cached: Option<RedirectSettings> = cache.get("settings:redirect").await.unwrap();
        assert_eq!(cached.map(|s| s.referrer_domain), Some("bing.com".to_string()));

        cache.delete("settings:redirect").await.unwrap();
        let cleared: Option<RedirectSettings> = cache.get("settings:redirect").await.unwrap();
        assert!(cleared.is_none());
    }

    #[tokio::test]
    async fn test_counter_update_through_enum() {
        let cache = create_cache(&CacheConfig::default()).await.unwrap();

        let mut last = 0;
        for _ in 0..3 {
            last = cache
                .update("redirect_rate:abc", Duration::from_secs(300), |n: Option<u32>| n.unwrap_or(0) + 1)
                .await
                .unwrap();
        }
        assert_eq!(last, 3);
    }

    #[cfg(not(feature = "redis-cache"))]
    #[tokio::test]
    async fn test_redis_driver_needs_feature() {
        let config = CacheConfig {
            driver: CacheDriver::Redis,
            redis_url: Some("redis://localhost:6379".to_string()),
            ttl_seconds: 3600,
        };

        let err = create_cache(&config).await.unwrap_err().to_string();
        assert!(err.contains("redis-cache"));
    }

    #[cfg(feature = "redis-cache")]
    #[tokio::test]
    async fn test_redis_driver_needs_url() {
        let config = CacheConfig {
            driver: CacheDriver::Redis,
            redis_url: None,
            ttl_seconds: 3600,
        };

        let err = create_cache(&config).await.unwrap_err().to_string();
        assert!(err.contains("redis_url"));
    }
}
