//! Redis backend
//!
//! Lets several gate instances share rate-limit counters and the settings
//! snapshot. Keys are namespaced under `homegate:` so the server can be
//! shared with other applications. Values are JSON.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use super::CacheLayer;

const NAMESPACE: &str = "homegate:";

pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

/// Redis expiries are whole seconds; anything shorter still lives one second
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn namespaced(key: &str) -> String {
    format!("{}{}", NAMESPACE, key)
}

impl RedisCache {
    /// Connect and check that the server answers
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Invalid Redis URL")?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .context("Redis did not answer PING")?;

        Ok(Self { connection })
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get(namespaced(key))
            .await
            .with_context(|| format!("Redis GET {} failed", key))
    }

    async fn write(&self, key: &str, json: String, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.set_ex(namespaced(key), json, ttl_seconds(ttl))
            .await
            .with_context(|| format!("Redis SETEX {} failed", key))
    }
}

#[async_trait]
impl CacheLayer for RedisCache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.read(key).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .with_context(|| format!("Cached value under {} is not valid JSON", key)),
            None => Ok(None),
        }
    }

    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        self.write(key, serde_json::to_string(value)?, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del(namespaced(key))
            .await
            .with_context(|| format!("Redis DEL {} failed", key))
    }

    /// GET then SETEX. Two instances racing on one counter can lose an
    /// increment, which the rate limiter tolerates.
    async fn update<T, F>(&self, key: &str, ttl: Duration, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> T + Send + 'static,
    {
        let current = self
            .read(key)
            .await?
            .and_then(|json| serde_json::from_str::<T>(&json).ok());

        let next = f(current);
        self.write(key, serde_json::to_string(&next)?, ttl).await?;
        Ok(next)
    }
}
