//! Settings repository
//!
//! String key/value storage for the redirect settings.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::collections::HashMap;

use crate::db::DatabasePool;

/// A setting key-value pair
#[derive(Debug, Clone)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Repository trait for settings operations
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Get all settings
    async fn get_all(&self) -> Result<Vec<Setting>>;

    /// Get multiple settings by keys; missing keys are absent from the map
    async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, String>>;

    /// Set multiple settings at once, all or nothing
    async fn set_many(&self, settings: &HashMap<String, String>) -> Result<()>;
}

/// SQLx-based settings repository
pub struct SqlxSettingsRepository {
    pool: DatabasePool,
}

impl SqlxSettingsRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for SqlxSettingsRepository {
    async fn get_all(&self) -> Result<Vec<Setting>> {
        match &self.pool {
            DatabasePool::Sqlite(pool) => get_all_sqlite(pool).await,
            DatabasePool::Mysql(pool) => get_all_mysql(pool).await,
        }
    }

    async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let wanted: Vec<&str> = keys.to_vec();
        let all = self.get_all().await?;
        Ok(all
            .into_iter()
            .filter(|s| wanted.contains(&s.key.as_str()))
            .map(|s| (s.key, s.value))
            .collect())
    }

    async fn set_many(&self, settings: &HashMap<String, String>) -> Result<()> {
        match &self.pool {
            DatabasePool::Sqlite(pool) => set_many_sqlite(pool, settings).await,
            DatabasePool::Mysql(pool) => set_many_mysql(pool, settings).await,
        }
    }
}

// SQLite implementations
async fn get_all_sqlite(pool: &SqlitePool) -> Result<Vec<Setting>> {
    let rows = sqlx::query("SELECT key, value, updated_at FROM settings ORDER BY key")
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|r| Setting {
        key: r.get("key"),
        value: r.get("value"),
        updated_at: r.get("updated_at"),
    }).collect())
}

async fn set_many_sqlite(pool: &SqlitePool, settings: &HashMap<String, String>) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (key, value) in settings {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP"
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

// MySQL implementations
async fn get_all_mysql(pool: &MySqlPool) -> Result<Vec<Setting>> {
    let rows = sqlx::query("SELECT `key`, value, updated_at FROM settings ORDER BY `key`")
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|r| Setting {
        key: r.get("key"),
        value: r.get("value"),
        updated_at: r.get("updated_at"),
    }).collect())
}

async fn set_many_mysql(pool: &MySqlPool, settings: &HashMap<String, String>) -> Result<()> {
    let mut tx = pool.begin().await?;
    for (key, value) in settings {
        sqlx::query(
            "INSERT INTO settings (`key`, value) VALUES (?, ?)
             ON DUPLICATE KEY UPDATE value = VALUES(value)"
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
