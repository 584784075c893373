//! Settings store connection pool
//!
//! The store holds a single small key/value table. It is read when the
//! settings cache misses and written by the admin API, so both drivers run
//! with a handful of connections and short acquire timeouts. A slow store
//! surfaces as a settings load error, which the gate turns into "no redirect".

use anyhow::{Context, Result};
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions},
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{DatabaseConfig, DatabaseDriver};

const MAX_CONNECTIONS: u32 = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);
/// Wait for a concurrent admin write instead of failing with SQLITE_BUSY
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection pool for the settings store
#[derive(Debug, Clone)]
pub enum DatabasePool {
    Sqlite(SqlitePool),
    Mysql(MySqlPool),
}

impl DatabasePool {
    /// Connect with the driver named in `config`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        match config.driver {
            DatabaseDriver::Sqlite => connect_sqlite(&config.url).await.map(Self::Sqlite),
            DatabaseDriver::Mysql => connect_mysql(&config.url).await.map(Self::Mysql),
        }
    }

    pub fn driver(&self) -> DatabaseDriver {
        match self {
            Self::Sqlite(_) => DatabaseDriver::Sqlite,
            Self::Mysql(_) => DatabaseDriver::Mysql,
        }
    }

    /// Check that the store answers
    pub async fn ping(&self) -> Result<()> {
        let result = match self {
            Self::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(drop),
            Self::Mysql(pool) => sqlx::query("SELECT 1").execute(pool).await.map(drop),
        };
        result.context("Settings store ping failed")
    }
}

fn is_memory_url(url: &str) -> bool {
    url == ":memory:" || url.starts_with("sqlite::memory:")
}

async fn connect_sqlite(url: &str) -> Result<SqlitePool> {
    if is_memory_url(url) {
        // Each connection to :memory: is its own database, so the pool keeps
        // exactly one and never recycles it
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        return SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite settings store");
    }

    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")).unwrap_or(url);
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(SQLITE_BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open SQLite settings store: {}", path))
}

async fn connect_mysql(url: &str) -> Result<MySqlPool> {
    let url = if url.starts_with("mysql://") {
        url.to_string()
    } else {
        format!("mysql://{}", url)
    };
    let options = MySqlConnectOptions::from_str(&url).context("Invalid MySQL URL")?;

    MySqlPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .context("Failed to connect to MySQL settings store")
}

/// Create the settings store pool from configuration
pub async fn create_pool(config: &DatabaseConfig) -> Result<DatabasePool> {
    DatabasePool::connect(config).await
}

/// In-memory SQLite store, as used by the test suites
pub async fn create_test_pool() -> Result<DatabasePool> {
    create_pool(&DatabaseConfig {
        driver: DatabaseDriver::Sqlite,
        url: ":memory:".to_string(),
    })
    .await
}
