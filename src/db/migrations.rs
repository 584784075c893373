//! Database migrations module
//!
//! Code-based migrations for the Homegate settings store. All migrations are
//! embedded as SQL strings for both SQLite and MySQL.
//!
//! # Usage
//!
//! ```ignore
//! use homegate::db::{create_pool, migrations};
//!
//! let pool = create_pool(&config).await?;
//! migrations::run_migrations(&pool).await?;
//! ```

use anyhow::{Context, Result};
use sqlx::{MySqlPool, Row, SqlitePool};

use super::DatabasePool;

/// A database migration with SQL for both SQLite and MySQL
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version number (must be unique and sequential)
    pub version: i32,
    /// Human-readable migration name
    pub name: &'static str,
    /// SQL statements for SQLite
    pub up_sqlite: &'static str,
    /// SQL statements for MySQL
    pub up_mysql: &'static str,
}

/// All migrations, applied in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_settings",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS settings (
                key VARCHAR(100) PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS settings (
                `key` VARCHAR(100) PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
        "#,
    },
    // Seeded values mirror RedirectSettings::default()
    Migration {
        version: 2,
        name: "seed_redirect_settings",
        up_sqlite: r#"
            INSERT OR IGNORE INTO settings (key, value) VALUES ('redirect_enabled', '1');
            INSERT OR IGNORE INTO settings (key, value) VALUES ('redirect_url', 'https://example.com');
            INSERT OR IGNORE INTO settings (key, value) VALUES ('redirect_delay_ms', '100');
            INSERT OR IGNORE INTO settings (key, value) VALUES ('referrer_check_enabled', '1');
            INSERT OR IGNORE INTO settings (key, value) VALUES ('referrer_domain', 'google.com');
            INSERT OR IGNORE INTO settings (key, value) VALUES ('history_check_enabled', '1');
            INSERT OR IGNORE INTO settings (key, value) VALUES ('min_history_length', '1');
            INSERT OR IGNORE INTO settings (key, value) VALUES ('whitelist_ips', '');
            INSERT OR IGNORE INTO settings (key, value) VALUES ('blacklist_ips', '');
            INSERT OR IGNORE INTO settings (key, value) VALUES ('logging_enabled', '0');
        "#,
        up_mysql: r#"
            INSERT IGNORE INTO settings (`key`, value) VALUES ('redirect_enabled', '1');
            INSERT IGNORE INTO settings (`key`, value) VALUES ('redirect_url', 'https://example.com');
            INSERT IGNORE INTO settings (`key`, value) VALUES ('redirect_delay_ms', '100');
            INSERT IGNORE INTO settings (`key`, value) VALUES ('referrer_check_enabled', '1');
            INSERT IGNORE INTO settings (`key`, value) VALUES ('referrer_domain', 'google.com');
            INSERT IGNORE INTO settings (`key`, value) VALUES ('history_check_enabled', '1');
            INSERT IGNORE INTO settings (`key`, value) VALUES ('min_history_length', '1');
            INSERT IGNORE INTO settings (`key`, value) VALUES ('whitelist_ips', '');
            INSERT IGNORE INTO settings (`key`, value) VALUES ('blacklist_ips', '');
            INSERT IGNORE INTO settings (`key`, value) VALUES ('logging_enabled', '0');
        "#,
    },
];

/// Run all pending migrations
///
/// Returns the number of migrations applied.
pub async fn run_migrations(pool: &DatabasePool) -> Result<usize> {
    create_migrations_table(pool).await?;

    let applied = applied_versions(pool).await?;
    let mut count = 0;

    for migration in MIGRATIONS {
        if !applied.contains(&i64::from(migration.version)) {
            tracing::info!(
                "Applying migration {}: {}",
                migration.version,
                migration.name
            );
            apply_migration(pool, migration)
                .await
                .with_context(|| format!("Failed to apply migration: {}", migration.name))?;
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!("Applied {} migration(s)", count);
    } else {
        tracing::debug!("No pending migrations");
    }

    Ok(count)
}

async fn create_migrations_table(pool: &DatabasePool) -> Result<()> {
    match pool {
        DatabasePool::Sqlite(pool) => {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS _migrations (
                    version INTEGER PRIMARY KEY,
                    name VARCHAR(255) NOT NULL UNIQUE,
                    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
                )
                "#,
            )
            .execute(pool)
            .await?;
        }
        DatabasePool::Mysql(pool) => {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS _migrations (
                    version INT PRIMARY KEY,
                    name VARCHAR(255) NOT NULL UNIQUE,
                    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
                )
                "#,
            )
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

async fn applied_versions(pool: &DatabasePool) -> Result<Vec<i64>> {
    match pool {
        DatabasePool::Sqlite(pool) => {
            let rows = sqlx::query("SELECT version FROM _migrations ORDER BY version")
                .fetch_all(pool)
                .await?;
            Ok(rows.iter().map(|row| row.get::<i64, _>("version")).collect())
        }
        DatabasePool::Mysql(pool) => {
            let rows = sqlx::query("SELECT version FROM _migrations ORDER BY version")
                .fetch_all(pool)
                .await?;
            Ok(rows
                .iter()
                .map(|row| i64::from(row.get::<i32, _>("version")))
                .collect())
        }
    }
}

async fn apply_migration(pool: &DatabasePool, migration: &Migration) -> Result<()> {
    match pool {
        DatabasePool::Sqlite(pool) => apply_migration_sqlite(pool, migration).await,
        DatabasePool::Mysql(pool) => apply_migration_mysql(pool, migration).await,
    }
}

async fn apply_migration_sqlite(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    for statement in split_sql_statements(migration.up_sqlite) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to execute: {}", truncate_sql(statement)))?;
    }

    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .execute(pool)
        .await?;

    Ok(())
}

async fn apply_migration_mysql(pool: &MySqlPool, migration: &Migration) -> Result<()> {
    for statement in split_sql_statements(migration.up_mysql) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to execute: {}", truncate_sql(statement)))?;
    }

    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Truncate SQL for error messages
fn truncate_sql(sql: &str) -> String {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
}

/// Split SQL into individual trimmed statements, dropping comment-only fragments
fn split_sql_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty() && !is_comment_only(stmt))
        .collect()
}

/// Check if a string contains only SQL comments
fn is_comment_only(s: &str) -> bool {
    s.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await.expect("Failed to create test pool");

        let applied = run_migrations(&pool).await.expect("Failed to run migrations");
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(applied_versions(&pool).await.unwrap().len(), MIGRATIONS.len());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = create_test_pool().await.expect("Failed to create test pool");

        run_migrations(&pool).await.expect("First run failed");
        let second = run_migrations(&pool).await.expect("Second run failed");
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_redirect_defaults_seeded() {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        run_migrations(&pool).await.expect("Failed to run migrations");

        let DatabasePool::Sqlite(sqlite) = &pool else {
            panic!("expected a SQLite pool");
        };
        let row = sqlx::query("SELECT value FROM settings WHERE key = 'referrer_domain'")
            .fetch_one(sqlite)
            .await
            .expect("Failed to query settings");

        let value: String = row.get("value");
        assert_eq!(value, "google.com");
    }

    #[test]
    fn test_split_sql_statements() {
        let sql = "CREATE TABLE a (id INT); CREATE TABLE b (id INT);";
        assert_eq!(split_sql_statements(sql).len(), 2);

        let sql_with_comments = "-- Comment\nCREATE TABLE a (id INT);\n-- trailing";
        assert_eq!(split_sql_statements(sql_with_comments).len(), 1);
    }

    #[test]
    fn test_is_comment_only() {
        assert!(is_comment_only("-- This is a comment"));
        assert!(is_comment_only("-- Line 1\n-- Line 2"));
        assert!(!is_comment_only("CREATE TABLE test"));
        assert!(!is_comment_only("-- Comment\nCREATE TABLE test"));
    }

    #[test]
    fn test_truncate_sql() {
        let long = "x".repeat(150);
        assert_eq!(truncate_sql(&long).len(), 103);
        assert_eq!(truncate_sql("short"), "short");
    }
}
