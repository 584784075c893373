//! Database layer
//!
//! This module provides database abstraction for the Homegate settings store.
//! It supports:
//! - SQLite (default, for single-binary deployment)
//! - MySQL (for deployments that already run one)
//!
//! The database driver is selected based on configuration.
//!
//! # Usage
//!
//! ```ignore
//! use homegate::config::DatabaseConfig;
//! use homegate::db::{create_pool, migrations};
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//! pool.ping().await?;
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{create_pool, create_test_pool, DatabasePool};
