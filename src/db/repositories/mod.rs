//! Database repositories
//!
//! Repository pattern implementations for database access.

pub mod settings;

pub use settings::{Setting, SettingsRepository, SqlxSettingsRepository};
