//! Homegate - a homepage redirect gate
//!
//! Decides, per homepage request, whether the visitor should be sent to a
//! configured URL. The decision combines referrer, browser history, bot, IP
//! list and rate limit heuristics; see [`services::evaluator`].

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod services;
