//! Fleet-wide PostgreSQL backup and restore orchestration.
//!
//! A [`app::BackupApp`] ties together the subprocess runner, the batch
//! orchestrator, the restore tracker, the cron planner and retention.

pub mod app;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod models;
pub mod restore;
pub mod retention;
pub mod schedule;
pub mod store;
pub mod tenant;
pub mod utils;

#[cfg(test)]
mod testing;

pub use app::BackupApp;
pub use errors::{AppError, Result};
