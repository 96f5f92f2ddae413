//! Cron-driven triggers for backup configurations.

pub mod cron;
pub mod planner;

pub use cron::CronSchedule;
pub use planner::{ConfigurationDraft, ScheduledBackupPlanner};
