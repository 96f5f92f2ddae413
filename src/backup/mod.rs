pub mod batch;
pub mod runner;

pub use batch::{BatchOrchestrator, BatchRequest, ConfigurationRef};
pub use runner::{BackupRunner, Outcome, PgToolsRunner};
