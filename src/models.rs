//! Entities shared by the orchestrator, the tracker, the planner and the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Anything kept in a [`crate::store::Repository`].
pub trait Entity: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Manual,
    Scheduled,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Manual => "manual",
            RunKind::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of runs and restore operations. Leaves `InProgress` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::InProgress => "in-progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum Initiator {
    System,
    User(String),
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initiator::System => f.write_str("system"),
            Initiator::User(name) => write!(f, "user:{}", name),
        }
    }
}

/// Who is asking. Administrators may target any database; tenants only their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    System,
    Admin { label: String },
    Tenant { tenant_id: String, label: String },
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        !matches!(self, Caller::Tenant { .. })
    }

    pub fn initiator(&self) -> Initiator {
        match self {
            Caller::System => Initiator::System,
            Caller::Admin { label } | Caller::Tenant { label, .. } => Initiator::User(label.clone()),
        }
    }
}

/// Engine login used to run a subprocess as a specific identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOwner {
    pub tenant_id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseResult {
    pub database: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

impl DatabaseResult {
    pub fn succeeded(database: &str, size_bytes: u64) -> Self {
        Self {
            database: database.to_string(),
            success: true,
            error: None,
            size_bytes,
        }
    }

    pub fn failed(database: &str, error: impl Into<String>) -> Self {
        Self {
            database: database.to_string(),
            success: false,
            error: Some(error.into()),
            size_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfiguration {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: String,
    /// Empty means every database on the instance.
    pub databases: Vec<String>,
    pub retention_days: u32,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Entity for BackupConfiguration {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: String,
    /// `None` for standalone single-database backups.
    pub run_id: Option<String>,
    pub database: String,
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub origin: RunKind,
    pub owner: Option<ArtifactOwner>,
}

impl Entity for BackupArtifact {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchBackupRun {
    pub id: String,
    pub kind: RunKind,
    pub configuration_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub databases: Vec<String>,
    pub status: RunStatus,
    pub total_size_bytes: u64,
    pub folder: PathBuf,
    pub artifacts: Vec<BackupArtifact>,
    pub results: Vec<DatabaseResult>,
    pub initiator: Initiator,
    pub failure: Option<String>,
}

impl BatchBackupRun {
    /// Moves the run to a terminal status. Returns false if it already left `InProgress`.
    pub fn finish(&mut self, status: RunStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(at);
        true
    }

    pub fn failed_databases(&self) -> impl Iterator<Item = &DatabaseResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

impl Entity for BatchBackupRun {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOperation {
    pub id: String,
    pub run_id: String,
    /// Databases this operation restores, in order.
    pub databases: Vec<String>,
    pub status: RunStatus,
    pub total_databases: usize,
    pub results: Vec<DatabaseResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl RestoreOperation {
    pub fn completed_databases(&self) -> usize {
        self.results.len()
    }

    pub fn finish(&mut self, status: RunStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(at);
        true
    }
}

impl Entity for RestoreOperation {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseOwnershipRecord {
    pub tenant_id: String,
    pub database: String,
    pub quota_mb: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> BatchBackupRun {
        BatchBackupRun {
            id: "manual_adhoc_x".into(),
            kind: RunKind::Manual,
            configuration_id: None,
            started_at: Utc::now(),
            finished_at: None,
            databases: vec!["a".into()],
            status: RunStatus::InProgress,
            total_size_bytes: 0,
            folder: PathBuf::from("/tmp/x"),
            artifacts: vec![],
            results: vec![],
            initiator: Initiator::System,
            failure: None,
        }
    }

    #[test]
    fn finish_is_applied_once() {
        let mut run = run();
        assert!(run.finish(RunStatus::Completed, Utc::now()));
        assert!(!run.finish(RunStatus::Failed, Utc::now()));
        assert!(!run.finish(RunStatus::InProgress, Utc::now()));
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&RunStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn credential_debug_hides_password() {
        let cred = Credential {
            username: "alice".into(),
            password: Some("s3cret".into()),
        };
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("alice"));
    }
}
