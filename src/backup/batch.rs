// Sequential multi-database backup and restore with continue-on-error semantics.
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::runner::{BackupRunner, Outcome};
use crate::catalog::DatabaseCatalog;
use crate::errors::{AppError, Result};
use crate::models::{
    ArtifactOwner, BackupArtifact, BatchBackupRun, Caller, Credential, DatabaseResult, RunKind, RunStatus,
};
use crate::retention::RetentionManager;
use crate::store::ArtifactStore;
use crate::store::artifacts::{ARTIFACT_EXTENSION, remove_path};
use crate::tenant::TenantDirectory;
use crate::utils::clock::Clock;
use crate::utils::identifier::{folder_segment, validate_database_name};

/// Default pause between two database restores.
pub const DEFAULT_RESTORE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationRef {
    pub id: String,
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Empty means every database the caller may see.
    pub databases: Vec<String>,
    pub kind: RunKind,
    pub caller: Caller,
    pub configuration: Option<ConfigurationRef>,
}

/// A run that has its folder and in-progress record, ready to execute.
#[derive(Debug)]
pub struct PreparedRun {
    pub run: BatchBackupRun,
    credential: Credential,
    configuration: Option<ConfigurationRef>,
}

/// A batch started in the background.
pub struct BackgroundRun {
    /// Snapshot taken right after the run was recorded as in-progress.
    pub run: BatchBackupRun,
    pub task: JoinHandle<BatchBackupRun>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub database: String,
    pub source: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub run_id: String,
    pub targets: Vec<RestoreTarget>,
    credential: Credential,
    /// Login that owns databases recreated during the restore, if any.
    owner_login: Option<String>,
}

pub struct BatchOrchestrator {
    runner: Arc<dyn BackupRunner>,
    store: Arc<ArtifactStore>,
    catalog: Arc<dyn DatabaseCatalog>,
    tenants: Arc<dyn TenantDirectory>,
    retention: Arc<RetentionManager>,
    clock: Arc<dyn Clock>,
    admin: Credential,
    restore_delay: Duration,
}

impl BatchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<dyn BackupRunner>,
        store: Arc<ArtifactStore>,
        catalog: Arc<dyn DatabaseCatalog>,
        tenants: Arc<dyn TenantDirectory>,
        retention: Arc<RetentionManager>,
        clock: Arc<dyn Clock>,
        admin: Credential,
        restore_delay: Duration,
    ) -> Self {
        Self {
            runner,
            store,
            catalog,
            tenants,
            retention,
            clock,
            admin,
            restore_delay,
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Expands an empty list and checks names and ownership.
    ///
    /// Nothing has touched the engine or the filesystem when this fails.
    pub async fn resolve_targets(&self, requested: &[String], caller: &Caller) -> Result<Vec<String>> {
        let targets = if requested.is_empty() {
            match caller {
                Caller::Tenant { tenant_id, .. } => self.tenants.list_owned(tenant_id).await,
                _ => self.catalog.list_databases().await?,
            }
        } else {
            requested.to_vec()
        };

        let mut seen = HashSet::new();
        for name in &targets {
            validate_database_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(AppError::InvalidIdentifier(format!(
                    "database '{}' is listed more than once",
                    name
                )));
            }
        }
        self.check_ownership(targets.iter().map(String::as_str), caller).await?;
        Ok(targets)
    }

    async fn check_ownership<'a>(
        &self,
        databases: impl Iterator<Item = &'a str>,
        caller: &Caller,
    ) -> Result<()> {
        let Caller::Tenant { tenant_id, .. } = caller else {
            return Ok(());
        };
        for database in databases {
            if !self.tenants.owns_database(tenant_id, database).await {
                warn!(tenant_id = %tenant_id, database, "Rejected request for a database the tenant does not own");
                return Err(AppError::PermissionDenied(format!(
                    "tenant '{}' does not own database '{}'",
                    tenant_id, database
                )));
            }
        }
        Ok(())
    }

    async fn credential_for(&self, caller: &Caller) -> Result<Credential> {
        match caller {
            Caller::Tenant { tenant_id, .. } => self.tenants.credentials_for(tenant_id).await,
            _ => Ok(self.admin.clone()),
        }
    }

    fn allocate_run_id(&self, kind: RunKind, configuration: Option<&ConfigurationRef>) -> String {
        let scope = configuration
            .map(|c| folder_segment(&c.id))
            .unwrap_or_else(|| "adhoc".to_string());
        let stamp = self.clock.now().format("%Y%m%d_%H%M%S%3f");
        loop {
            let suffix = Uuid::new_v4().simple().to_string();
            let id = format!("{}_{}_{}_{}", kind, scope, stamp, &suffix[..8]);
            if self.store.run(&id).is_none() && !self.store.root().join(&id).exists() {
                return id;
            }
        }
    }

    /// Allocates the run, creates its folder and persists it as in-progress.
    pub async fn prepare(&self, request: BatchRequest) -> Result<PreparedRun> {
        let databases = self.resolve_targets(&request.databases, &request.caller).await?;
        let credential = self.credential_for(&request.caller).await?;

        let id = self.allocate_run_id(request.kind, request.configuration.as_ref());
        let folder = self.store.create_run_folder(&id).await?;
        let run = BatchBackupRun {
            id,
            kind: request.kind,
            configuration_id: request.configuration.as_ref().map(|c| c.id.clone()),
            started_at: self.clock.now(),
            finished_at: None,
            databases,
            status: RunStatus::InProgress,
            total_size_bytes: 0,
            folder,
            artifacts: Vec::new(),
            results: Vec::new(),
            initiator: request.caller.initiator(),
            failure: None,
        };

        if let Err(e) = self.store.write_manifest(&run).await {
            if let Err(cleanup) = remove_path(&run.folder).await {
                warn!(folder = %run.folder.display(), error = %cleanup, "Failed to remove folder of a run that could not start");
            }
            return Err(e);
        }
        self.store.record_run(&run);
        info!(
            run_id = %run.id,
            kind = %run.kind,
            databases = run.databases.len(),
            initiator = %run.initiator,
            "Backup run started"
        );
        Ok(PreparedRun {
            run,
            credential,
            configuration: request.configuration,
        })
    }

    /// Backs up every database of a prepared run, one after the other.
    pub async fn execute(&self, prepared: PreparedRun) -> BatchBackupRun {
        let PreparedRun {
            run,
            credential,
            configuration,
        } = prepared;

        for database in &run.databases {
            let (result, artifact) = self.backup_into_run(&run, database, &credential).await;
            self.store.update_run(&run.id, |r| {
                r.results.push(result.clone());
                if let Some(artifact) = &artifact {
                    r.total_size_bytes += artifact.size_bytes;
                    r.artifacts.push(artifact.clone());
                }
            });
            if let Some(artifact) = artifact {
                self.store.record_artifact(artifact);
            }
        }

        let finished = self.finalize(&run.id, run.clone()).await;

        if let Some(config) = configuration {
            self.retention.prune_for(&config.id, config.retention_days).await;
        }
        finished
    }

    async fn backup_into_run(
        &self,
        run: &BatchBackupRun,
        database: &str,
        credential: &Credential,
    ) -> (DatabaseResult, Option<BackupArtifact>) {
        let file_name = format!("{}.{}", database, ARTIFACT_EXTENSION);
        let destination = run.folder.join(&file_name);
        info!(run_id = %run.id, database, "Backing up database");

        match self.runner.backup(database, &destination, credential).await {
            Outcome::Success => match tokio::fs::metadata(&destination).await {
                Ok(meta) => {
                    let artifact = BackupArtifact {
                        id: format!("{}:{}", run.id, database),
                        run_id: Some(run.id.clone()),
                        database: database.to_string(),
                        file_name,
                        path: destination,
                        size_bytes: meta.len(),
                        created_at: self.clock.now(),
                        origin: run.kind,
                        owner: self.resolve_owner(database).await,
                    };
                    info!(run_id = %run.id, database, size_bytes = meta.len(), "✓ Database backed up");
                    (DatabaseResult::succeeded(database, meta.len()), Some(artifact))
                }
                Err(e) => {
                    let reason = format!(
                        "backup reported success but {} is unreadable: {}",
                        destination.display(),
                        e
                    );
                    warn!(run_id = %run.id, database, "{}", reason);
                    (DatabaseResult::failed(database, reason), None)
                }
            },
            Outcome::Failure { reason } => {
                warn!(run_id = %run.id, database, reason = %reason, "Database backup failed, continuing with the next one");
                if let Err(e) = remove_path(&destination).await {
                    warn!(path = %destination.display(), error = %e, "Failed to remove partial backup file");
                }
                (DatabaseResult::failed(database, reason), None)
            }
        }
    }

    async fn resolve_owner(&self, database: &str) -> Option<ArtifactOwner> {
        match self.tenants.owner_of(database).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!(database, error = %e, "Could not resolve artifact owner, leaving it empty");
                None
            }
        }
    }

    /// Writes the manifest, then marks the run completed. A manifest failure fails the run.
    async fn finalize(&self, run_id: &str, fallback: BatchBackupRun) -> BatchBackupRun {
        let mut finished = self.store.run(run_id).unwrap_or(fallback);
        let now = self.clock.now();
        finished.finish(RunStatus::Completed, now);

        match self.store.write_manifest(&finished).await {
            Ok(()) => {
                self.store.update_run(run_id, |r| {
                    r.finish(RunStatus::Completed, now);
                });
                let failed = finished.failed_databases().count();
                info!(
                    run_id,
                    succeeded = finished.results.len() - failed,
                    failed,
                    total_size_bytes = finished.total_size_bytes,
                    "Backup run completed"
                );
                finished
            }
            Err(e) => {
                error!(run_id, error = %e, "Failed to write run manifest");
                self.fail_run(run_id, finished, format!("could not write manifest: {}", e))
                    .await
            }
        }
    }

    /// Marks a run failed after its orchestration broke down.
    async fn fail_run(&self, run_id: &str, fallback: BatchBackupRun, reason: String) -> BatchBackupRun {
        let now = self.clock.now();
        let updated = self.store.update_run(run_id, |r| {
            if r.finish(RunStatus::Failed, now) {
                r.failure = Some(reason.clone());
            }
        });
        let failed = updated.unwrap_or_else(|| BatchBackupRun {
            status: RunStatus::Failed,
            finished_at: Some(now),
            failure: Some(reason),
            ..fallback
        });
        if let Err(e) = self.store.write_manifest(&failed).await {
            warn!(run_id, error = %e, "Could not persist failed run manifest");
        }
        failed
    }

    /// Prepares and executes a batch, returning once every database has been handled.
    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchBackupRun> {
        let prepared = self.prepare(request).await?;
        Ok(self.execute(prepared).await)
    }

    /// Prepares a batch and executes it on a background task.
    ///
    /// A panic inside the task leaves the run failed instead of in-progress forever.
    pub async fn start_batch(self: &Arc<Self>, request: BatchRequest) -> Result<BackgroundRun> {
        let prepared = self.prepare(request).await?;
        let snapshot = prepared.run.clone();
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let fallback = prepared.run.clone();
            let run_id = fallback.id.clone();
            let worker = {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.execute(prepared).await })
            };
            match worker.await {
                Ok(run) => run,
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Backup task aborted");
                    this.fail_run(&run_id, fallback, format!("backup task aborted: {}", e))
                        .await
                }
            }
        });
        Ok(BackgroundRun {
            run: snapshot,
            task,
        })
    }

    /// Backs up one database outside of any run, into the standalone folder.
    pub async fn backup_database(&self, database: &str, caller: &Caller) -> Result<BackupArtifact> {
        validate_database_name(database)?;
        self.check_ownership(std::iter::once(database), caller).await?;
        let credential = self.credential_for(caller).await?;

        let dir = self.store.ensure_standalone_dir().await?;
        let now = self.clock.now();
        let suffix = Uuid::new_v4().simple().to_string();
        let stem = format!("{}_{}_{}", database, now.format("%Y%m%d_%H%M%S"), &suffix[..8]);
        let file_name = format!("{}.{}", stem, ARTIFACT_EXTENSION);
        let path = dir.join(&file_name);

        if let Outcome::Failure { reason } = self.runner.backup(database, &path, &credential).await {
            if let Err(e) = remove_path(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove partial backup file");
            }
            return Err(AppError::SubprocessFailure(reason));
        }
        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|e| AppError::file_system(&path, e))?
            .len();

        let artifact = BackupArtifact {
            id: stem,
            run_id: None,
            database: database.to_string(),
            file_name,
            path,
            size_bytes,
            created_at: now,
            origin: RunKind::Manual,
            owner: self.resolve_owner(database).await,
        };
        self.store.write_sidecar(&artifact).await?;
        self.store.record_artifact(artifact.clone());
        info!(artifact_id = %artifact.id, database, size_bytes, "Standalone backup written");
        Ok(artifact)
    }

    /// Works out which artifacts of a run to restore, checking access first.
    pub async fn plan_restore(
        &self,
        run_id: &str,
        database: Option<&str>,
        caller: &Caller,
    ) -> Result<RestorePlan> {
        let run = self
            .store
            .run(run_id)
            .ok_or_else(|| AppError::not_found("backup run", run_id))?;
        if !run.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "backup run '{}' is still in progress",
                run_id
            )));
        }

        let targets: Vec<RestoreTarget> = match database {
            Some(db) => {
                validate_database_name(db)?;
                let artifact = run.artifacts.iter().find(|a| a.database == db).ok_or_else(|| {
                    AppError::NotFound(format!("run '{}' holds no backup of database '{}'", run_id, db))
                })?;
                vec![RestoreTarget {
                    database: artifact.database.clone(),
                    source: artifact.path.clone(),
                }]
            }
            None => run
                .artifacts
                .iter()
                .map(|a| RestoreTarget {
                    database: a.database.clone(),
                    source: a.path.clone(),
                })
                .collect(),
        };
        if targets.is_empty() {
            return Err(AppError::NotFound(format!(
                "run '{}' has no restorable artifacts",
                run_id
            )));
        }

        self.check_ownership(targets.iter().map(|t| t.database.as_str()), caller)
            .await?;
        let credential = self.credential_for(caller).await?;
        let owner_login = match caller {
            Caller::Tenant { .. } => Some(credential.username.clone()),
            _ => None,
        };
        Ok(RestorePlan {
            run_id: run_id.to_string(),
            targets,
            credential,
            owner_login,
        })
    }

    /// Restores each target in order with a fixed pause in between.
    ///
    /// `on_result` sees every per-database result as soon as it is known.
    pub async fn restore_sequence(
        &self,
        plan: &RestorePlan,
        mut on_result: impl FnMut(&DatabaseResult) + Send,
    ) -> Vec<DatabaseResult> {
        let mut results = Vec::with_capacity(plan.targets.len());
        for (index, target) in plan.targets.iter().enumerate() {
            if index > 0 && !self.restore_delay.is_zero() {
                tokio::time::sleep(self.restore_delay).await;
            }
            let result = self.restore_one(plan, target).await;
            on_result(&result);
            results.push(result);
        }
        results
    }

    async fn restore_one(&self, plan: &RestorePlan, target: &RestoreTarget) -> DatabaseResult {
        let database = target.database.as_str();
        info!(run_id = %plan.run_id, database, "Restoring database");

        if let Err(e) = self
            .catalog
            .ensure_database(database, plan.owner_login.as_deref())
            .await
        {
            warn!(database, error = %e, "Could not prepare target database");
            return DatabaseResult::failed(database, format!("could not prepare target database: {}", e));
        }

        // Own task so that a panic is contained to this database.
        let runner = Arc::clone(&self.runner);
        let db = target.database.clone();
        let source = target.source.clone();
        let credential = plan.credential.clone();
        let task = tokio::spawn(async move { runner.restore(&db, &source, &credential).await });

        match task.await {
            Ok(Outcome::Success) => {
                info!(run_id = %plan.run_id, database, "✓ Database restored");
                DatabaseResult::succeeded(database, 0)
            }
            Ok(Outcome::Failure { reason }) => {
                warn!(run_id = %plan.run_id, database, reason = %reason, "Database restore failed, continuing with the next one");
                DatabaseResult::failed(database, reason)
            }
            Err(e) => {
                error!(run_id = %plan.run_id, database, error = %e, "Restore task crashed");
                DatabaseResult::failed(database, format!("restore task crashed: {}", e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::artifacts::MANIFEST_FILE;
    use crate::tenant::InMemoryTenantDirectory;
    use crate::testing::{Call, FakeCatalog, FakeRunner};
    use crate::utils::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    pub(crate) struct Harness {
        pub dir: tempfile::TempDir,
        pub runner: Arc<FakeRunner>,
        pub catalog: Arc<FakeCatalog>,
        pub tenants: Arc<InMemoryTenantDirectory>,
        pub clock: Arc<ManualClock>,
        pub orchestrator: Arc<BatchOrchestrator>,
    }

    pub(crate) fn admin_credential() -> Credential {
        Credential {
            username: "postgres".into(),
            password: Some("admin-pw".into()),
        }
    }

    pub(crate) fn harness(runner: FakeRunner, databases: &[&str], restore_delay: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap()));
        let store = Arc::new(ArtifactStore::in_memory(dir.path().to_path_buf()));
        let runner = Arc::new(runner);
        let catalog = Arc::new(FakeCatalog::new(databases));
        let tenants = Arc::new(InMemoryTenantDirectory::new(clock.clone()));
        let retention = Arc::new(RetentionManager::new(store.clone(), clock.clone()));
        let orchestrator = Arc::new(BatchOrchestrator::new(
            runner.clone(),
            store,
            catalog.clone(),
            tenants.clone(),
            retention,
            clock.clone(),
            admin_credential(),
            restore_delay,
        ));
        Harness {
            dir,
            runner,
            catalog,
            tenants,
            clock,
            orchestrator,
        }
    }

    fn admin() -> Caller {
        Caller::Admin {
            label: "ops".into(),
        }
    }

    fn request(databases: &[&str], caller: Caller) -> BatchRequest {
        BatchRequest {
            databases: databases.iter().map(|d| d.to_string()).collect(),
            kind: RunKind::Manual,
            caller,
            configuration: None,
        }
    }

    #[tokio::test]
    async fn one_result_per_database_even_when_some_fail() {
        let runner = FakeRunner::new().with_size("A", 100).failing_backup("B").with_size("C", 7);
        let h = harness(runner, &[], Duration::ZERO);

        let run = h
            .orchestrator
            .run_batch(request(&["A", "B", "C"], admin()))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.results.len(), 3);
        assert!(run.results[0].success);
        assert!(!run.results[1].success);
        assert!(run.results[1].error.as_deref().unwrap().contains("exit status"));
        assert!(run.results[2].success);
        assert_eq!(run.total_size_bytes, 107);
        assert_eq!(run.artifacts.len(), 2);
        assert!(!run.folder.join("B.bak").exists());
        assert!(run.folder.join(MANIFEST_FILE).exists());
        assert_eq!(h.orchestrator.store().run(&run.id).unwrap(), run);
    }

    #[tokio::test]
    async fn empty_list_means_every_catalog_database() {
        let h = harness(FakeRunner::new(), &["alpha", "beta"], Duration::ZERO);
        let run = h.orchestrator.run_batch(request(&[], admin())).await.unwrap();
        assert_eq!(run.databases, vec!["alpha", "beta"]);
        assert_eq!(h.runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn run_ids_are_unique_within_one_millisecond() {
        let h = harness(FakeRunner::new(), &["A"], Duration::ZERO);
        let mut req = request(&["A"], Caller::System);
        req.kind = RunKind::Scheduled;
        req.configuration = Some(ConfigurationRef {
            id: "1".into(),
            retention_days: 30,
        });

        let first = h.orchestrator.run_batch(req.clone()).await.unwrap();
        let second = h.orchestrator.run_batch(req).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.id.starts_with("scheduled_1_20261018_020000000_"));
        assert_ne!(first.folder, second.folder);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected_before_anything_runs() {
        let h = harness(FakeRunner::new(), &[], Duration::ZERO);
        let err = h
            .orchestrator
            .run_batch(request(&["ok", "bad name"], admin()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentifier(_)));
        let err = h
            .orchestrator
            .run_batch(request(&["ok", "ok"], admin()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentifier(_)));
        assert!(h.runner.calls().is_empty());
        assert!(h.orchestrator.store().runs().is_empty());
    }

    #[tokio::test]
    async fn tenant_cannot_back_up_foreign_database() {
        let h = harness(FakeRunner::new(), &[], Duration::ZERO);
        h.tenants.register_tenant(
            "t1",
            "alice",
            Credential {
                username: "alice_login".into(),
                password: None,
            },
            1000,
        );
        h.tenants
            .provision_database(h.catalog.as_ref(), "t1", "alice_db", 10)
            .await
            .unwrap();
        let tenant = Caller::Tenant {
            tenant_id: "t1".into(),
            label: "alice".into(),
        };

        let err = h
            .orchestrator
            .run_batch(request(&["alice_db", "bob_db"], tenant.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
        let err = h
            .orchestrator
            .backup_database("bob_db", &tenant)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
        assert!(h.runner.calls().is_empty());

        let run = h.orchestrator.run_batch(request(&[], tenant)).await.unwrap();
        assert_eq!(run.databases, vec!["alice_db"]);
        assert_eq!(
            h.runner.calls(),
            vec![Call::Backup {
                database: "alice_db".into(),
                as_user: "alice_login".into()
            }]
        );
        let owner = run.artifacts[0].owner.clone().unwrap();
        assert_eq!(owner.tenant_id, "t1");
        assert_eq!(owner.label, "alice");
    }

    #[tokio::test]
    async fn start_batch_returns_before_work_finishes() {
        let runner = FakeRunner::new().with_delay(Duration::from_millis(200));
        let h = harness(runner, &[], Duration::ZERO);

        let background = h
            .orchestrator
            .start_batch(request(&["A", "B"], admin()))
            .await
            .unwrap();
        assert_eq!(background.run.status, RunStatus::InProgress);
        let polled = h.orchestrator.store().run(&background.run.id).unwrap();
        assert_eq!(polled.status, RunStatus::InProgress);

        let done = background.task.await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(
            h.orchestrator.store().run(&done.id).unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn standalone_backup_records_artifact() {
        let h = harness(FakeRunner::new().with_size("orders", 42), &[], Duration::ZERO);
        let artifact = h.orchestrator.backup_database("orders", &admin()).await.unwrap();
        assert_eq!(artifact.size_bytes, 42);
        assert!(artifact.run_id.is_none());
        assert!(artifact.path.starts_with(h.dir.path().join("standalone")));
        assert!(artifact.path.with_extension("json").exists());
        assert_eq!(h.orchestrator.store().artifact(&artifact.id), Some(artifact));
    }

    #[tokio::test]
    async fn standalone_backup_failure_is_reported() {
        let h = harness(FakeRunner::new().failing_backup("orders"), &[], Duration::ZERO);
        let err = h.orchestrator.backup_database("orders", &admin()).await.unwrap_err();
        assert!(matches!(err, AppError::SubprocessFailure(_)));
        assert!(h.orchestrator.store().artifacts().is_empty());
    }

    #[tokio::test]
    async fn restore_sequence_contains_panics_and_failures() {
        let runner = FakeRunner::new().panicking_restore("B").failing_restore("C");
        let h = harness(runner, &[], Duration::from_millis(10));
        let run = h
            .orchestrator
            .run_batch(request(&["A", "B", "C", "D"], admin()))
            .await
            .unwrap();

        let plan = h.orchestrator.plan_restore(&run.id, None, &admin()).await.unwrap();
        let mut seen = Vec::new();
        let results = h
            .orchestrator
            .restore_sequence(&plan, |r| seen.push(r.database.clone()))
            .await;

        assert_eq!(seen, vec!["A", "B", "C", "D"]);
        let flags: Vec<bool> = results.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, false, false, true]);
        assert!(results[1].error.as_deref().unwrap().contains("crashed"));
        // restoring recreated the databases through the catalog
        assert_eq!(h.catalog.databases(), vec!["A", "B", "C", "D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn restores_pause_between_databases_only() {
        let delay = Duration::from_secs(2);
        let h = harness(FakeRunner::new(), &[], delay);
        let run = h
            .orchestrator
            .run_batch(request(&["A", "B", "C"], admin()))
            .await
            .unwrap();
        let plan = h.orchestrator.plan_restore(&run.id, None, &admin()).await.unwrap();

        let started = tokio::time::Instant::now();
        let mut offsets = Vec::new();
        h.orchestrator
            .restore_sequence(&plan, |_| offsets.push(started.elapsed()))
            .await;

        assert_eq!(offsets.len(), 3);
        assert!(offsets[0] < delay, "first restore waited {:?}", offsets[0]);
        assert!(offsets[1] >= delay);
        assert!(offsets[2] >= delay * 2);
        assert!(started.elapsed() < delay * 3, "paused after the last database");
    }

    #[tokio::test]
    async fn unreachable_engine_fails_the_request_or_the_database() {
        let h = harness(FakeRunner::new(), &["A"], Duration::ZERO);
        let run = h.orchestrator.run_batch(request(&["A"], admin())).await.unwrap();

        h.catalog.set_unreachable(true);
        assert!(h.orchestrator.run_batch(request(&[], admin())).await.is_err());
        assert_eq!(h.orchestrator.store().runs().len(), 1);

        let plan = h.orchestrator.plan_restore(&run.id, None, &admin()).await.unwrap();
        let results = h.orchestrator.restore_sequence(&plan, |_| {}).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("could not prepare target database"));
        assert!(!h.runner.calls().iter().any(|c| matches!(c, Call::Restore { .. })));
    }

    #[tokio::test]
    async fn restore_plan_skips_failed_backups_and_checks_state() {
        let h = harness(FakeRunner::new().failing_backup("B"), &[], Duration::ZERO);
        let run = h
            .orchestrator
            .run_batch(request(&["A", "B"], admin()))
            .await
            .unwrap();

        let plan = h.orchestrator.plan_restore(&run.id, None, &admin()).await.unwrap();
        let dbs: Vec<&str> = plan.targets.iter().map(|t| t.database.as_str()).collect();
        assert_eq!(dbs, vec!["A"]);

        let err = h
            .orchestrator
            .plan_restore(&run.id, Some("B"), &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = h
            .orchestrator
            .plan_restore("missing", None, &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn scheduled_runs_apply_their_retention_window() {
        let h = harness(FakeRunner::new(), &["A"], Duration::ZERO);
        let mut req = request(&["A"], Caller::System);
        req.kind = RunKind::Scheduled;
        req.configuration = Some(ConfigurationRef {
            id: "nightly".into(),
            retention_days: 7,
        });

        let old = h.orchestrator.run_batch(req.clone()).await.unwrap();
        h.clock.advance(chrono::Duration::days(8));
        let fresh = h.orchestrator.run_batch(req).await.unwrap();

        let ids: Vec<String> = h.orchestrator.store().runs().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![fresh.id]);
        assert!(!old.folder.exists());
    }
}
