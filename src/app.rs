//! Wires the stores, runner, orchestrator, tracker, planner and retention
//! together and exposes the operations an outer layer (CLI, HTTP) calls.
//!
//! Every operation takes the [`Caller`]; tenant callers only see and touch
//! databases they own.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backup::batch::{BatchOrchestrator, BatchRequest};
use crate::backup::runner::{BackupRunner, PgToolsRunner};
use crate::catalog::{DatabaseCatalog, PgCatalog};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::models::{
    BackupArtifact, BackupConfiguration, BatchBackupRun, Caller, Credential, DatabaseOwnershipRecord,
    RestoreOperation, RunKind,
};
use crate::restore::RestoreOperationTracker;
use crate::retention::{PruneReport, RetentionManager};
use crate::schedule::{ConfigurationDraft, ScheduledBackupPlanner};
use crate::store::ArtifactStore;
use crate::store::artifacts::ReconcileReport;
use crate::tenant::{InMemoryTenantDirectory, TenantDirectory};
use crate::utils::clock::{Clock, SystemClock};

pub struct BackupApp {
    config: AppConfig,
    store: Arc<ArtifactStore>,
    catalog: Arc<dyn DatabaseCatalog>,
    tenants: Arc<InMemoryTenantDirectory>,
    retention: Arc<RetentionManager>,
    orchestrator: Arc<BatchOrchestrator>,
    restores: RestoreOperationTracker,
    planner: Arc<ScheduledBackupPlanner>,
}

impl BackupApp {
    /// Production wiring: `pg_dump`/`pg_restore` from PATH and a lazy sqlx pool.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let runner = PgToolsRunner::locate(config.engine_url.clone(), config.command_timeout)?;
        let catalog = PgCatalog::connect_lazy(&config.engine_url)?;
        Self::with_components(config, Arc::new(runner), Arc::new(catalog), Arc::new(SystemClock))
    }

    pub fn with_components(
        config: AppConfig,
        runner: Arc<dyn BackupRunner>,
        catalog: Arc<dyn DatabaseCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let admin = config.admin_credential().map_err(|e| AppError::Config(format!("{:#}", e)))?;
        let store = Arc::new(ArtifactStore::in_memory(config.backup_root.clone()));
        let tenants = Arc::new(InMemoryTenantDirectory::new(Arc::clone(&clock)));
        let retention = Arc::new(RetentionManager::new(Arc::clone(&store), Arc::clone(&clock)));
        let orchestrator = Arc::new(BatchOrchestrator::new(
            runner,
            Arc::clone(&store),
            Arc::clone(&catalog),
            tenants.clone(),
            Arc::clone(&retention),
            clock,
            admin,
            config.restore_delay,
        ));
        let restores = RestoreOperationTracker::in_memory(Arc::clone(&orchestrator));
        let planner = ScheduledBackupPlanner::in_memory(Arc::clone(&orchestrator));
        Ok(Self {
            config,
            store,
            catalog,
            tenants,
            retention,
            orchestrator,
            restores,
            planner,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Rebuilds run and artifact records from the backup root. Runs this
    /// process already tracks are kept as they are.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.reconcile()).await?
    }

    /// Reconciles, then schedules the configured backups.
    pub async fn start(&self) -> Result<ReconcileReport> {
        let report = self.reconcile().await?;
        let now = self.orchestrator.clock().now();
        for schedule in self.config.schedules.clone() {
            self.planner.schedule(schedule.into_configuration(now))?;
        }
        info!(configurations = self.config.schedules.len(), "Backup service started");
        Ok(report)
    }

    pub fn shutdown(&self) {
        self.planner.shutdown();
    }

    fn require_admin(caller: &Caller, action: &str) -> Result<()> {
        if caller.is_admin() {
            Ok(())
        } else {
            Err(AppError::PermissionDenied(format!("only administrators may {}", action)))
        }
    }

    async fn visible_to(&self, caller: &Caller, databases: &[String]) -> bool {
        let Caller::Tenant { tenant_id, .. } = caller else {
            return true;
        };
        for database in databases {
            if !self.tenants.owns_database(tenant_id, database).await {
                return false;
            }
        }
        true
    }

    // Backup configurations

    pub fn create_configuration(&self, caller: &Caller, draft: ConfigurationDraft) -> Result<BackupConfiguration> {
        Self::require_admin(caller, "manage backup configurations")?;
        self.planner.create(draft)
    }

    /// Creates or replaces a configuration under its own id.
    pub fn save_configuration(&self, caller: &Caller, config: BackupConfiguration) -> Result<BackupConfiguration> {
        Self::require_admin(caller, "manage backup configurations")?;
        self.planner.schedule(config)
    }

    pub fn list_configurations(&self, caller: &Caller) -> Result<Vec<BackupConfiguration>> {
        Self::require_admin(caller, "list backup configurations")?;
        Ok(self.planner.list())
    }

    pub fn delete_configuration(&self, caller: &Caller, config_id: &str) -> Result<BackupConfiguration> {
        Self::require_admin(caller, "manage backup configurations")?;
        self.planner.remove(config_id)
    }

    pub async fn run_configuration_now(&self, caller: &Caller, config_id: &str) -> Result<BatchBackupRun> {
        Self::require_admin(caller, "run backup configurations")?;
        self.planner.run_now(config_id, caller).await
    }

    // Batch runs

    /// Starts a detached backup of every database visible to the caller.
    pub async fn start_backup_all(&self, caller: &Caller) -> Result<BatchBackupRun> {
        let background = self
            .orchestrator
            .start_batch(BatchRequest {
                databases: Vec::new(),
                kind: RunKind::Manual,
                caller: caller.clone(),
                configuration: None,
            })
            .await?;
        Ok(background.run)
    }

    /// Backs up the given databases (all when empty) and waits for the result.
    pub async fn backup_databases(&self, caller: &Caller, databases: Vec<String>) -> Result<BatchBackupRun> {
        self.orchestrator
            .run_batch(BatchRequest {
                databases,
                kind: RunKind::Manual,
                caller: caller.clone(),
                configuration: None,
            })
            .await
    }

    pub async fn backup_database(&self, caller: &Caller, database: &str) -> Result<BackupArtifact> {
        self.orchestrator.backup_database(database, caller).await
    }

    pub async fn list_runs(&self, caller: &Caller) -> Vec<BatchBackupRun> {
        let mut visible = Vec::new();
        for run in self.store.runs() {
            if self.visible_to(caller, &run.databases).await {
                visible.push(run);
            }
        }
        visible
    }

    pub async fn get_run(&self, caller: &Caller, run_id: &str) -> Result<BatchBackupRun> {
        let run = self
            .store
            .run(run_id)
            .ok_or_else(|| AppError::not_found("backup run", run_id))?;
        if !self.visible_to(caller, &run.databases).await {
            return Err(AppError::PermissionDenied(format!(
                "backup run '{}' includes databases the caller does not own",
                run_id
            )));
        }
        Ok(run)
    }

    pub async fn delete_run(&self, caller: &Caller, run_id: &str) -> Result<BatchBackupRun> {
        self.get_run(caller, run_id).await?;
        self.store.delete_run(run_id).await
    }

    // Artifacts

    pub async fn list_artifacts(&self, caller: &Caller) -> Vec<BackupArtifact> {
        let mut visible = Vec::new();
        for artifact in self.store.artifacts() {
            if self.visible_to(caller, std::slice::from_ref(&artifact.database)).await {
                visible.push(artifact);
            }
        }
        visible
    }

    pub async fn delete_artifact(&self, caller: &Caller, artifact_id: &str) -> Result<BackupArtifact> {
        let artifact = self
            .store
            .artifact(artifact_id)
            .ok_or_else(|| AppError::not_found("artifact", artifact_id))?;
        if !self.visible_to(caller, std::slice::from_ref(&artifact.database)).await {
            return Err(AppError::PermissionDenied(format!(
                "artifact '{}' belongs to a database the caller does not own",
                artifact_id
            )));
        }
        if let Some(run_id) = &artifact.run_id {
            if self.store.run(run_id).is_some_and(|r| !r.status.is_terminal()) {
                return Err(AppError::Conflict(format!(
                    "artifact '{}' belongs to run '{}' which is still in progress",
                    artifact_id, run_id
                )));
            }
        }
        self.store.delete_artifact(artifact_id).await
    }

    // Restores

    /// Starts restoring a run (or one database of it) and returns the operation id.
    pub async fn start_restore(&self, caller: &Caller, run_id: &str, database: Option<&str>) -> Result<String> {
        self.restores.start(run_id, database, caller).await
    }

    pub async fn restore_status(&self, caller: &Caller, operation_id: &str) -> Result<RestoreOperation> {
        let operation = self.restores.status(operation_id)?;
        if !self.visible_to(caller, &operation.databases).await {
            return Err(AppError::PermissionDenied(format!(
                "restore operation '{}' touches databases the caller does not own",
                operation_id
            )));
        }
        Ok(operation)
    }

    /// Newest first.
    pub async fn list_restores(&self, caller: &Caller) -> Vec<RestoreOperation> {
        let mut visible = Vec::new();
        for operation in self.restores.list() {
            if self.visible_to(caller, &operation.databases).await {
                visible.push(operation);
            }
        }
        visible
    }

    pub async fn wait_for_restore(
        &self,
        caller: &Caller,
        operation_id: &str,
        poll_every: Duration,
    ) -> Result<RestoreOperation> {
        self.restore_status(caller, operation_id).await?;
        self.restores.wait(operation_id, poll_every).await
    }

    // Retention

    /// Prunes everything older than `max_age_days`, regardless of configuration.
    pub async fn prune(&self, caller: &Caller, max_age_days: u32) -> Result<PruneReport> {
        Self::require_admin(caller, "prune backups")?;
        Ok(self.retention.prune(max_age_days).await)
    }

    /// Applies each configuration's own window, and the default window to everything else.
    pub async fn apply_retention(&self) -> PruneReport {
        let mut report = PruneReport::default();
        let mut configured = HashSet::new();
        for config in self.planner.list() {
            let pruned = self.retention.prune_for(&config.id, config.retention_days).await;
            merge(&mut report, pruned);
            configured.insert(config.id);
        }
        let pruned = self
            .retention
            .prune_unconfigured(&configured, self.config.default_retention_days)
            .await;
        merge(&mut report, pruned);
        report
    }

    /// Runs [`Self::apply_retention`] on a fixed interval until aborted.
    pub fn spawn_retention_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let app = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let report = app.apply_retention().await;
                if !report.failures.is_empty() {
                    warn!(failures = report.failures.len(), "Retention sweep left entries behind");
                }
            }
        })
    }

    // Tenants

    pub fn register_tenant(&self, tenant_id: &str, label: &str, credential: Credential, quota_mb: u64) {
        self.tenants.register_tenant(tenant_id, label, credential, quota_mb);
    }

    pub async fn provision_database(
        &self,
        tenant_id: &str,
        database: &str,
        quota_mb: u64,
    ) -> Result<DatabaseOwnershipRecord> {
        self.tenants
            .provision_database(self.catalog.as_ref(), tenant_id, database, quota_mb)
            .await
    }

    pub async fn deprovision_database(&self, tenant_id: &str, database: &str) -> Result<()> {
        self.tenants
            .deprovision_database(self.catalog.as_ref(), tenant_id, database)
            .await
    }
}

fn merge(into: &mut PruneReport, from: PruneReport) {
    into.removed_runs.extend(from.removed_runs);
    into.removed_artifacts.extend(from.removed_artifacts);
    into.failures.extend(from.failures);
}
