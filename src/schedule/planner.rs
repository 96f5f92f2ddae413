use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cron::CronSchedule;
use crate::backup::batch::{BatchOrchestrator, BatchRequest, ConfigurationRef};
use crate::errors::{AppError, Result};
use crate::models::{BackupConfiguration, BatchBackupRun, Caller, RunKind};
use crate::retention::MAX_RETENTION_DAYS;
use crate::store::{MemoryRepository, Repository};
use crate::utils::clock::Clock;
use crate::utils::identifier::validate_database_name;

/// Input for a configuration that does not have an id yet.
#[derive(Debug, Clone)]
pub struct ConfigurationDraft {
    pub name: String,
    pub schedule: String,
    pub databases: Vec<String>,
    pub retention_days: u32,
    pub enabled: bool,
}

/// Releases a configuration's in-flight slot when dropped.
struct InFlight {
    slots: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.id);
    }
}

/// Owns backup configurations and keeps one timer task per enabled configuration.
pub struct ScheduledBackupPlanner {
    orchestrator: Arc<BatchOrchestrator>,
    configurations: Arc<dyn Repository<BackupConfiguration>>,
    clock: Arc<dyn Clock>,
    triggers: Mutex<HashMap<String, JoinHandle<()>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

fn validate(config: &BackupConfiguration) -> Result<CronSchedule> {
    if config.id.trim().is_empty() {
        return Err(AppError::Config("configuration id must not be empty".to_string()));
    }
    if config.retention_days == 0 || config.retention_days > MAX_RETENTION_DAYS {
        return Err(AppError::Config(format!(
            "configuration '{}' must keep backups between 1 and {} days",
            config.id, MAX_RETENTION_DAYS
        )));
    }
    for database in &config.databases {
        validate_database_name(database)?;
    }
    CronSchedule::parse(&config.schedule)
}

impl ScheduledBackupPlanner {
    pub fn new(
        orchestrator: Arc<BatchOrchestrator>,
        configurations: Arc<dyn Repository<BackupConfiguration>>,
    ) -> Arc<Self> {
        let clock = Arc::clone(orchestrator.clock());
        Arc::new(Self {
            orchestrator,
            configurations,
            clock,
            triggers: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn in_memory(orchestrator: Arc<BatchOrchestrator>) -> Arc<Self> {
        Self::new(orchestrator, Arc::new(MemoryRepository::new()))
    }

    /// Assigns an id and creation time, then schedules the configuration.
    pub fn create(self: &Arc<Self>, draft: ConfigurationDraft) -> Result<BackupConfiguration> {
        self.schedule(BackupConfiguration {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            enabled: draft.enabled,
            schedule: draft.schedule,
            databases: draft.databases,
            retention_days: draft.retention_days,
            created_at: self.clock.now(),
            last_run_at: None,
        })
    }

    /// Stores the configuration and (re)binds its trigger.
    ///
    /// Any trigger already bound to the same id is cancelled first. A run that
    /// trigger started keeps going.
    pub fn schedule(self: &Arc<Self>, mut config: BackupConfiguration) -> Result<BackupConfiguration> {
        let cron = validate(&config)?;
        if let Some(existing) = self.configurations.get(&config.id) {
            config.last_run_at = config.last_run_at.or(existing.last_run_at);
        }

        let mut triggers = self.triggers.lock();
        if let Some(previous) = triggers.remove(&config.id) {
            previous.abort();
            debug!(config_id = %config.id, "Cancelled previous trigger");
        }
        self.configurations.upsert(config.clone());
        if config.enabled {
            triggers.insert(config.id.clone(), self.spawn_trigger(config.id.clone(), cron));
            info!(config_id = %config.id, name = %config.name, schedule = %config.schedule, "Backup configuration scheduled");
        } else {
            info!(config_id = %config.id, name = %config.name, "Backup configuration stored disabled");
        }
        Ok(config)
    }

    /// Cancels the trigger and marks the configuration disabled.
    pub fn unschedule(&self, config_id: &str) -> Result<BackupConfiguration> {
        let mut triggers = self.triggers.lock();
        let updated = self
            .configurations
            .update(config_id, &mut |c| c.enabled = false)
            .ok_or_else(|| AppError::not_found("backup configuration", config_id))?;
        if let Some(trigger) = triggers.remove(config_id) {
            trigger.abort();
        }
        info!(config_id, "Backup configuration unscheduled");
        Ok(updated)
    }

    /// Unschedules and deletes the configuration. Its runs stay until retention removes them.
    pub fn remove(&self, config_id: &str) -> Result<BackupConfiguration> {
        let mut triggers = self.triggers.lock();
        let removed = self
            .configurations
            .remove(config_id)
            .ok_or_else(|| AppError::not_found("backup configuration", config_id))?;
        if let Some(trigger) = triggers.remove(config_id) {
            trigger.abort();
        }
        info!(config_id, "Backup configuration removed");
        Ok(removed)
    }

    pub fn get(&self, config_id: &str) -> Result<BackupConfiguration> {
        self.configurations
            .get(config_id)
            .ok_or_else(|| AppError::not_found("backup configuration", config_id))
    }

    pub fn list(&self) -> Vec<BackupConfiguration> {
        self.configurations.list()
    }

    /// Ids of configurations with a live trigger, sorted.
    pub fn active_triggers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .triggers
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Next time the configuration's trigger fires, if it is enabled.
    pub fn next_run(&self, config_id: &str) -> Result<Option<DateTime<Utc>>> {
        let config = self.get(config_id)?;
        if !config.enabled {
            return Ok(None);
        }
        Ok(CronSchedule::parse(&config.schedule)?.next_after(self.clock.now()))
    }

    /// Runs the configuration immediately on behalf of `caller` and waits for the result.
    ///
    /// Rejected with `Conflict` while another run of the same configuration is in flight.
    pub async fn run_now(&self, config_id: &str, caller: &Caller) -> Result<BatchBackupRun> {
        let config = self.get(config_id)?;
        let slot = self.claim(config_id).ok_or_else(|| {
            AppError::Conflict(format!(
                "a run of configuration '{}' is already in progress",
                config_id
            ))
        })?;
        info!(config_id, initiator = %caller.initiator(), "Manual run requested");
        self.dispatch(config, RunKind::Manual, caller.clone(), slot).await
    }

    /// One scheduled firing. Skipped when the previous run has not finished.
    pub(crate) async fn fire_trigger(&self, config_id: &str) -> Option<BatchBackupRun> {
        let config = match self.get(config_id) {
            Ok(config) if config.enabled => config,
            _ => return None,
        };
        let Some(slot) = self.claim(config_id) else {
            warn!(config_id, "Previous run still in progress, skipping this trigger");
            return None;
        };
        match self.dispatch(config, RunKind::Scheduled, Caller::System, slot).await {
            Ok(run) => Some(run),
            Err(e) => {
                warn!(config_id, error = %e, "Scheduled backup could not start");
                None
            }
        }
    }

    fn claim(&self, config_id: &str) -> Option<InFlight> {
        let mut slots = self.in_flight.lock();
        if !slots.insert(config_id.to_string()) {
            return None;
        }
        Some(InFlight {
            slots: Arc::clone(&self.in_flight),
            id: config_id.to_string(),
        })
    }

    /// Runs the batch on its own task. The run outlives a cancelled caller and
    /// the slot is released when it ends.
    async fn dispatch(
        &self,
        config: BackupConfiguration,
        kind: RunKind,
        caller: Caller,
        slot: InFlight,
    ) -> Result<BatchBackupRun> {
        let request = BatchRequest {
            databases: config.databases.clone(),
            kind,
            caller,
            configuration: Some(ConfigurationRef {
                id: config.id.clone(),
                retention_days: config.retention_days,
            }),
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        let configurations = Arc::clone(&self.configurations);
        let task = tokio::spawn(async move {
            let _slot = slot;
            let background = orchestrator.start_batch(request).await?;
            let started_at = background.run.started_at;
            configurations.update(&config.id, &mut |c| c.last_run_at = Some(started_at));
            Ok::<_, AppError>(background.task.await?)
        });
        task.await?
    }

    fn spawn_trigger(self: &Arc<Self>, config_id: String, cron: CronSchedule) -> JoinHandle<()> {
        let planner: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let wait = {
                    let Some(this) = planner.upgrade() else { return };
                    let now = this.clock.now();
                    let Some(next) = cron.next_after(now) else {
                        warn!(config_id = %config_id, schedule = %cron, "Schedule never fires again, stopping trigger");
                        return;
                    };
                    debug!(config_id = %config_id, next_run = %next, "Trigger armed");
                    (next - now).to_std().unwrap_or_default()
                };
                tokio::time::sleep(wait).await;

                let Some(this) = planner.upgrade() else { return };
                this.fire_trigger(&config_id).await;
            }
        })
    }

    /// Cancels every trigger. In-flight runs finish on their own.
    pub fn shutdown(&self) {
        for (id, trigger) in self.triggers.lock().drain() {
            trigger.abort();
            debug!(config_id = %id, "Trigger stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::batch::tests::harness;
    use crate::models::{Initiator, RunStatus};
    use crate::testing::FakeRunner;
    use std::time::Duration;

    fn config(id: &str, schedule: &str, databases: &[&str]) -> BackupConfiguration {
        BackupConfiguration {
            id: id.to_string(),
            name: format!("config {}", id),
            enabled: true,
            schedule: schedule.to_string(),
            databases: databases.iter().map(|d| d.to_string()).collect(),
            retention_days: 30,
            created_at: Utc::now(),
            last_run_at: None,
        }
    }

    fn admin() -> Caller {
        Caller::Admin {
            label: "ops".into(),
        }
    }

    #[tokio::test]
    async fn run_now_backs_up_every_database_and_records_last_run() {
        let runner = FakeRunner::new().with_size("A", 64).failing_backup("B");
        let h = harness(runner, &["A", "B"], Duration::ZERO);
        let planner = ScheduledBackupPlanner::in_memory(h.orchestrator.clone());
        planner.schedule(config("1", "0 2 * * *", &[])).unwrap();

        let run = planner.run_now("1", &admin()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.kind, RunKind::Manual);
        assert_eq!(run.configuration_id.as_deref(), Some("1"));
        assert_eq!(run.initiator, Initiator::User("ops".into()));
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.results[0].database, "A");
        assert!(run.results[0].success);
        assert_eq!(run.results[1].database, "B");
        assert!(!run.results[1].success);
        assert!(run.results[1].error.is_some());
        assert_eq!(run.total_size_bytes, 64);
        assert_eq!(planner.get("1").unwrap().last_run_at, Some(run.started_at));
    }

    #[tokio::test]
    async fn rescheduling_keeps_a_single_trigger() {
        let h = harness(FakeRunner::new(), &[], Duration::ZERO);
        let planner = ScheduledBackupPlanner::in_memory(h.orchestrator.clone());

        planner.schedule(config("nightly", "0 2 * * *", &[])).unwrap();
        planner.schedule(config("nightly", "30 3 * * *", &[])).unwrap();
        planner.schedule(config("weekly", "@weekly", &[])).unwrap();

        assert_eq!(planner.active_triggers(), vec!["nightly", "weekly"]);
        assert_eq!(planner.get("nightly").unwrap().schedule, "30 3 * * *");
        assert_eq!(planner.list().len(), 2);
    }

    #[tokio::test]
    async fn disabled_and_unscheduled_configurations_have_no_trigger() {
        let h = harness(FakeRunner::new(), &[], Duration::ZERO);
        let planner = ScheduledBackupPlanner::in_memory(h.orchestrator.clone());

        let mut off = config("off", "@daily", &[]);
        off.enabled = false;
        planner.schedule(off).unwrap();
        planner.schedule(config("on", "@daily", &[])).unwrap();
        assert_eq!(planner.active_triggers(), vec!["on"]);
        assert_eq!(planner.next_run("off").unwrap(), None);

        let updated = planner.unschedule("on").unwrap();
        assert!(!updated.enabled);
        assert!(planner.active_triggers().is_empty());

        planner.remove("on").unwrap();
        assert!(matches!(planner.get("on"), Err(AppError::NotFound(_))));
        assert!(matches!(planner.unschedule("on"), Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn invalid_configurations_are_rejected() {
        let h = harness(FakeRunner::new(), &[], Duration::ZERO);
        let planner = ScheduledBackupPlanner::in_memory(h.orchestrator.clone());

        let err = planner.schedule(config("1", "every day", &[])).unwrap_err();
        assert!(matches!(err, AppError::InvalidSchedule(_)));
        let err = planner.schedule(config("1", "@daily", &["bad;name"])).unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentifier(_)));
        let mut forever = config("1", "@daily", &[]);
        forever.retention_days = 100_000_000;
        assert!(matches!(planner.schedule(forever).unwrap_err(), AppError::Config(_)));
        assert!(planner.list().is_empty());
        assert!(planner.active_triggers().is_empty());
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let runner = FakeRunner::new().with_delay(Duration::from_millis(150));
        let h = harness(runner, &["A"], Duration::ZERO);
        let planner = ScheduledBackupPlanner::in_memory(h.orchestrator.clone());
        planner.schedule(config("1", "@hourly", &[])).unwrap();

        let first = {
            let planner = planner.clone();
            tokio::spawn(async move { planner.fire_trigger("1").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(planner.fire_trigger("1").await.is_none());
        let err = planner.run_now("1", &admin()).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let run = first.await.unwrap().unwrap();
        assert_eq!(run.kind, RunKind::Scheduled);
        assert_eq!(run.initiator, Initiator::System);
        assert_eq!(h.orchestrator.store().runs().len(), 1);

        // slot is free again once the run is over
        assert!(planner.fire_trigger("1").await.is_some());
    }

    #[tokio::test]
    async fn create_assigns_id() {
        let h = harness(FakeRunner::new(), &[], Duration::ZERO);
        let planner = ScheduledBackupPlanner::in_memory(h.orchestrator.clone());
        let created = planner
            .create(ConfigurationDraft {
                name: "nightly".into(),
                schedule: "0 2 * * *".into(),
                databases: vec!["orders".into()],
                retention_days: 7,
                enabled: true,
            })
            .unwrap();
        assert!(!created.id.is_empty());
        assert_eq!(created.created_at, h.clock.now());
        assert_eq!(planner.active_triggers(), vec![created.id.clone()]);
        planner.shutdown();
        assert!(planner.active_triggers().is_empty());
    }
}
