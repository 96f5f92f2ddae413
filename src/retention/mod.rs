use chrono::Duration as ChronoDuration;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::store::ArtifactStore;
use crate::store::artifacts::remove_path;
use crate::utils::clock::Clock;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_runs: Vec<String>,
    pub removed_artifacts: Vec<String>,
    /// Human-readable reasons for entries that could not be removed this time.
    pub failures: Vec<String>,
}

impl PruneReport {
    pub fn is_noop(&self) -> bool {
        self.removed_runs.is_empty() && self.removed_artifacts.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    All,
    Configuration(&'a str),
    Excluding(&'a HashSet<String>),
}

impl Scope<'_> {
    fn covers(&self, configuration_id: Option<&str>) -> bool {
        match (self, configuration_id) {
            (Scope::All, _) => true,
            (Scope::Configuration(id), Some(run_config)) => *id == run_config,
            (Scope::Configuration(_), None) => false,
            (Scope::Excluding(configured), Some(run_config)) => !configured.contains(run_config),
            (Scope::Excluding(_), None) => true,
        }
    }

    fn covers_standalone(&self) -> bool {
        !matches!(self, Scope::Configuration(_))
    }
}

impl fmt::Display for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("all"),
            Scope::Configuration(id) => write!(f, "configuration:{}", id),
            Scope::Excluding(configured) => write!(f, "unconfigured (excluding {})", configured.len()),
        }
    }
}

/// Largest retention window a configuration may ask for, roughly a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Deletes runs and standalone artifacts older than a retention window.
pub struct RetentionManager {
    store: Arc<ArtifactStore>,
    clock: Arc<dyn Clock>,
}

impl RetentionManager {
    pub fn new(store: Arc<ArtifactStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Prunes every finished run and standalone artifact older than `max_age_days`.
    pub async fn prune(&self, max_age_days: u32) -> PruneReport {
        self.prune_matching(max_age_days, Scope::All).await
    }

    /// Prunes only the runs produced by one backup configuration.
    pub async fn prune_for(&self, configuration_id: &str, max_age_days: u32) -> PruneReport {
        self.prune_matching(max_age_days, Scope::Configuration(configuration_id))
            .await
    }

    /// Prunes standalone artifacts and runs that belong to none of `configured`.
    pub async fn prune_unconfigured(&self, configured: &HashSet<String>, max_age_days: u32) -> PruneReport {
        self.prune_matching(max_age_days, Scope::Excluding(configured))
            .await
    }

    async fn prune_matching(&self, max_age_days: u32, scope: Scope<'_>) -> PruneReport {
        let mut report = PruneReport::default();
        let Some(cutoff) = ChronoDuration::try_days(i64::from(max_age_days))
            .and_then(|window| self.clock.now().checked_sub_signed(window))
        else {
            debug!(max_age_days, scope = %scope, "Retention window reaches past the calendar, nothing to prune");
            return report;
        };

        let expired_runs = self.store.runs().into_iter().filter(|run| {
            run.status.is_terminal() && run.started_at < cutoff && scope.covers(run.configuration_id.as_deref())
        });
        for run in expired_runs {
            match remove_path(&run.folder).await {
                Ok(existed) => {
                    if !existed {
                        debug!(run_id = %run.id, folder = %run.folder.display(), "Run folder already gone");
                    }
                    self.store.forget_run(&run);
                    report.removed_runs.push(run.id);
                }
                Err(e) => {
                    warn!(run_id = %run.id, folder = %run.folder.display(), error = %e, "Failed to delete expired run, will retry on next prune");
                    report.failures.push(format!("run {}: {}", run.id, e));
                }
            }
        }

        if scope.covers_standalone() {
            let expired_standalone = self
                .store
                .artifacts()
                .into_iter()
                .filter(|a| a.run_id.is_none() && a.created_at < cutoff);
            for artifact in expired_standalone {
                let sidecar = artifact.path.with_extension("json");
                let removed = match remove_path(&artifact.path).await {
                    Ok(_) => remove_path(&sidecar).await,
                    Err(e) => Err(e),
                };
                match removed {
                    Ok(_) => {
                        self.store.forget_artifact(&artifact.id);
                        report.removed_artifacts.push(artifact.id);
                    }
                    Err(e) => {
                        warn!(artifact_id = %artifact.id, path = %artifact.path.display(), error = %e, "Failed to delete expired artifact, will retry on next prune");
                        report.failures.push(format!("artifact {}: {}", artifact.id, e));
                    }
                }
            }
        }

        if !report.is_noop() {
            info!(
                max_age_days,
                scope = %scope,
                runs = report.removed_runs.len(),
                artifacts = report.removed_artifacts.len(),
                failures = report.failures.len(),
                "Retention prune finished"
            );
        }
        report
    }
}
