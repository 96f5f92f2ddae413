use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::backup::batch::BatchOrchestrator;
use crate::errors::{AppError, Result};
use crate::models::{Caller, RestoreOperation, RunStatus};
use crate::store::{MemoryRepository, Repository};

/// Hands out operation ids for restores that run in the background.
pub struct RestoreOperationTracker {
    orchestrator: Arc<BatchOrchestrator>,
    operations: Arc<dyn Repository<RestoreOperation>>,
}

impl RestoreOperationTracker {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, operations: Arc<dyn Repository<RestoreOperation>>) -> Self {
        Self {
            orchestrator,
            operations,
        }
    }

    pub fn in_memory(orchestrator: Arc<BatchOrchestrator>) -> Self {
        Self::new(orchestrator, Arc::new(MemoryRepository::new()))
    }

    /// Validates the request, records an in-progress operation and restores in the background.
    ///
    /// `database` limits the restore to one database of the run.
    pub async fn start(&self, run_id: &str, database: Option<&str>, caller: &Caller) -> Result<String> {
        let plan = self.orchestrator.plan_restore(run_id, database, caller).await?;
        let now = self.orchestrator.clock().now();
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("restore_{}_{}", now.format("%Y%m%d_%H%M%S%3f"), &suffix[..8]);

        self.operations.upsert(RestoreOperation {
            id: id.clone(),
            run_id: run_id.to_string(),
            databases: plan.targets.iter().map(|t| t.database.clone()).collect(),
            status: RunStatus::InProgress,
            total_databases: plan.targets.len(),
            results: Vec::new(),
            started_at: now,
            completed_at: None,
            failure: None,
        });
        info!(operation_id = %id, run_id, databases = plan.targets.len(), "Restore operation started");

        let orchestrator = Arc::clone(&self.orchestrator);
        let operations = Arc::clone(&self.operations);
        let operation_id = id.clone();
        tokio::spawn(async move {
            let worker = {
                let orchestrator = Arc::clone(&orchestrator);
                let operations = Arc::clone(&operations);
                let operation_id = operation_id.clone();
                tokio::spawn(async move {
                    orchestrator
                        .restore_sequence(&plan, |result| {
                            operations.update(&operation_id, &mut |op| op.results.push(result.clone()));
                        })
                        .await
                })
            };
            let outcome = worker.await;
            let now = orchestrator.clock().now();
            operations.update(&operation_id, &mut |op| match &outcome {
                Ok(_) => {
                    op.finish(RunStatus::Completed, now);
                }
                Err(e) => {
                    if op.finish(RunStatus::Failed, now) {
                        op.failure = Some(format!("restore task aborted: {}", e));
                    }
                }
            });
            match outcome {
                Ok(results) => {
                    let failed = results.iter().filter(|r| !r.success).count();
                    info!(operation_id = %operation_id, succeeded = results.len() - failed, failed, "Restore operation finished");
                }
                Err(e) => error!(operation_id = %operation_id, error = %e, "Restore operation aborted"),
            }
        });

        Ok(id)
    }

    pub fn status(&self, operation_id: &str) -> Result<RestoreOperation> {
        self.operations
            .get(operation_id)
            .ok_or_else(|| AppError::not_found("restore operation", operation_id))
    }

    /// Newest first.
    pub fn list(&self) -> Vec<RestoreOperation> {
        let mut operations = self.operations.list();
        operations.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        operations
    }

    /// Polls until the operation reaches a terminal status.
    pub async fn wait(&self, operation_id: &str, poll_every: Duration) -> Result<RestoreOperation> {
        loop {
            let operation = self.status(operation_id)?;
            if operation.status.is_terminal() {
                return Ok(operation);
            }
            tokio::time::sleep(poll_every).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::batch::tests::harness;
    use crate::backup::batch::BatchRequest;
    use crate::models::RunKind;
    use crate::testing::FakeRunner;

    fn admin() -> Caller {
        Caller::Admin {
            label: "ops".into(),
        }
    }

    fn all(databases: &[&str]) -> BatchRequest {
        BatchRequest {
            databases: databases.iter().map(|d| d.to_string()).collect(),
            kind: RunKind::Manual,
            caller: admin(),
            configuration: None,
        }
    }

    #[tokio::test]
    async fn immediate_poll_sees_work_in_progress() {
        let h = harness(FakeRunner::new(), &[], Duration::from_millis(100));
        let run = h.orchestrator.run_batch(all(&["A", "B", "C"])).await.unwrap();
        let tracker = RestoreOperationTracker::in_memory(h.orchestrator.clone());

        let id = tracker.start(&run.id, None, &admin()).await.unwrap();
        let polled = tracker.status(&id).unwrap();
        assert_eq!(polled.status, RunStatus::InProgress);
        assert!(polled.completed_databases() < 3);
        assert_eq!(polled.total_databases, 3);
        assert!(polled.completed_at.is_none());

        let done = tracker.wait(&id, Duration::from_millis(20)).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.completed_databases(), 3);
        assert!(done.results.iter().all(|r| r.success));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn failures_are_per_database() {
        let runner = FakeRunner::new().failing_restore("B").panicking_restore("C");
        let h = harness(runner, &[], Duration::ZERO);
        let run = h.orchestrator.run_batch(all(&["A", "B", "C"])).await.unwrap();
        let tracker = RestoreOperationTracker::in_memory(h.orchestrator.clone());

        let id = tracker.start(&run.id, None, &admin()).await.unwrap();
        let done = tracker.wait(&id, Duration::from_millis(5)).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        let flags: Vec<(String, bool)> = done.results.iter().map(|r| (r.database.clone(), r.success)).collect();
        assert_eq!(
            flags,
            vec![("A".into(), true), ("B".into(), false), ("C".into(), false)]
        );
    }

    #[tokio::test]
    async fn single_database_restore() {
        let h = harness(FakeRunner::new(), &[], Duration::ZERO);
        let run = h.orchestrator.run_batch(all(&["A", "B"])).await.unwrap();
        let tracker = RestoreOperationTracker::in_memory(h.orchestrator.clone());

        let id = tracker.start(&run.id, Some("B"), &admin()).await.unwrap();
        let done = tracker.wait(&id, Duration::from_millis(5)).await.unwrap();
        assert_eq!(done.total_databases, 1);
        assert_eq!(done.databases, vec!["B"]);
        assert_eq!(done.results[0].database, "B");
        assert_eq!(tracker.list().len(), 1);
    }

    #[tokio::test]
    async fn unknown_run_or_operation_is_not_found() {
        let h = harness(FakeRunner::new(), &[], Duration::ZERO);
        let tracker = RestoreOperationTracker::in_memory(h.orchestrator.clone());
        assert!(matches!(
            tracker.start("nope", None, &admin()).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(tracker.status("nope"), Err(AppError::NotFound(_))));
        assert!(tracker.list().is_empty());
    }

    #[tokio::test]
    async fn in_progress_run_cannot_be_restored() {
        let runner = FakeRunner::new().with_delay(Duration::from_millis(200));
        let h = harness(runner, &[], Duration::ZERO);
        let background = h.orchestrator.start_batch(all(&["A"])).await.unwrap();
        let tracker = RestoreOperationTracker::in_memory(h.orchestrator.clone());

        let err = tracker.start(&background.run.id, None, &admin()).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        background.task.await.unwrap();
    }
}
