//! What the controller does with each run event.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::{Phase, WorkflowRun};
use crate::errors::Result;
use crate::events::reasons;
use crate::operator::{EngineContext, RunOperator};
use crate::parallelism::{AttemptAction, ParallelismController};
use crate::queue::BlockingStageProcessor;
use crate::store::RunEvent;
use crate::workers::{GcProcessor, RunHistoryLimiter, TimeoutProcessor};

/// Reacts to run events delivered by the controller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. Errors make the controller retry the event later.
    async fn handle(&self, event: RunEvent) -> Result<()>;

    /// Called after every resync pass over all runs.
    async fn resynced(&self) {}
}

/// The engine's [`EventHandler`]: admission, reconciliation and cleanup.
pub struct RunHandler {
    ctx: Arc<EngineContext>,
    parallelism: ParallelismController,
    gc: Arc<GcProcessor>,
    timeout: Arc<TimeoutProcessor>,
    limiter: RunHistoryLimiter,
    blocking: Option<Arc<BlockingStageProcessor>>,
}

impl std::fmt::Debug for RunHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandler")
            .field("parallelism", &self.parallelism)
            .field("gc", &self.gc)
            .field("timeout", &self.timeout)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl RunHandler {
    /// Creates a handler feeding the given workers.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>, gc: Arc<GcProcessor>, timeout: Arc<TimeoutProcessor>) -> Self {
        let parallelism = ParallelismController::new(ctx.config.parallelism);
        let limiter = RunHistoryLimiter::new(ctx.store.clone(), ctx.config.limits.max_workflow_runs);
        Self {
            ctx,
            parallelism,
            gc,
            timeout,
            limiter,
            blocking: None,
        }
    }

    /// Removes queued stages of deleted runs from `blocking`.
    #[must_use]
    pub fn with_blocking(mut self, blocking: Arc<BlockingStageProcessor>) -> Self {
        self.blocking = Some(blocking);
        self
    }

    /// The admission controller.
    #[must_use]
    pub fn parallelism(&self) -> &ParallelismController {
        &self.parallelism
    }

    /// The run history limiter.
    #[must_use]
    pub fn limiter(&self) -> &RunHistoryLimiter {
        &self.limiter
    }

    async fn on_change(&self, run: WorkflowRun, created: bool) -> Result<()> {
        if created {
            self.limiter.add_or_refresh(&run).await;
        } else {
            self.limiter.refresh(&run);
        }
        self.gc.add(&run);

        if run.is_terminated() {
            self.parallelism
                .mark_finished(run.namespace(), run.workflow_name(), run.name());
            self.timeout.remove(run.namespace(), run.name());
            return Ok(());
        }
        if run.status.overall.phase == Phase::Waiting {
            debug!(wfr = %run.name(), "WorkflowRun is waiting, skip");
            return Ok(());
        }

        self.timeout.add(&run);

        // Events may be replayed; work from the stored run, not the snapshot.
        let mut op = match RunOperator::from_name(self.ctx.clone(), run.namespace(), run.name()).await {
            Ok(op) => op,
            Err(e) if e.is_not_found() => {
                debug!(wfr = %run.name(), "WorkflowRun is gone, skip");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let latest = op.run();
        if latest.is_terminated() || latest.status.overall.phase == Phase::Waiting {
            debug!(wfr = %latest.name(), phase = %latest.status.overall.phase, "WorkflowRun moved on, skip");
            return Ok(());
        }

        let action = self
            .parallelism
            .attempt_new(latest.namespace(), latest.workflow_name(), latest.name());
        match action {
            AttemptAction::Start => op.reconcile().await,
            AttemptAction::Queued => {
                if op.run().status.overall.reason == reasons::PARALLELISM_QUEUED {
                    return Ok(());
                }
                op.mark_queued("WorkflowRun is waiting for a free parallelism slot");
                op.update().await
            }
            AttemptAction::Failed => {
                op.mark_rejected("WorkflowRun rejected, parallelism queue is full");
                op.update().await
            }
        }
    }

    async fn on_delete(&self, run: WorkflowRun) {
        info!(wfr = %run.name(), "Start to GC for WorkflowRun delete");
        if let Some(blocking) = &self.blocking {
            blocking.remove_run(run.namespace(), run.name());
        }
        self.parallelism
            .mark_finished(run.namespace(), run.workflow_name(), run.name());
        self.timeout.remove(run.namespace(), run.name());
        self.gc.remove(run.namespace(), run.name());

        let mut op = RunOperator::new(self.ctx.clone(), run);
        if let Err(e) = op.gc(true, true).await {
            warn!(wfr = %op.run().name(), error = %e, "GC for deleted WorkflowRun error");
        }
    }
}

#[async_trait]
impl EventHandler for RunHandler {
    async fn handle(&self, event: RunEvent) -> Result<()> {
        debug!(wfr = %event.run().name(), event = event.kind(), "Start to process WorkflowRun event");
        match event {
            RunEvent::Created(run) => self.on_change(run, true).await,
            RunEvent::Updated(run) => self.on_change(run, false).await,
            RunEvent::Deleted(run) => {
                self.on_delete(run).await;
                Ok(())
            }
        }
    }

    async fn resynced(&self) {
        let window = Duration::from_secs(self.ctx.config.controller.resync_seconds.saturating_mul(2));
        self.limiter.prune_stale(window, Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, ParallelismConfig, ParallelismConstraint, GC_IMAGE};
    use crate::core::Status;
    use crate::store::ResourceStore;
    use crate::testing::TestHarness;
    use pretty_assertions::assert_eq;

    fn handler(harness: &TestHarness) -> RunHandler {
        let gc = Arc::new(GcProcessor::new(harness.ctx.clone()));
        let timeout = Arc::new(TimeoutProcessor::new(harness.ctx.clone()));
        RunHandler::new(harness.ctx.clone(), gc, timeout)
    }

    async fn latest(harness: &TestHarness, name: &str) -> WorkflowRun {
        harness.store.get_workflow_run("ns", name).await.unwrap()
    }

    #[tokio::test]
    async fn test_created_run_is_reconciled_and_tracked() {
        let harness = TestHarness::new();
        let run = harness.seed_linear("r", &["a", "b"]).await;
        let handler = handler(&harness);

        handler.handle(RunEvent::Created(run)).await.unwrap();

        let run = latest(&harness, "r").await;
        assert_eq!(run.status.overall.phase, Phase::Running);
        assert_eq!(run.status.stages["a"].status.phase, Phase::Running);
        assert!(handler.timeout.get("ns", "r").is_some());
        assert_eq!(handler.limiter().runs("ns", "wf"), vec!["r"]);
        assert_eq!(handler.parallelism().running(), 0);
    }

    #[tokio::test]
    async fn test_replayed_created_event_is_idempotent() {
        let harness = TestHarness::new();
        let snapshot = harness.seed_linear("r", &["a"]).await;
        let handler = handler(&harness);

        handler.handle(RunEvent::Created(snapshot.clone())).await.unwrap();
        handler.handle(RunEvent::Created(snapshot)).await.unwrap();

        let run = latest(&harness, "r").await;
        assert_eq!(run.status.stages["a"].status.phase, Phase::Running);
        assert_eq!(run.status.overall.phase, Phase::Running);
        assert_eq!(harness.store.pod_create_attempts(), 1);
        assert_eq!(harness.recorder.with_reason(reasons::STAGE_POD_CREATED).len(), 1);
    }

    #[tokio::test]
    async fn test_event_for_vanished_run_is_dropped() {
        let harness = TestHarness::new();
        let run = harness.seed_linear("r", &["a"]).await;
        harness.store.delete_workflow_run("ns", "r").await.unwrap();
        let handler = handler(&harness);

        handler.handle(RunEvent::Updated(run)).await.unwrap();
        assert_eq!(harness.store.pod_create_attempts(), 0);
    }

    #[tokio::test]
    async fn test_finished_run_goes_to_gc_only() {
        let harness = TestHarness::new();
        let mut run = harness.seed_linear("r", &["a"]).await;
        run.status.overall = Status::new(Phase::Succeeded);
        let run = harness.store.update_workflow_run(run).await.unwrap();
        let handler = handler(&harness);

        handler.handle(RunEvent::Updated(run)).await.unwrap();

        assert!(handler.gc.get("ns", "r").is_some());
        assert!(handler.timeout.is_empty());
        assert_eq!(harness.store.pod_create_attempts(), 0);
    }

    #[tokio::test]
    async fn test_waiting_run_is_skipped() {
        let harness = TestHarness::new();
        let mut run = harness.seed_linear("r", &["a"]).await;
        run.status.overall = Status::new(Phase::Waiting);
        let handler = handler(&harness);

        handler.handle(RunEvent::Updated(run)).await.unwrap();
        assert_eq!(harness.store.pod_create_attempts(), 0);
        assert!(handler.timeout.is_empty());
    }

    #[tokio::test]
    async fn test_admission_queues_and_rejects() {
        let config = ControllerConfig::new()
            .with_image(GC_IMAGE, "busybox:1.36")
            .with_parallelism(ParallelismConfig {
                overall: ParallelismConstraint::new(1, 1),
                single_workflow: ParallelismConstraint::default(),
            });
        let harness = TestHarness::with_config(config);
        let handler = handler(&harness);
        for name in ["r1", "r2", "r3"] {
            let run = harness.seed_linear(name, &["a"]).await;
            handler.handle(RunEvent::Created(run)).await.unwrap();
        }

        assert_eq!(latest(&harness, "r1").await.status.overall.phase, Phase::Running);
        let queued = latest(&harness, "r2").await.status.overall;
        assert_eq!((queued.phase, queued.reason.as_str()), (Phase::Pending, reasons::PARALLELISM_QUEUED));
        let rejected = latest(&harness, "r3").await.status.overall;
        assert_eq!(
            (rejected.phase, rejected.reason.as_str()),
            (Phase::Failed, reasons::PARALLELISM_EXCEEDED)
        );

        // A second sighting of the queued run does not emit another event.
        handler
            .handle(RunEvent::Updated(latest(&harness, "r2").await))
            .await
            .unwrap();
        assert_eq!(harness.recorder.with_reason(reasons::PARALLELISM_QUEUED).len(), 1);

        // Once r1 finishes, r2 gets its slot on the next event.
        let mut r1 = latest(&harness, "r1").await;
        r1.status.overall = Status::new(Phase::Succeeded);
        let r1 = harness.store.update_workflow_run(r1).await.unwrap();
        handler.handle(RunEvent::Updated(r1)).await.unwrap();
        handler
            .handle(RunEvent::Updated(latest(&harness, "r2").await))
            .await
            .unwrap();
        assert_eq!(latest(&harness, "r2").await.status.overall.phase, Phase::Running);
    }

    #[tokio::test]
    async fn test_deleted_run_is_cleaned_silently() {
        let harness = TestHarness::new();
        let run = harness.seed_linear("r", &["a"]).await;
        let handler = handler(&harness);
        handler.handle(RunEvent::Created(run)).await.unwrap();
        assert_eq!(harness.store.pods().len(), 1);

        let run = latest(&harness, "r").await;
        harness.store.delete_workflow_run("ns", "r").await.unwrap();
        harness.recorder.clear();
        handler.handle(RunEvent::Deleted(run)).await.unwrap();

        assert!(harness.store.pods().is_empty());
        assert!(harness.recorder.is_empty());
        assert!(handler.timeout.is_empty());
    }

    #[tokio::test]
    async fn test_history_limit_deletes_oldest() {
        let config = ControllerConfig::new()
            .with_image(GC_IMAGE, "busybox:1.36")
            .with_max_workflow_runs(1);
        let harness = TestHarness::with_config(config);
        let handler = handler(&harness);

        let first = harness.seed_linear("first", &["a"]).await;
        handler.handle(RunEvent::Created(first)).await.unwrap();
        let second = harness.seed_linear("second", &["a"]).await;
        handler.handle(RunEvent::Created(second)).await.unwrap();

        assert!(harness.store.get_workflow_run("ns", "first").await.is_err());
        assert!(harness.store.get_workflow_run("ns", "second").await.is_ok());
    }
}
