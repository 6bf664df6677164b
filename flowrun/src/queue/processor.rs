//! Background relaunching of stages refused on quota.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BlockingStage, HeapItem, PriorityQueue};
use crate::errors::QueueError;
use crate::operator::{EngineContext, LaunchOutcome, RunOperator};

/// What [`BlockingStageProcessor::process`] did with a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The stage was launched, or failed permanently; the run was updated.
    Launched,
    /// The stage is back in the queue.
    Requeued,
    /// The stage was discarded.
    Dropped,
}

/// Holds stages waiting for namespace quota and relaunches them oldest
/// first.
///
/// An intake task moves stages submitted through
/// [`EngineContext::submit_blocking`] into the queue; a single worker pops
/// them. A stage that is refused again goes back into the queue and the
/// worker pauses for the configured quota backoff.
pub struct BlockingStageProcessor {
    ctx: Arc<EngineContext>,
    queue: Arc<PriorityQueue<BlockingStage>>,
    shutdown: Arc<Notify>,
    in_flight: tokio::sync::Mutex<()>,
    intake: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BlockingStageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingStageProcessor")
            .field("queued", &self.queue.len())
            .field("closed", &self.queue.is_closed())
            .finish_non_exhaustive()
    }
}

impl BlockingStageProcessor {
    /// Creates a processor without starting its tasks.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            queue: Arc::new(PriorityQueue::new()),
            shutdown: Arc::new(Notify::new()),
            in_flight: tokio::sync::Mutex::new(()),
            intake: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Creates a processor and spawns its intake and worker tasks.
    ///
    /// Must be called inside a tokio runtime. Only the first processor of a
    /// context receives submitted stages.
    #[must_use]
    pub fn start(ctx: Arc<EngineContext>) -> Arc<Self> {
        let processor = Self::new(ctx);

        match processor.ctx.take_blocking_receiver() {
            Some(rx) => *processor.intake.lock() = Some(tokio::spawn(processor.clone().intake(rx))),
            None => warn!("Blocking stage channel already taken, intake disabled"),
        }
        *processor.worker.lock() = Some(tokio::spawn(processor.clone().work()));
        info!("Blocking stage processor started");
        processor
    }

    /// The underlying queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<PriorityQueue<BlockingStage>> {
        &self.queue
    }

    /// Get a handle that can be used to signal shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Drops every queued stage of the run `namespace/run`.
    pub fn remove_run(&self, namespace: &str, run: &str) -> usize {
        let removed = self.queue.remove_where(|s| s.belongs_to(namespace, run));
        if !removed.is_empty() {
            info!(ns = namespace, wfr = run, count = removed.len(), "Removed blocking stages of run");
        }
        removed.len()
    }

    /// Tries to launch `stage` once more.
    pub async fn process(&self, mut stage: BlockingStage) -> ProcessOutcome {
        let namespace = stage.workflow_run.namespace().to_string();
        let name = stage.workflow_run.name().to_string();

        let run = match self.ctx.store.get_workflow_run(&namespace, &name).await {
            Ok(run) => run,
            Err(e) if e.is_not_found() => {
                info!(wfr = %name, stg = %stage.stage.name, "WorkflowRun is gone, drop blocking stage");
                return ProcessOutcome::Dropped;
            }
            Err(e) => {
                warn!(wfr = %name, error = %e, "Get WorkflowRun error, requeue blocking stage");
                return self.requeue(stage);
            }
        };
        if run.is_terminated() {
            info!(wfr = %name, stg = %stage.stage.name, "WorkflowRun already terminated, drop blocking stage");
            return ProcessOutcome::Dropped;
        }

        let workflow = stage.workflow.clone();
        let mut op = RunOperator::new(self.ctx.clone(), run).with_workflow(workflow.clone());
        match op.launch_stage(&workflow, &stage.stage).await {
            LaunchOutcome::QuotaExceeded(e) => {
                debug!(wfr = %name, stg = %stage.stage.name, retry = stage.retry_count, error = %e, "Still over quota");
                stage.record_quota_failure();
                self.requeue(stage)
            }
            LaunchOutcome::Created(_) | LaunchOutcome::Failed => {
                if let Err(e) = op.resolve_overall().await {
                    error!(wfr = %name, error = %e, "Resolve overall status error");
                }
                if let Err(e) = op.update().await {
                    error!(wfr = %name, error = %e, "Update status error");
                }
                ProcessOutcome::Launched
            }
        }
    }

    /// Stops both tasks after the stage being processed, if any, finished.
    pub async fn stop(&self) {
        {
            let _guard = self.in_flight.lock().await;
            self.shutdown.notify_waiters();
            self.queue.close();
        }
        // The intake holds no work of its own.
        let intake = self.intake.lock().take();
        if let Some(intake) = intake {
            intake.abort();
            if let Err(e) = intake.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Blocking stage intake failed");
                }
            }
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Blocking stage worker failed");
            }
        }
        info!("Blocking stage processor stopped");
    }

    fn requeue(&self, stage: BlockingStage) -> ProcessOutcome {
        match self.queue.add(stage) {
            Ok(()) => ProcessOutcome::Requeued,
            Err(QueueError::Closed) => ProcessOutcome::Dropped,
            Err(e) => {
                warn!(error = %e, "Requeue blocking stage error");
                ProcessOutcome::Dropped
            }
        }
    }

    async fn intake(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<BlockingStage>) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                received = rx.recv() => {
                    let Some(stage) = received else { break };
                    debug!(stage = %stage.key(), "Blocking stage received");
                    if self.queue.add(stage).is_err() {
                        break;
                    }
                }
            }
        }
        rx.close();
        debug!("Blocking stage intake stopped");
    }

    async fn work(self: Arc<Self>) {
        let backoff = self.ctx.config.blocking.quota_backoff();
        loop {
            let stage = match self.queue.pop().await {
                Ok(stage) => stage,
                Err(_) => break,
            };

            let outcome = {
                let _guard = self.in_flight.lock().await;
                if self.queue.is_closed() {
                    break;
                }
                if stage.is_expired(Utc::now()) {
                    warn!(
                        wfr = %stage.workflow_run.name(),
                        stg = %stage.stage.name,
                        "Blocking stage expired, drop it"
                    );
                    continue;
                }
                self.process(stage).await
            };

            if outcome == ProcessOutcome::Requeued {
                tokio::select! {
                    biased;
                    _ = self.shutdown.notified() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        debug!("Blocking stage worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, GC_IMAGE};
    use crate::core::{Phase, StageItem};
    use crate::errors::StoreError;
    use crate::events::reasons;
    use crate::queue::TIME_STEP_SECS;
    use crate::store::{PodFault, ResourceStore};
    use crate::testing::TestHarness;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn quota() -> StoreError {
        StoreError::QuotaExceeded("exceeded quota: compute-resources".to_string())
    }

    async fn blocked_stage(harness: &TestHarness, run: &str, stage: &str) -> BlockingStage {
        let workflow = harness.linear_workflow(&[stage]);
        let run = harness.store.get_workflow_run("ns", run).await.unwrap();
        BlockingStage::new(workflow, run, StageItem::new(stage))
    }

    #[tokio::test]
    async fn test_repeated_refusals_demote_stage() {
        let harness = TestHarness::new();
        harness.seed_linear("r", &["a"]).await;
        harness.store.inject_pod_fault(PodFault::always("r-a", quota()));
        let processor = BlockingStageProcessor::new(harness.ctx.clone());

        let stage = blocked_stage(&harness, "r", "a").await;
        let blocked_at = stage.block_time;
        let key = stage.key();
        processor.queue().add(stage).unwrap();

        for _ in 0..10 {
            let stage = processor.queue().delete(&key).unwrap();
            assert_eq!(processor.process(stage).await, ProcessOutcome::Requeued);
        }

        let demoted = processor.queue().get_by_key(&key).unwrap();
        assert_eq!(demoted.retry_count, 0);
        assert_eq!(demoted.block_time - blocked_at, Duration::seconds(TIME_STEP_SECS));
    }

    #[tokio::test]
    async fn test_process_launches_when_quota_frees() {
        let harness = TestHarness::new();
        harness.seed_linear("r", &["a"]).await;
        let processor = BlockingStageProcessor::new(harness.ctx.clone());

        let stage = blocked_stage(&harness, "r", "a").await;
        assert_eq!(processor.process(stage).await, ProcessOutcome::Launched);

        let run = harness.store.get_workflow_run("ns", "r").await.unwrap();
        assert_eq!(run.status.stages["a"].status.reason, reasons::STAGE_POD_CREATED);
        assert_eq!(run.status.overall.phase, Phase::Running);
        assert!(processor.queue().is_empty());
    }

    #[tokio::test]
    async fn test_process_drops_stage_of_deleted_run() {
        let harness = TestHarness::new();
        harness.seed_linear("r", &["a"]).await;
        let processor = BlockingStageProcessor::new(harness.ctx.clone());
        let stage = blocked_stage(&harness, "r", "a").await;
        harness.store.delete_workflow_run("ns", "r").await.unwrap();

        assert_eq!(processor.process(stage).await, ProcessOutcome::Dropped);
        assert_eq!(harness.store.pod_create_attempts(), 0);
    }

    #[tokio::test]
    async fn test_remove_run() {
        let harness = TestHarness::new();
        harness.seed_linear("r1", &["a", "b"]).await;
        harness.seed_linear("r2", &["a"]).await;
        let processor = BlockingStageProcessor::new(harness.ctx.clone());
        for (run, stage) in [("r1", "a"), ("r1", "b"), ("r2", "a")] {
            let stage = blocked_stage(&harness, run, stage).await;
            processor.queue().add(stage).unwrap();
        }

        assert_eq!(processor.remove_run("ns", "r1"), 2);
        assert_eq!(processor.queue().list_keys(), vec!["ns/r2/a".to_string()]);
    }

    #[tokio::test]
    async fn test_started_processor_relaunches_and_stops() {
        let config = ControllerConfig::new()
            .with_image(GC_IMAGE, "busybox:1.36")
            .with_quota_backoff_ms(10);
        let harness = TestHarness::with_config(config);
        harness.seed_linear("r", &["a"]).await;
        harness.store.inject_pod_fault(PodFault::times("r-a", quota(), 2));
        let processor = BlockingStageProcessor::start(harness.ctx.clone());

        let stage = blocked_stage(&harness, "r", "a").await;
        assert!(harness.ctx.submit_blocking(stage));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while harness.store.pods().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(harness.store.pod_create_attempts(), 3);

        processor.stop().await;
        assert!(processor.queue().is_closed());
        assert!(matches!(processor.queue().pop().await, Err(QueueError::Closed)));
    }
}
