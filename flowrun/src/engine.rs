//! Wiring of the controller and its background workers.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ControllerConfig;
use crate::controller::{Controller, RunHandler};
use crate::errors::Result;
use crate::events::{EventRecorder, LoggingEventRecorder};
use crate::operator::EngineContext;
use crate::queue::BlockingStageProcessor;
use crate::retry::RetryConfig;
use crate::store::{PodBuilder, ResourceStore};
use crate::workers::{GcProcessor, TimeoutProcessor, DEFAULT_TICK};

/// Builder for [`Engine`].
pub struct EngineBuilder {
    store: Arc<dyn ResourceStore>,
    pod_builder: Arc<dyn PodBuilder>,
    recorder: Arc<dyn EventRecorder>,
    config: ControllerConfig,
    tick: Duration,
    retry: RetryConfig,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Sets the event recorder. Defaults to [`LoggingEventRecorder`].
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the tick of the GC and timeout workers.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Sets the backoff of failed controller events. Defaults to jittered
    /// exponential backoff.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Validates the configuration and starts every component.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`](crate::errors::EngineError::Config)
    /// for an invalid configuration, or the store error if the initial list
    /// of runs fails.
    pub async fn start(self) -> Result<Engine> {
        self.config.validate()?;
        let ctx = EngineContext::new(self.store, self.pod_builder, self.recorder, self.config);

        let blocking = BlockingStageProcessor::start(ctx.clone());
        let gc = Arc::new(GcProcessor::new(ctx.clone()).with_tick(self.tick));
        let timeout = Arc::new(TimeoutProcessor::new(ctx.clone()).with_tick(self.tick));
        let handler = RunHandler::new(ctx.clone(), gc.clone(), timeout.clone()).with_blocking(blocking.clone());

        let controller = Controller::new(
            ctx.store.clone(),
            Arc::new(handler),
            ctx.config.controller,
            self.retry,
        );
        if let Err(e) = controller.start().await {
            blocking.stop().await;
            return Err(e);
        }

        let workers = vec![
            tokio::spawn({
                let gc = gc.clone();
                async move { gc.run().await }
            }),
            tokio::spawn({
                let timeout = timeout.clone();
                async move { timeout.run().await }
            }),
        ];

        info!(tick = ?self.tick, "Engine started");
        Ok(Engine {
            ctx,
            controller,
            blocking,
            gc,
            timeout,
            workers,
        })
    }
}

/// A running engine: controller, blocking-stage processor, GC and timeout
/// workers sharing one [`EngineContext`].
pub struct Engine {
    ctx: Arc<EngineContext>,
    controller: Arc<Controller>,
    blocking: Arc<BlockingStageProcessor>,
    gc: Arc<GcProcessor>,
    timeout: Arc<TimeoutProcessor>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("controller", &self.controller)
            .field("gc", &self.gc)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts building an engine over `store` and `pod_builder`.
    #[must_use]
    pub fn builder(store: Arc<dyn ResourceStore>, pod_builder: Arc<dyn PodBuilder>) -> EngineBuilder {
        EngineBuilder {
            store,
            pod_builder,
            recorder: Arc::new(LoggingEventRecorder),
            config: ControllerConfig::default(),
            tick: DEFAULT_TICK,
            retry: RetryConfig::default().with_jitter(true),
        }
    }

    /// Shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// The controller.
    #[must_use]
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// The GC worker.
    #[must_use]
    pub fn gc(&self) -> &Arc<GcProcessor> {
        &self.gc
    }

    /// The timeout worker.
    #[must_use]
    pub fn timeout(&self) -> &Arc<TimeoutProcessor> {
        &self.timeout
    }

    /// The blocking-stage processor.
    #[must_use]
    pub fn blocking(&self) -> &Arc<BlockingStageProcessor> {
        &self.blocking
    }

    /// Stops the controller first, then the workers.
    pub async fn shutdown(self) {
        info!("Engine shutting down");
        self.controller.stop().await;
        // notify_one leaves a permit for a worker that is mid-pass.
        self.gc.shutdown_handle().notify_one();
        self.timeout.shutdown_handle().notify_one();
        self.blocking.stop().await;
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GC_IMAGE;
    use crate::core::{Phase, Status, WorkflowRun};
    use crate::errors::EngineError;
    use crate::events::CollectingEventRecorder;
    use crate::store::InMemoryStore;
    use crate::testing::{assert_overall_phase, assert_stage_phase, linear_workflow, TestPodBuilder};
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<InMemoryStore>,
        recorder: Arc<CollectingEventRecorder>,
        engine: Engine,
    }

    async fn start(config: ControllerConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        store.create_workflow(linear_workflow(&["a", "b"])).await.unwrap();
        let recorder = Arc::new(CollectingEventRecorder::new());
        let engine = Engine::builder(store.clone(), Arc::new(TestPodBuilder))
            .with_recorder(recorder.clone())
            .with_config(config)
            .with_tick(Duration::from_millis(20))
            .with_retry(RetryConfig::new().with_base_delay_ms(1))
            .start()
            .await
            .unwrap();
        Fixture { store, recorder, engine }
    }

    async fn wait_for(store: &InMemoryStore, name: &str, check: impl Fn(&WorkflowRun) -> bool) -> WorkflowRun {
        for _ in 0..400 {
            if let Ok(run) = store.get_workflow_run("ns", name).await {
                if check(&run) {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("WorkflowRun {name} did not reach the expected state");
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    /// Reports `stage` as succeeded, the way a pod watcher would.
    async fn finish_stage(store: &InMemoryStore, name: &str, stage: &str) {
        loop {
            let mut run = store.get_workflow_run("ns", name).await.unwrap();
            if let Some(status) = run.status.stages.get_mut(stage) {
                status.status = Status::new(Phase::Succeeded);
            }
            match store.update_workflow_run(run).await {
                Ok(_) => return,
                Err(e) if e.is_conflict() => continue,
                Err(e) => panic!("update run: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let err = Engine::builder(store, Arc::new(TestPodBuilder))
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_run_executes_stage_by_stage() {
        let config = ControllerConfig::new().with_image(GC_IMAGE, "busybox:1.36");
        let fx = start(config).await;
        fx.store
            .create_workflow_run(WorkflowRun::new("ns", "r", "wf").with_timeout("1h"))
            .await
            .unwrap();

        let run = wait_for(&fx.store, "r", |r| {
            r.status.stages.get("a").is_some_and(|s| s.pod.is_some())
        })
        .await;
        assert_overall_phase(&run, Phase::Running);
        assert_stage_phase(&run, "b", Phase::Pending);

        finish_stage(&fx.store, "r", "a").await;
        wait_for(&fx.store, "r", |r| r.status.stages.get("b").is_some_and(|s| s.pod.is_some())).await;

        finish_stage(&fx.store, "r", "b").await;
        let run = wait_for(&fx.store, "r", WorkflowRun::is_terminated).await;
        assert_overall_phase(&run, Phase::Succeeded);
        eventually(|| fx.engine.gc().get("ns", "r").is_some()).await;
        eventually(|| fx.engine.timeout().get("ns", "r").is_none()).await;
        assert_eq!(fx.recorder.with_reason(crate::events::reasons::STAGE_POD_CREATED).len(), 2);

        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_run_is_failed() {
        let config = ControllerConfig::new().with_image(GC_IMAGE, "busybox:1.36");
        let fx = start(config).await;
        fx.store
            .create_workflow_run(WorkflowRun::new("ns", "r", "wf").with_timeout("0s"))
            .await
            .unwrap();

        let run = wait_for(&fx.store, "r", WorkflowRun::is_terminated).await;
        assert_overall_phase(&run, Phase::Failed);
        assert_eq!(run.status.overall.reason, crate::events::reasons::TIMEOUT);

        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_deleted_run_pods_are_removed() {
        let config = ControllerConfig::new().with_image(GC_IMAGE, "busybox:1.36");
        let fx = start(config).await;
        fx.store
            .create_workflow_run(WorkflowRun::new("ns", "r", "wf").with_timeout("1h"))
            .await
            .unwrap();
        wait_for(&fx.store, "r", |r| r.status.stages.get("a").is_some_and(|s| s.pod.is_some())).await;
        assert_eq!(fx.store.pods().len(), 1);

        fx.store.delete_workflow_run("ns", "r").await.unwrap();
        eventually(|| fx.store.pods().is_empty()).await;

        fx.engine.shutdown().await;
    }
}
