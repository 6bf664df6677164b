//! Shared dependencies of every operator and background worker.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ControllerConfig;
use crate::events::EventRecorder;
use crate::queue::BlockingStage;
use crate::scheduler::StageRetryPolicy;
use crate::store::{PodBuilder, ResourceStore};

/// Everything an operator needs to act on a run.
///
/// Built once at startup and handed around as `Arc<EngineContext>`. The
/// context also owns the channel through which stages refused on quota reach
/// the blocking-stage processor.
pub struct EngineContext {
    /// Resource store.
    pub store: Arc<dyn ResourceStore>,
    /// Stage pod builder.
    pub pod_builder: Arc<dyn PodBuilder>,
    /// Event recorder.
    pub recorder: Arc<dyn EventRecorder>,
    /// Controller configuration.
    pub config: Arc<ControllerConfig>,
    blocking_tx: mpsc::UnboundedSender<BlockingStage>,
    blocking_rx: Mutex<Option<mpsc::UnboundedReceiver<BlockingStage>>>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        pod_builder: Arc<dyn PodBuilder>,
        recorder: Arc<dyn EventRecorder>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let (blocking_tx, blocking_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            pod_builder,
            recorder,
            config: Arc::new(config),
            blocking_tx,
            blocking_rx: Mutex::new(Some(blocking_rx)),
        })
    }

    /// Retry policy for stages put back to pending.
    #[must_use]
    pub fn retry_policy(&self) -> StageRetryPolicy {
        self.config.stage_retry.into()
    }

    /// Hands a stage refused on quota to the blocking-stage processor.
    ///
    /// Returns false if the processor is gone.
    pub fn submit_blocking(&self, stage: BlockingStage) -> bool {
        self.blocking_tx.send(stage).is_ok()
    }

    /// Takes the receiving end of the blocking-stage channel. Only the first
    /// caller gets it.
    pub(crate) fn take_blocking_receiver(&self) -> Option<mpsc::UnboundedReceiver<BlockingStage>> {
        self.blocking_rx.lock().take()
    }
}
