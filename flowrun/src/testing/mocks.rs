//! Test doubles for the engine's ports.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::controller::EventHandler;
use crate::core::{Container, ObjectMeta, Pod, PodSpec, StageItem, Workflow, WorkflowRun};
use crate::errors::{EngineError, PodBuildError, Result, StoreError};
use crate::operator::{LABEL_POD_KIND, LABEL_WORKFLOW_RUN};
use crate::store::{PodBuilder, RunEvent};

/// Builds a one-container pod named `<run>-<stage>` for every stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestPodBuilder;

impl PodBuilder for TestPodBuilder {
    fn build(&self, _workflow: &Workflow, run: &WorkflowRun, stage: &StageItem) -> Result<Pod, PodBuildError> {
        if stage.name.is_empty() {
            return Err(PodBuildError::new("", "stage has no name"));
        }
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_WORKFLOW_RUN.to_string(), run.name().to_string());
        labels.insert(LABEL_POD_KIND.to_string(), "stage".to_string());

        Ok(Pod {
            metadata: ObjectMeta {
                labels,
                ..ObjectMeta::new(run.execution_namespace(), format!("{}-{}", run.name(), stage.name))
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    image: "busybox:1.36".to_string(),
                    command: vec!["true".to_string()],
                    volume_mounts: Vec::new(),
                }],
                volumes: Vec::new(),
                restart_policy: "Never".to_string(),
            },
        })
    }
}

/// An event handler that records what it sees.
///
/// The first `failures` calls for a run fail, which exercises the
/// controller's requeue path.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<(String, String)>>,
    failures: Mutex<BTreeMap<String, usize>>,
    resyncs: Mutex<usize>,
}

impl RecordingHandler {
    /// Creates a handler that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `times` events of run `name`.
    #[must_use]
    pub fn failing(self, name: impl Into<String>, times: usize) -> Self {
        self.failures.lock().insert(name.into(), times);
        self
    }

    /// `(kind, run name)` of every handled event, in order.
    #[must_use]
    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().clone()
    }

    /// Number of events handled for run `name`, failed ones included.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.seen.lock().iter().filter(|(_, n)| n == name).count()
    }

    /// Completed resync passes.
    #[must_use]
    pub fn resyncs(&self) -> usize {
        *self.resyncs.lock()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: RunEvent) -> Result<()> {
        let name = event.run().name().to_string();
        self.seen.lock().push((event.kind().to_string(), name.clone()));

        let mut failures = self.failures.lock();
        if let Some(left) = failures.get_mut(&name) {
            if *left > 0 {
                *left -= 1;
                return Err(EngineError::Store(StoreError::Backend(format!("injected failure for {name}"))));
            }
        }
        Ok(())
    }

    async fn resynced(&self) {
        *self.resyncs.lock() += 1;
    }
}
