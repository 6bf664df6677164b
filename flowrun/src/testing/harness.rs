//! Engine harness backed by the in-memory store.

use std::sync::Arc;

use super::fixtures::{diamond_workflow, linear_workflow, TEST_NAMESPACE, TEST_WORKFLOW};
use super::mocks::TestPodBuilder;
use crate::config::{ControllerConfig, GC_IMAGE};
use crate::core::{PodInfo, StageItem, Workflow, WorkflowRun};
use crate::errors::StoreError;
use crate::events::CollectingEventRecorder;
use crate::operator::EngineContext;
use crate::store::{InMemoryStore, PodBuilder, ResourceStore};

/// Timeout given to seeded runs.
const SEED_TIMEOUT: &str = "1h";

/// An [`EngineContext`] over an [`InMemoryStore`] and a
/// [`CollectingEventRecorder`], with helpers to seed workflows, runs and
/// pods.
///
/// Helpers panic on store errors; they are meant for tests only.
#[derive(Debug)]
pub struct TestHarness {
    /// Backing store, with fault injection.
    pub store: Arc<InMemoryStore>,
    /// Recorder holding every emitted event.
    pub recorder: Arc<CollectingEventRecorder>,
    /// Context handed to operators and workers.
    pub ctx: Arc<EngineContext>,
}

impl TestHarness {
    /// Default test configuration: a cleanup image is set, everything else
    /// keeps its default.
    #[must_use]
    pub fn default_config() -> ControllerConfig {
        ControllerConfig::new().with_image(GC_IMAGE, "busybox:1.36")
    }

    /// Creates a harness with [`default_config`](Self::default_config).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Self::default_config())
    }

    /// Creates a harness with `config`.
    #[must_use]
    pub fn with_config(config: ControllerConfig) -> Self {
        Self::build(config, Arc::new(TestPodBuilder))
    }

    /// Creates a harness with the default config and a custom pod builder.
    #[must_use]
    pub fn with_pod_builder(pod_builder: Arc<dyn PodBuilder>) -> Self {
        Self::build(Self::default_config(), pod_builder)
    }

    fn build(config: ControllerConfig, pod_builder: Arc<dyn PodBuilder>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let recorder = Arc::new(CollectingEventRecorder::new());
        let ctx = EngineContext::new(store.clone(), pod_builder, recorder.clone(), config);
        Self { store, recorder, ctx }
    }

    /// Builds the linear workflow over `stages` without storing it.
    #[must_use]
    pub fn linear_workflow(&self, stages: &[&str]) -> Workflow {
        linear_workflow(stages)
    }

    /// Stores `workflow` unless a workflow with its name exists.
    ///
    /// # Panics
    ///
    /// On any store error other than the workflow already existing.
    pub async fn ensure_workflow(&self, workflow: Workflow) {
        match self.store.create_workflow(workflow).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => panic!("create workflow: {e}"),
        }
    }

    /// Stores the linear workflow over `stages` (the first seeded one wins)
    /// and a fresh run `name` of it.
    ///
    /// # Panics
    ///
    /// If the run already exists.
    pub async fn seed_linear(&self, name: &str, stages: &[&str]) -> WorkflowRun {
        self.ensure_workflow(linear_workflow(stages)).await;
        self.seed_run(name, TEST_WORKFLOW).await
    }

    /// Stores [`diamond_workflow`] as `diamond` and a fresh run `name` of it.
    ///
    /// # Panics
    ///
    /// If the run already exists.
    pub async fn seed_diamond(&self, name: &str) -> WorkflowRun {
        self.ensure_workflow(diamond_workflow("diamond")).await;
        self.seed_run(name, "diamond").await
    }

    /// Stores a fresh run `name` of `workflow`.
    ///
    /// # Panics
    ///
    /// If the run already exists.
    pub async fn seed_run(&self, name: &str, workflow: &str) -> WorkflowRun {
        let run = WorkflowRun::new(TEST_NAMESPACE, name, workflow).with_timeout(SEED_TIMEOUT);
        match self.store.create_workflow_run(run).await {
            Ok(run) => run,
            Err(e) => panic!("create run {name}: {e}"),
        }
    }

    /// Creates the pod of `stage` of stored run `run` directly in the store,
    /// bypassing the operator.
    ///
    /// # Panics
    ///
    /// If the run is missing or the pod cannot be created.
    pub async fn create_stage_pod(&self, run: &str, stage: &str) -> PodInfo {
        let stored = match self.store.get_workflow_run(TEST_NAMESPACE, run).await {
            Ok(run) => run,
            Err(e) => panic!("get run {run}: {e}"),
        };
        let workflow = linear_workflow(&[stage]);
        let pod = match TestPodBuilder.build(&workflow, &stored, &StageItem::new(stage)) {
            Ok(pod) => pod,
            Err(e) => panic!("build pod: {e}"),
        };
        match self.store.create_pod(pod).await {
            Ok(pod) => PodInfo::new(pod.metadata.name, pod.metadata.namespace),
            Err(e) => panic!("create pod: {e}"),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_seed_shares_workflow() {
        let harness = TestHarness::new();
        harness.seed_linear("r1", &["a", "b"]).await;
        harness.seed_linear("r2", &["a"]).await;

        let workflow = harness.store.get_workflow(TEST_NAMESPACE, TEST_WORKFLOW).await.unwrap();
        assert_eq!(workflow.stages.len(), 2);
        assert_eq!(harness.store.list_workflow_runs(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_stage_pod() {
        let harness = TestHarness::new();
        harness.seed_linear("r", &["a"]).await;
        let pod = harness.create_stage_pod("r", "a").await;
        assert_eq!(pod.name, "r-a");
        assert!(harness.store.get_pod(&pod.namespace, &pod.name).await.is_ok());
    }
}
