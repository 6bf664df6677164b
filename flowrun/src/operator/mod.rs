//! Operations on a single workflow run.
//!
//! A [`RunOperator`] holds a working copy of one run. Status mutators change
//! the copy only; [`RunOperator::update`] merges the copy into the latest
//! stored version and writes it back, retrying on conflicts.

mod context;
mod gc;
mod reconcile;

pub use context::EngineContext;
pub use gc::{gc_pod_name, LABEL_POD_KIND, LABEL_WORKFLOW_RUN};
pub use reconcile::LaunchOutcome;

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{
    resolve_status, static_status, KeyValue, Phase, PodInfo, RetryStatus, StageStatus, Status,
    Workflow, WorkflowRun, WorkflowRunStatus,
};
use crate::errors::{EngineError, Result};
use crate::events::{reasons, EventType};
use crate::scheduler::overall_status;

/// Performs operations on one workflow run.
#[derive(Debug)]
pub struct RunOperator {
    ctx: Arc<EngineContext>,
    run: WorkflowRun,
    workflow: Option<Workflow>,
}

impl RunOperator {
    /// Creates an operator working on a copy of `run`. The workflow is
    /// loaded on first use.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>, run: WorkflowRun) -> Self {
        Self {
            ctx,
            run,
            workflow: None,
        }
    }

    /// Creates an operator for the stored run `namespace/name`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the run cannot be fetched.
    pub async fn from_name(ctx: Arc<EngineContext>, namespace: &str, name: &str) -> Result<Self> {
        let run = ctx.store.get_workflow_run(namespace, name).await?;
        Ok(Self::new(ctx, run))
    }

    /// Uses `workflow` instead of loading it from the store.
    #[must_use]
    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// The working copy of the run.
    #[must_use]
    pub fn run(&self) -> &WorkflowRun {
        &self.run
    }

    /// Consumes the operator, returning the working copy.
    #[must_use]
    pub fn into_run(self) -> WorkflowRun {
        self.run
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Returns the run's workflow, fetching it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingWorkflowRef`] when the run names no
    /// workflow, or the store error if it cannot be fetched.
    pub async fn workflow(&mut self) -> Result<&Workflow> {
        if self.workflow.is_none() {
            if self.run.spec.workflow_ref.is_none() {
                return Err(EngineError::MissingWorkflowRef(self.run.metadata.key()));
            }
            let workflow = self
                .ctx
                .store
                .get_workflow(self.run.workflow_namespace(), self.run.workflow_name())
                .await?;
            self.workflow = Some(workflow);
        }
        self.workflow
            .as_ref()
            .ok_or_else(|| EngineError::MissingWorkflowRef(self.run.metadata.key()))
    }

    /// Records a user-facing event on the run.
    pub fn record(&self, event_type: EventType, reason: &str, message: &str) {
        self.ctx
            .recorder
            .record(&self.run.object_ref(), event_type, reason, message);
    }

    /// Adds a `Pending` status for every stage of `workflow` the run has not
    /// seen yet, recording the stage's dependencies and triviality.
    pub fn init_stages_status(&mut self, workflow: &Workflow) {
        for stage in &workflow.stages {
            self.run
                .status
                .stages
                .entry(stage.name.clone())
                .or_insert_with(|| StageStatus {
                    status: Status::new(Phase::Pending),
                    depends: stage.depends.clone(),
                    trivial: stage.trivial,
                    ..StageStatus::default()
                });
        }
    }

    /// Sets the status of `stage`.
    ///
    /// The start time of a stage that already left `Pending` is kept.
    pub fn update_stage_status(&mut self, stage: &str, status: Status) {
        match self.run.status.stages.get_mut(stage) {
            None => {
                self.run
                    .status
                    .stages
                    .insert(stage.to_string(), StageStatus::with_status(status));
            }
            Some(existing) => {
                let origin = std::mem::replace(&mut existing.status, status);
                if origin.phase != Phase::Pending {
                    existing.status.start_time = origin.start_time;
                }
            }
        }
    }

    /// Records where the pod of `stage` lives.
    pub fn update_stage_pod_info(&mut self, stage: &str, pod: PodInfo) {
        self.stage_entry(stage).pod = Some(pod);
    }

    /// Records the outputs of `stage`. Empty outputs are ignored.
    pub fn update_stage_outputs(&mut self, stage: &str, outputs: Vec<KeyValue>) {
        if outputs.is_empty() {
            return;
        }
        self.stage_entry(stage).outputs = outputs;
    }

    /// Puts `stage` back to `Pending` so it runs again after the retry
    /// interval, counting the retry.
    pub fn mark_stage_for_retry(&mut self, stage: &str, message: impl Into<String>) {
        let now = Utc::now();
        let entry = self.stage_entry(stage);
        let times = entry.status.retry_status.as_ref().map_or(0, |r| r.times) + 1;
        let mut status = Status::new(Phase::Pending)
            .with_reason(reasons::STAGE_RETRY)
            .with_message(message)
            .with_transition_time(now);
        status.start_time = entry.status.start_time;
        status.retry_status = Some(RetryStatus {
            times,
            start_time: now,
        });
        entry.status = status;
        entry.pod = None;
        info!(wfr = %self.run.name(), stg = stage, times, "Stage scheduled for retry");
    }

    /// Sets the overall status.
    pub fn set_overall(&mut self, status: Status) {
        self.run.status.overall = status;
    }

    /// Marks the run as waiting for an admission slot.
    pub fn mark_queued(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.record(EventType::Normal, reasons::PARALLELISM_QUEUED, &message);
        self.run.status.overall = Status::new(Phase::Pending)
            .with_reason(reasons::PARALLELISM_QUEUED)
            .with_message(message);
    }

    /// Marks the run as rejected by admission control.
    pub fn mark_rejected(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.record(EventType::Warning, reasons::PARALLELISM_EXCEEDED, &message);
        self.run.status.overall = Status::new(Phase::Failed)
            .with_reason(reasons::PARALLELISM_EXCEEDED)
            .with_message(message);
    }

    /// Recomputes the overall status from the stage statuses.
    ///
    /// # Errors
    ///
    /// Fails if the workflow cannot be loaded.
    pub async fn resolve_overall(&mut self) -> Result<()> {
        let policy = self.ctx.retry_policy();
        let workflow = self.workflow().await?.clone();
        self.run.status.overall = overall_status(&self.run, &workflow, policy, Utc::now());
        Ok(())
    }

    /// Writes the working copy's status into the store.
    ///
    /// Each attempt fetches the latest run, merges the working copy into it
    /// and writes only if something besides timestamps changed. Conflicts
    /// start a new attempt.
    ///
    /// # Errors
    ///
    /// Returns store errors other than conflicts, or
    /// [`EngineError::RetryExhausted`] when every attempt conflicted.
    pub async fn update(&mut self) -> Result<()> {
        let attempts = self.ctx.config.controller.update_attempts.max(1);
        let namespace = self.run.namespace().to_string();
        let name = self.run.name().to_string();

        for attempt in 1..=attempts {
            let latest = self.ctx.store.get_workflow_run(&namespace, &name).await?;
            let mut combined = latest.clone();
            merge_status(&mut combined.status, &self.run.status);

            if static_status(&latest.status) == static_status(&combined.status) {
                self.run.metadata.resource_version = latest.metadata.resource_version;
                debug!(wfr = %name, "Status unchanged, skip update");
                return Ok(());
            }

            combined.status.overall.last_transition_time = Some(Utc::now());
            match self.ctx.store.update_workflow_run(combined).await {
                Ok(stored) => {
                    self.run.metadata.resource_version = stored.metadata.resource_version;
                    info!(
                        wfr = %name,
                        status = %stored.status.overall.phase,
                        cleaned = stored.status.cleaned,
                        "WorkflowRun status updated"
                    );
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(wfr = %name, attempt, error = %e, "Update conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::RetryExhausted { name, attempts })
    }

    fn stage_entry(&mut self, stage: &str) -> &mut StageStatus {
        self.run
            .status
            .stages
            .entry(stage.to_string())
            .or_insert_with(|| StageStatus::with_status(Status::new(Phase::Running)))
    }
}

/// Merges `local` into `latest` in place.
///
/// Phases go through [`resolve_status`]; pod info, outputs, events and
/// dependencies only fill gaps; `cleaned` can only turn on.
fn merge_status(latest: &mut WorkflowRunStatus, local: &WorkflowRunStatus) {
    latest.cleaned |= local.cleaned;
    latest.overall = resolve_status(&latest.overall, &local.overall).clone();

    for (name, stage) in &local.stages {
        let Some(existing) = latest.stages.get_mut(name) else {
            latest.stages.insert(name.clone(), stage.clone());
            continue;
        };

        existing.status = resolve_status(&existing.status, &stage.status).clone();
        if existing.pod.is_none() {
            existing.pod.clone_from(&stage.pod);
        }
        if existing.outputs.is_empty() {
            existing.outputs.clone_from(&stage.outputs);
        }
        if existing.events.is_empty() {
            existing.events.clone_from(&stage.events);
        }
        if existing.depends.is_empty() {
            existing.depends.clone_from(&stage.depends);
        }
        existing.trivial = stage.trivial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ResourceStore;
    use crate::testing::TestHarness;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let harness = TestHarness::new();
        let run = harness.seed_linear("r", &["a"]).await;
        let before = harness.store.run_update_count();

        let mut op = RunOperator::new(harness.ctx.clone(), run);
        op.update_stage_status("a", Status::new(Phase::Running).with_reason("StageInitialized"));
        op.update().await.unwrap();
        op.update().await.unwrap();

        assert_eq!(harness.store.run_update_count() - before, 1);
    }

    #[tokio::test]
    async fn test_update_retries_conflicts() {
        let harness = TestHarness::new();
        let run = harness.seed_linear("r", &["a"]).await;
        harness.store.inject_update_conflicts(2);

        let mut op = RunOperator::new(harness.ctx.clone(), run);
        op.update_stage_status("a", Status::new(Phase::Running));
        op.update().await.unwrap();

        let stored = harness.store.get_workflow_run("ns", "r").await.unwrap();
        assert_eq!(stored.status.stages["a"].status.phase, Phase::Running);
    }

    #[tokio::test]
    async fn test_update_gives_up_after_budget() {
        let harness = TestHarness::new();
        let run = harness.seed_linear("r", &["a"]).await;
        harness.store.inject_update_conflicts(100);

        let mut op = RunOperator::new(harness.ctx.clone(), run);
        op.update_stage_status("a", Status::new(Phase::Running));
        let err = op.update().await.unwrap_err();
        assert!(matches!(err, EngineError::RetryExhausted { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn test_update_keeps_terminal_stage() {
        let harness = TestHarness::new();
        let run = harness.seed_linear("r", &["a"]).await;

        let mut finished = RunOperator::new(harness.ctx.clone(), run.clone());
        finished.update_stage_status("a", Status::new(Phase::Succeeded));
        finished.update().await.unwrap();

        let mut stale = RunOperator::new(harness.ctx.clone(), run);
        stale.update_stage_status("a", Status::new(Phase::Running));
        stale.update().await.unwrap();

        let stored = harness.store.get_workflow_run("ns", "r").await.unwrap();
        assert_eq!(stored.status.stages["a"].status.phase, Phase::Succeeded);
    }

    #[test]
    fn test_merge_fills_gaps_only() {
        let mut latest = WorkflowRunStatus::default();
        latest.stages.insert(
            "a".to_string(),
            StageStatus {
                pod: Some(PodInfo::new("pod-1", "ns")),
                ..StageStatus::with_status(Status::new(Phase::Running))
            },
        );

        let mut local = WorkflowRunStatus::default();
        local.cleaned = true;
        local.stages.insert(
            "a".to_string(),
            StageStatus {
                pod: Some(PodInfo::new("pod-2", "ns")),
                outputs: vec![KeyValue::new("image", "app:1")],
                trivial: true,
                ..StageStatus::with_status(Status::new(Phase::Succeeded))
            },
        );
        local
            .stages
            .insert("b".to_string(), StageStatus::with_status(Status::new(Phase::Pending)));

        merge_status(&mut latest, &local);

        let a = &latest.stages["a"];
        assert_eq!(a.status.phase, Phase::Succeeded);
        assert_eq!(a.pod, Some(PodInfo::new("pod-1", "ns")));
        assert_eq!(a.outputs.len(), 1);
        assert!(a.trivial);
        assert!(latest.stages.contains_key("b"));
        assert!(latest.cleaned);
    }

    #[test]
    fn test_update_stage_status_keeps_start_time() {
        let harness = TestHarness::new();
        let mut op = RunOperator::new(harness.ctx.clone(), WorkflowRun::new("ns", "r", "wf"));
        let started = Utc::now() - chrono::Duration::minutes(5);

        op.update_stage_status("a", Status::new(Phase::Running).with_start_time(started));
        op.update_stage_status("a", Status::new(Phase::Succeeded));
        assert_eq!(op.run().status.stages["a"].status.start_time, Some(started));
    }

    #[test]
    fn test_mark_stage_for_retry_counts() {
        let harness = TestHarness::new();
        let mut op = RunOperator::new(harness.ctx.clone(), WorkflowRun::new("ns", "r", "wf"));
        op.update_stage_status("a", Status::new(Phase::Failed));
        op.mark_stage_for_retry("a", "exit 1");
        op.mark_stage_for_retry("a", "exit 1");

        let status = &op.run().status.stages["a"].status;
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.retry_status.as_ref().map(|r| r.times), Some(2));
    }

    #[test]
    fn test_outputs_and_pod_info() {
        let harness = TestHarness::new();
        let mut op = RunOperator::new(harness.ctx.clone(), WorkflowRun::new("ns", "r", "wf"));
        op.update_stage_outputs("a", Vec::new());
        assert!(op.run().status.stages.is_empty());

        op.update_stage_outputs("a", vec![KeyValue::new("k", "v")]);
        op.update_stage_pod_info("a", PodInfo::new("p", "ns"));
        let a = &op.run().status.stages["a"];
        assert_eq!(a.status.phase, Phase::Running);
        assert_eq!(a.pod.as_ref().map(|p| p.name.as_str()), Some("p"));
    }

    #[tokio::test]
    async fn test_missing_workflow_ref() {
        let harness = TestHarness::new();
        let mut run = WorkflowRun::new("ns", "r", "wf");
        run.spec.workflow_ref = None;
        let mut op = RunOperator::new(harness.ctx.clone(), run);
        assert!(matches!(op.workflow().await, Err(EngineError::MissingWorkflowRef(_))));
    }
}
