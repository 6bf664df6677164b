//! Driving a run forward: picking the next stages and launching their pods.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::RunOperator;
use crate::core::{Phase, PodInfo, StageItem, Status, Workflow};
use crate::errors::{Result, StoreError};
use crate::events::{reasons, EventType};
use crate::queue::BlockingStage;
use crate::scheduler::{next_stages, validate_workflow};

/// What happened when a stage pod was launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The pod was created.
    Created(PodInfo),
    /// The namespace quota refused the pod; the stage should wait.
    QuotaExceeded(StoreError),
    /// The stage failed permanently; its status says why.
    Failed,
}

impl RunOperator {
    /// Starts every stage that can run now and resolves the overall status.
    ///
    /// Stages refused on quota are handed to the blocking-stage processor and
    /// keep the `Running` phase with reason `StageQueued`.
    ///
    /// # Errors
    ///
    /// Fails if the workflow cannot be loaded or is malformed, or if the
    /// status cannot be persisted.
    pub async fn reconcile(&mut self) -> Result<()> {
        let workflow = self.workflow().await?.clone();
        if let Err(e) = validate_workflow(&workflow) {
            self.record(EventType::Warning, reasons::INVALID_WORKFLOW, &e.to_string());
            return Err(e.into());
        }

        self.init_stages_status(&workflow);

        let now = Utc::now();
        let next = next_stages(self.ctx.retry_policy(), &workflow, &self.run, now);

        for stage in &next.abandoned_retries {
            warn!(wfr = %self.run.name(), stg = %stage, "Stage retry limit exceeded");
            let message = format!(
                "Stage '{stage}' failed after {} retries",
                self.ctx.config.stage_retry.limit
            );
            self.record(EventType::Warning, reasons::RETRY_LIMIT_EXCEEDED, &message);
            self.update_stage_status(
                stage,
                Status::new(Phase::Failed)
                    .with_reason(reasons::RETRY_LIMIT_EXCEEDED)
                    .with_message(message)
                    .with_transition_time(now),
            );
        }

        if next.is_empty() {
            debug!(wfr = %self.run.name(), "No next stages to run");
        } else {
            info!(wfr = %self.run.name(), stg = ?next.runnable, "Next stages to run");
        }

        for stage in &next.runnable {
            self.update_stage_status(
                stage,
                Status::new(Phase::Running)
                    .with_reason(reasons::STAGE_INITIALIZED)
                    .with_transition_time(now)
                    .with_start_time(now),
            );
        }

        self.resolve_overall().await?;
        if let Err(e) = self.update().await {
            error!(wfr = %self.run.name(), error = %e, "Update status error");
            return Err(e);
        }

        if next.is_empty() {
            return Ok(());
        }

        for name in &next.runnable {
            let Some(stage) = workflow.stage(name).cloned() else {
                continue;
            };
            info!(wfr = %self.run.name(), stg = %name, "Start to run stage");

            if let LaunchOutcome::QuotaExceeded(e) = self.launch_stage(&workflow, &stage).await {
                let message = format!("Stage '{name}' waits for resources: {e}");
                self.update_stage_status(
                    name,
                    Status::new(Phase::Running)
                        .with_reason(reasons::STAGE_QUEUED)
                        .with_message(message.clone()),
                );
                self.record(EventType::Normal, reasons::STAGE_QUEUED, &message);
                let blocked = BlockingStage::new(workflow.clone(), self.run.clone(), stage);
                if !self.ctx.submit_blocking(blocked) {
                    warn!(wfr = %self.run.name(), stg = %name, "Blocking stage processor is not running");
                }
            }
        }

        self.resolve_overall().await?;
        if let Err(e) = self.update().await {
            error!(wfr = %self.run.name(), error = %e, "Update status error");
            return Err(e);
        }
        Ok(())
    }

    /// Builds and creates the pod of `stage`, recording the result on the
    /// stage status. Quota refusals leave the status untouched.
    pub async fn launch_stage(&mut self, workflow: &Workflow, stage: &StageItem) -> LaunchOutcome {
        let name = stage.name.as_str();

        let mut pod = match self.ctx.pod_builder.build(workflow, &self.run, stage) {
            Ok(pod) => pod,
            Err(e) => {
                error!(wfr = %self.run.name(), stg = name, error = %e, "Create pod manifest for stage error");
                self.record(
                    EventType::Warning,
                    reasons::GENERATE_POD_SPEC_ERROR,
                    &format!("Generate pod for stage '{name}' error: {e}"),
                );
                self.update_stage_status(
                    name,
                    Status::new(Phase::Failed)
                        .with_reason(reasons::GENERATE_POD_ERROR)
                        .with_message(format!("Failed to generate pod: {e}")),
                );
                return LaunchOutcome::Failed;
            }
        };
        if pod.metadata.namespace.is_empty() {
            pod.metadata.namespace = self.run.execution_namespace().to_string();
        }
        debug!(stg = name, pod = %pod.metadata.name, "Pod manifest created");
        let own_pod = PodInfo::new(&pod.metadata.name, &pod.metadata.namespace);

        let created = match self.ctx.store.create_pod(pod).await {
            Ok(created) => Ok(PodInfo::new(&created.metadata.name, &created.metadata.namespace)),
            // A replayed launch finds the pod it created before.
            Err(e) if e.is_already_exists() => {
                debug!(wfr = %self.run.name(), stg = name, pod = %own_pod.name, "Stage pod already exists");
                Ok(own_pod)
            }
            Err(e) => Err(e),
        };

        match created {
            Ok(info) => {
                self.record(
                    EventType::Normal,
                    reasons::STAGE_POD_CREATED,
                    &format!("Create pod for stage '{name}' succeeded"),
                );
                self.update_stage_status(
                    name,
                    Status::new(Phase::Running).with_reason(reasons::STAGE_POD_CREATED),
                );
                self.update_stage_pod_info(name, info.clone());
                LaunchOutcome::Created(info)
            }
            Err(e) if e.is_quota_exceeded() => {
                info!(wfr = %self.run.name(), stg = name, error = %e, "Stage pod refused on quota");
                LaunchOutcome::QuotaExceeded(e)
            }
            Err(e) => {
                error!(wfr = %self.run.name(), stg = name, error = %e, "Create pod for stage error");
                self.record(
                    EventType::Warning,
                    reasons::STAGE_POD_CREATED,
                    &format!("Create pod for stage '{name}' error: {e}"),
                );
                self.update_stage_status(
                    name,
                    Status::new(Phase::Failed)
                        .with_reason(reasons::CREATE_POD_ERROR)
                        .with_message(format!("Failed to create pod: {e}")),
                );
                LaunchOutcome::Failed
            }
        }
    }
}
