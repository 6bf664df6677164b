//! Failing runs that exceed their timeout.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::{add_duration, item_key, WorkflowRunItem, DEFAULT_TICK};
use crate::core::{Phase, Status, WorkflowRun};
use crate::events::{reasons, EventType};
use crate::operator::{EngineContext, RunOperator};
use crate::utils::parse_time;

/// Tracks running runs and fails those still running past
/// `creation + timeout`.
pub struct TimeoutProcessor {
    ctx: Arc<EngineContext>,
    items: DashMap<String, WorkflowRunItem>,
    tick: Duration,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for TimeoutProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutProcessor")
            .field("items", &self.items.len())
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl TimeoutProcessor {
    /// Creates a processor ticking every [`DEFAULT_TICK`].
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            items: DashMap::new(),
            tick: DEFAULT_TICK,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Sets the tick interval.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Get a handle that can be used to signal shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Tracks `run`. Runs whose timeout does not parse are not tracked.
    pub fn add(&self, run: &WorkflowRun) -> bool {
        let timeout = match parse_time(&run.spec.timeout) {
            Ok(timeout) => timeout,
            Err(e) => {
                warn!(wfr = %run.name(), error = %e, "Invalid timeout, run not tracked");
                return false;
            }
        };
        let created = run.metadata.creation_timestamp.unwrap_or_else(Utc::now);
        let item = WorkflowRunItem::new(run, add_duration(created, timeout), 0);
        debug!(wfr = %item, expire = %item.expire_time, "Track run for timeout");
        self.items.insert(item.key(), item);
        true
    }

    /// Stops tracking `namespace/name`.
    pub fn remove(&self, namespace: &str, name: &str) {
        self.items.remove(&item_key(namespace, name));
    }

    /// Tracked item of `namespace/name`.
    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<WorkflowRunItem> {
        self.items.get(&item_key(namespace, name)).map(|i| i.clone())
    }

    /// Number of tracked runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no run is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Stops every tracked run whose timeout passed at `now`.
    pub async fn process_expired(&self, now: DateTime<Utc>) {
        let expired: Vec<WorkflowRunItem> = self
            .items
            .iter()
            .filter(|i| i.is_expired(now))
            .map(|i| i.clone())
            .collect();

        for item in expired {
            info!(wfr = %item.name, ns = %item.namespace, "Start to process expired WorkflowRun");
            let mut op = match RunOperator::from_name(self.ctx.clone(), &item.namespace, &item.name).await {
                Ok(op) => op,
                Err(e) if e.is_not_found() => {
                    self.items.remove(&item.key());
                    continue;
                }
                Err(e) => {
                    error!(wfr = %item, error = %e, "Get WorkflowRun error");
                    continue;
                }
            };

            self.stop_run(&mut op).await;
            self.items.remove(&item.key());
        }
    }

    async fn stop_run(&self, op: &mut RunOperator) {
        op.record(EventType::Warning, reasons::TIMEOUT, "WorkflowRun execution timeout");

        if !op.run().is_terminated() {
            op.set_overall(
                Status::new(Phase::Failed)
                    .with_reason(reasons::TIMEOUT)
                    .with_message("WorkflowRun execution timeout"),
            );
            if let Err(e) = op.update().await {
                error!(wfr = %op.run().name(), error = %e, "Update WorkflowRun status error");
            }
        }

        let pods: Vec<_> = op
            .run()
            .status
            .stages
            .iter()
            .filter_map(|(stage, status)| status.pod.clone().map(|pod| (stage.clone(), pod)))
            .collect();
        for (stage, pod) in pods {
            info!(wfr = %op.run().name(), stg = %stage, pod = %pod.name, "Delete pod of expired WorkflowRun");
            if let Err(e) = self.ctx.store.delete_pod(&pod.namespace, &pod.name).await {
                if !e.is_not_found() {
                    error!(pod = %pod.name, error = %e, "Delete pod error");
                }
            }
        }

        op.record(EventType::Warning, reasons::TIMEOUT, "Stages stopped due to timeout");
    }

    /// Runs the tick loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(tick = ?self.tick, "Timeout processor started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Timeout processor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.tick) => {
                    self.process_expired(Utc::now()).await;
                }
            }
        }
        info!("Timeout processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PodInfo, StageStatus};
    use crate::errors::StoreError;
    use crate::store::ResourceStore;
    use crate::testing::TestHarness;
    use pretty_assertions::assert_eq;

    async fn running_run(harness: &TestHarness, name: &str, timeout: &str) -> WorkflowRun {
        let mut run = harness.seed_linear(name, &["a"]).await;
        run.spec.timeout = timeout.to_string();
        let pod: PodInfo = harness.create_stage_pod(name, "a").await;
        run.status.stages.insert(
            "a".to_string(),
            StageStatus {
                pod: Some(pod),
                ..StageStatus::with_status(Status::new(Phase::Running))
            },
        );
        run.status.overall = Status::new(Phase::Running);
        harness.store.update_workflow_run(run).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_parses_timeout() {
        let harness = TestHarness::new();
        let timeouts = TimeoutProcessor::new(harness.ctx.clone());

        let run = running_run(&harness, "r", "1h30m").await;
        assert!(timeouts.add(&run));
        let item = timeouts.get("ns", "r").unwrap();
        assert_eq!(
            item.expire_time - run.metadata.creation_timestamp.unwrap(),
            chrono::Duration::minutes(90)
        );

        let bad = running_run(&harness, "bad", "soon").await;
        assert!(!timeouts.add(&bad));
        assert_eq!(timeouts.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_run_is_failed_and_stopped() {
        let harness = TestHarness::new();
        let timeouts = TimeoutProcessor::new(harness.ctx.clone());
        let run = running_run(&harness, "r", "10m").await;
        timeouts.add(&run);

        timeouts.process_expired(Utc::now()).await;
        assert_eq!(timeouts.len(), 1);

        timeouts.process_expired(Utc::now() + chrono::Duration::minutes(11)).await;
        assert!(timeouts.is_empty());

        let stored = harness.store.get_workflow_run("ns", "r").await.unwrap();
        assert_eq!(stored.status.overall.phase, Phase::Failed);
        assert_eq!(stored.status.overall.reason, reasons::TIMEOUT);
        assert!(harness.store.pods().is_empty());

        let messages: Vec<_> = harness
            .recorder
            .with_reason(reasons::TIMEOUT)
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(
            messages,
            vec!["WorkflowRun execution timeout", "Stages stopped due to timeout"]
        );
    }

    #[tokio::test]
    async fn test_finished_run_keeps_status() {
        let harness = TestHarness::new();
        let timeouts = TimeoutProcessor::new(harness.ctx.clone());
        let mut run = running_run(&harness, "r", "1s").await;
        timeouts.add(&run);
        run.status.overall = Status::new(Phase::Succeeded);
        harness.store.update_workflow_run(run).await.unwrap();

        timeouts.process_expired(Utc::now() + chrono::Duration::minutes(1)).await;
        let stored = harness.store.get_workflow_run("ns", "r").await.unwrap();
        assert_eq!(stored.status.overall.phase, Phase::Succeeded);
        assert!(timeouts.is_empty());
    }

    #[tokio::test]
    async fn test_store_errors_keep_item() {
        let harness = TestHarness::new();
        let timeouts = TimeoutProcessor::new(harness.ctx.clone());
        let run = running_run(&harness, "r", "1s").await;
        timeouts.add(&run);
        harness
            .store
            .inject_get_errors(vec![StoreError::Backend("connection reset".to_string())]);

        let later = Utc::now() + chrono::Duration::minutes(1);
        timeouts.process_expired(later).await;
        assert_eq!(timeouts.len(), 1);

        harness.store.delete_workflow_run("ns", "r").await.unwrap();
        timeouts.process_expired(later).await;
        assert!(timeouts.is_empty());
    }
}
