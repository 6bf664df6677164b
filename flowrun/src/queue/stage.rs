//! A stage waiting for quota.

use chrono::{DateTime, Duration, Utc};

use super::heap::HeapItem;
use crate::core::{StageItem, Workflow, WorkflowRun};
use crate::utils::parse_time;

/// Consecutive quota refusals before a stage loses priority.
pub const MAX_RETRY: u32 = 10;

/// Seconds a demoted stage's block time moves back.
pub const TIME_STEP_SECS: i64 = 10;

/// Expiry in seconds of a blocked stage whose run has no usable timeout.
pub const DEFAULT_TIMEOUT_SECS: i64 = 2 * 60 * 60;

/// A stage whose pod creation was refused on quota.
///
/// Ordered by `block_time`: the stage blocked longest goes first.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockingStage {
    /// Workflow of the run.
    pub workflow: Workflow,
    /// Snapshot of the run when the stage was blocked.
    pub workflow_run: WorkflowRun,
    /// The blocked stage.
    pub stage: StageItem,
    /// Queue priority; earlier pops first.
    pub block_time: DateTime<Utc>,
    /// After this the stage is dropped.
    pub expire_time: DateTime<Utc>,
    /// Quota refusals since the last demotion.
    pub retry_count: u32,
}

impl BlockingStage {
    /// Blocks `stage` now. Expiry follows the run timeout.
    #[must_use]
    pub fn new(workflow: Workflow, workflow_run: WorkflowRun, stage: StageItem) -> Self {
        Self::blocked_at(workflow, workflow_run, stage, Utc::now())
    }

    /// Blocks `stage` at `now`.
    #[must_use]
    pub fn blocked_at(
        workflow: Workflow,
        workflow_run: WorkflowRun,
        stage: StageItem,
        now: DateTime<Utc>,
    ) -> Self {
        let timeout = parse_time(&workflow_run.spec.timeout)
            .ok()
            .and_then(|d| Duration::from_std(d).ok())
            .unwrap_or_else(|| Duration::seconds(DEFAULT_TIMEOUT_SECS));
        Self {
            workflow,
            workflow_run,
            stage,
            block_time: now,
            expire_time: now.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC),
            retry_count: 0,
        }
    }

    /// Queue key of a stage.
    #[must_use]
    pub fn key_for(namespace: &str, run: &str, stage: &str) -> String {
        format!("{namespace}/{run}/{stage}")
    }

    /// Returns true once the stage is past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time < now
    }

    /// Returns true if the stage belongs to the given run.
    #[must_use]
    pub fn belongs_to(&self, namespace: &str, run: &str) -> bool {
        self.workflow_run.namespace() == namespace && self.workflow_run.name() == run
    }

    /// Counts a quota refusal. Every [`MAX_RETRY`] refusals the stage is
    /// demoted by [`TIME_STEP_SECS`] so that stages behind it get a chance.
    pub fn record_quota_failure(&mut self) {
        self.retry_count += 1;
        if self.retry_count >= MAX_RETRY {
            self.retry_count = 0;
            self.block_time = self
                .block_time
                .checked_add_signed(Duration::seconds(TIME_STEP_SECS))
                .unwrap_or(self.block_time);
        }
    }
}

impl HeapItem for BlockingStage {
    type Priority = DateTime<Utc>;

    fn key(&self) -> String {
        Self::key_for(self.workflow_run.namespace(), self.workflow_run.name(), &self.stage.name)
    }

    fn priority(&self) -> DateTime<Utc> {
        self.block_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PriorityQueue;

    fn stage(run: &str, name: &str, timeout: &str) -> BlockingStage {
        BlockingStage::new(
            Workflow::new("ns", "wf"),
            WorkflowRun::new("ns", run, "wf").with_timeout(timeout),
            StageItem::new(name),
        )
    }

    #[test]
    fn test_key_and_ownership() {
        let s = stage("run-1", "build", "");
        assert_eq!(s.key(), "ns/run-1/build");
        assert!(s.belongs_to("ns", "run-1"));
        assert!(!s.belongs_to("ns", "run-2"));
    }

    #[test]
    fn test_expiry_follows_timeout() {
        let s = stage("r", "a", "30m");
        assert_eq!(s.expire_time - s.block_time, Duration::minutes(30));

        let fallback = stage("r", "a", "whenever");
        assert_eq!(
            fallback.expire_time - fallback.block_time,
            Duration::seconds(DEFAULT_TIMEOUT_SECS)
        );
        assert!(!fallback.is_expired(Utc::now()));
        assert!(fallback.is_expired(Utc::now() + Duration::hours(3)));
    }

    #[test]
    fn test_demotion_after_max_retry() {
        let mut s = stage("r", "a", "");
        let start = s.block_time;
        for _ in 0..MAX_RETRY - 1 {
            s.record_quota_failure();
        }
        assert_eq!(s.retry_count, MAX_RETRY - 1);
        assert_eq!(s.block_time, start);

        s.record_quota_failure();
        assert_eq!(s.retry_count, 0);
        assert_eq!(s.block_time, start + Duration::seconds(TIME_STEP_SECS));
    }

    #[tokio::test]
    async fn test_demoted_stage_yields_to_later_one() {
        let t0 = Utc::now();
        let blocked = |run: &str, at| {
            BlockingStage::blocked_at(
                Workflow::new("ns", "wf"),
                WorkflowRun::new("ns", run, "wf"),
                StageItem::new("a"),
                at,
            )
        };
        let mut early = blocked("early", t0);
        let late = blocked("late", t0 + Duration::seconds(5));

        let queue = PriorityQueue::new();
        queue.add(early.clone()).unwrap();
        queue.add(late.clone()).unwrap();

        for _ in 0..MAX_RETRY {
            early.record_quota_failure();
        }
        queue.update(early).unwrap();

        assert_eq!(queue.pop().await.unwrap().key(), "ns/late/a");
        assert_eq!(queue.pop().await.unwrap().key(), "ns/early/a");
    }
}
