//! Overall status of a run, derived from its stage statuses.

use chrono::{DateTime, Utc};

use super::dag::{next_stages, StageRetryPolicy};
use crate::core::{Phase, Status, Workflow, WorkflowRun};

/// Computes the overall status of `run`.
///
/// The result is a pure function of the stage statuses plus whether more
/// stages can still start:
///
/// - no stage recorded yet: `Pending`
/// - any stage `Running`: `Running`
/// - any stage `Waiting`: `Waiting`
/// - any non-trivial stage failed, cancelled, in an unknown phase, or out of
///   retries: `Failed`
/// - stages can still start, or wait for a retry: `Running`
/// - otherwise: `Succeeded`
///
/// The returned status is stamped with `now` and carries the run's creation
/// time as its start time.
#[must_use]
pub fn overall_status(
    run: &WorkflowRun,
    workflow: &Workflow,
    policy: StageRetryPolicy,
    now: DateTime<Utc>,
) -> Status {
    let status = |phase| {
        let mut s = Status::new(phase).with_transition_time(now);
        s.start_time = run.metadata.creation_timestamp;
        s
    };

    if run.status.stages.is_empty() {
        return status(Phase::Pending);
    }

    let mut running = false;
    let mut waiting = false;
    let mut failed = false;
    let mut pending = false;

    for (name, stage) in &run.status.stages {
        let trivial = stage.trivial || workflow.is_trivial(name);
        match stage.status.phase {
            Phase::Running => running = true,
            Phase::Waiting => waiting = true,
            Phase::Pending => pending = true,
            Phase::Succeeded => {}
            Phase::Failed | Phase::Cancelled | Phase::Unknown => failed |= !trivial,
        }
    }

    let next = next_stages(policy, workflow, run, now);
    failed |= next
        .abandoned_retries
        .iter()
        .any(|name| !workflow.is_trivial(name));

    if running {
        status(Phase::Running)
    } else if waiting {
        status(Phase::Waiting)
    } else if failed {
        status(Phase::Failed)
    } else if !next.is_empty() || pending {
        status(Phase::Running)
    } else {
        status(Phase::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RetryStatus, StageItem, StageStatus};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn workflow() -> Workflow {
        Workflow::new("ns", "wf")
            .with_stage(StageItem::new("A"))
            .with_stage(StageItem::new("B").depends_on("A"))
            .with_stage(StageItem::new("lint").trivial())
    }

    fn run_with(stages: &[(&str, Phase)]) -> WorkflowRun {
        let mut run = WorkflowRun::new("ns", "r", "wf");
        for (name, phase) in stages {
            run.status
                .stages
                .insert((*name).to_string(), StageStatus::with_status(Status::new(*phase)));
        }
        run
    }

    fn phase_of(run: &WorkflowRun) -> Phase {
        overall_status(run, &workflow(), StageRetryPolicy::new(2, 30), Utc::now()).phase
    }

    #[test]
    fn test_empty_run_is_pending() {
        assert_eq!(phase_of(&run_with(&[])), Phase::Pending);
    }

    #[test]
    fn test_running_wins() {
        let run = run_with(&[("A", Phase::Failed), ("lint", Phase::Running)]);
        assert_eq!(phase_of(&run), Phase::Running);
    }

    #[test]
    fn test_waiting_before_failed() {
        let run = run_with(&[("A", Phase::Failed), ("lint", Phase::Waiting)]);
        assert_eq!(phase_of(&run), Phase::Waiting);
    }

    #[test]
    fn test_non_trivial_failure_fails_run() {
        let run = run_with(&[("A", Phase::Failed), ("lint", Phase::Succeeded)]);
        assert_eq!(phase_of(&run), Phase::Failed);
    }

    #[test]
    fn test_unknown_phase_fails_run() {
        let run = run_with(&[("A", Phase::Unknown), ("lint", Phase::Succeeded)]);
        assert_eq!(phase_of(&run), Phase::Failed);
    }

    #[test]
    fn test_trivial_failure_still_succeeds() {
        let run = run_with(&[("A", Phase::Succeeded), ("B", Phase::Succeeded), ("lint", Phase::Failed)]);
        assert_eq!(phase_of(&run), Phase::Succeeded);
    }

    #[test]
    fn test_runnable_stage_keeps_run_running() {
        let run = run_with(&[("A", Phase::Succeeded), ("lint", Phase::Succeeded)]);
        assert_eq!(phase_of(&run), Phase::Running);
    }

    #[test]
    fn test_exhausted_retry_fails_run() {
        let mut run = run_with(&[("A", Phase::Succeeded), ("lint", Phase::Succeeded)]);
        let mut status = Status::new(Phase::Pending);
        status.retry_status = Some(RetryStatus {
            times: 2,
            start_time: Utc::now() - Duration::hours(1),
        });
        run.status
            .stages
            .insert("B".to_string(), StageStatus::with_status(status));
        assert_eq!(phase_of(&run), Phase::Failed);
    }

    #[test]
    fn test_start_time_is_creation_time() {
        let mut run = run_with(&[("A", Phase::Running)]);
        let created = Utc::now() - Duration::minutes(3);
        run.metadata.creation_timestamp = Some(created);
        let status = overall_status(&run, &workflow(), StageRetryPolicy::default(), Utc::now());
        assert_eq!(status.start_time, Some(created));
    }
}
