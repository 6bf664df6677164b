//! Assertions on run status.

use crate::core::{Phase, WorkflowRun};

/// Asserts the overall phase of `run`.
#[track_caller]
pub fn assert_overall_phase(run: &WorkflowRun, expected: Phase) {
    assert_eq!(
        run.status.overall.phase, expected,
        "WorkflowRun '{}' overall phase, reason '{}'",
        run.name(),
        run.status.overall.reason
    );
}

/// Asserts the phase of `stage` in `run`. A missing stage fails.
#[track_caller]
pub fn assert_stage_phase(run: &WorkflowRun, stage: &str, expected: Phase) {
    let Some(status) = run.status.stages.get(stage) else {
        panic!("WorkflowRun '{}' has no status for stage '{stage}'", run.name());
    };
    assert_eq!(
        status.status.phase, expected,
        "stage '{stage}' of WorkflowRun '{}', reason '{}'",
        run.name(),
        status.status.reason
    );
}
