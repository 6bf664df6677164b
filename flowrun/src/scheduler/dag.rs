//! DAG traversal: which stages of a run can start next.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

use crate::core::{Phase, StageItem, Workflow, WorkflowRun};
use crate::errors::InvalidWorkflowError;

/// How often and how soon a stage put back to pending may run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageRetryPolicy {
    /// Maximum number of retries per stage.
    pub limit: u32,
    /// Seconds to wait after a stage was put back before re-running it.
    pub interval_seconds: u64,
}

impl StageRetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(limit: u32, interval_seconds: u64) -> Self {
        Self {
            limit,
            interval_seconds,
        }
    }
}

/// Result of [`next_stages`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NextStages {
    /// Stages to start now, in declaration order.
    pub runnable: Vec<String>,
    /// Stages whose retry budget is spent; the caller marks them failed.
    pub abandoned_retries: Vec<String>,
}

impl NextStages {
    /// Returns true if nothing can start.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runnable.is_empty()
    }
}

/// Determines the stages that can start now.
///
/// A stage is a candidate when the run has no status for it yet, or its status
/// is still `Pending` (initialised, or waiting for a retry). A candidate runs
/// once each dependency has succeeded; failed or cancelled dependencies only
/// count when they are trivial. Stages waiting for a retry additionally need
/// their retry window to have passed and their budget to be left.
#[must_use]
pub fn next_stages(
    policy: StageRetryPolicy,
    workflow: &Workflow,
    run: &WorkflowRun,
    now: DateTime<Utc>,
) -> NextStages {
    let stages = &run.status.stages;
    let mut next = NextStages::default();

    for stage in &workflow.stages {
        let retry = match stages.get(&stage.name) {
            None => None,
            Some(s) if s.status.phase == Phase::Pending => s.status.retry_status.as_ref(),
            Some(_) => continue,
        };

        if !dependencies_met(workflow, run, stage) {
            continue;
        }

        if let Some(retry) = retry {
            if retry.times >= policy.limit {
                next.abandoned_retries.push(stage.name.clone());
                continue;
            }
            let interval = Duration::seconds(i64::try_from(policy.interval_seconds).unwrap_or(i64::MAX));
            let ready_at = retry
                .start_time
                .checked_add_signed(interval)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now < ready_at {
                continue;
            }
        }

        next.runnable.push(stage.name.clone());
    }

    next
}

fn dependencies_met(workflow: &Workflow, run: &WorkflowRun, stage: &StageItem) -> bool {
    stage.depends.iter().all(|dep| {
        run.status.stages.get(dep).is_some_and(|s| {
            let phase = s.status.phase;
            phase == Phase::Succeeded
                || (matches!(phase, Phase::Failed | Phase::Cancelled) && workflow.is_trivial(dep))
        })
    })
}

/// Checks the DAG invariants the scheduler relies on.
///
/// Stage names must be unique, every dependency must name an existing stage,
/// and the graph must be acyclic.
///
/// # Errors
///
/// Returns an [`InvalidWorkflowError`] naming the offending stages.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), InvalidWorkflowError> {
    let name = &workflow.metadata.name;
    let mut by_name: HashMap<&str, &StageItem> = HashMap::new();

    for stage in &workflow.stages {
        if by_name.insert(stage.name.as_str(), stage).is_some() {
            return Err(InvalidWorkflowError::new(name, format!("duplicate stage '{}'", stage.name))
                .with_stages(vec![stage.name.clone()]));
        }
    }

    for stage in &workflow.stages {
        for dep in &stage.depends {
            if dep == &stage.name {
                return Err(InvalidWorkflowError::new(
                    name,
                    format!("stage '{}' cannot depend on itself", stage.name),
                )
                .with_stages(vec![stage.name.clone()]));
            }
            if !by_name.contains_key(dep.as_str()) {
                return Err(InvalidWorkflowError::new(
                    name,
                    format!("stage '{}' depends on unknown stage '{dep}'", stage.name),
                )
                .with_stages(vec![stage.name.clone(), dep.clone()]));
            }
        }
    }

    let mut visited = HashSet::new();
    let mut path = Vec::new();
    for stage in &workflow.stages {
        if let Some(cycle) = find_cycle(stage.name.as_str(), &by_name, &mut visited, &mut path) {
            return Err(InvalidWorkflowError::new(name, format!("cycle detected: {}", cycle.join(" -> ")))
                .with_stages(cycle));
        }
    }

    Ok(())
}

/// Depth-first search returning the first cycle reachable from `node`.
fn find_cycle<'a>(
    node: &'a str,
    stages: &HashMap<&'a str, &'a StageItem>,
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    if let Some(pos) = path.iter().position(|n| *n == node) {
        let mut cycle: Vec<String> = path[pos..].iter().map(|s| (*s).to_string()).collect();
        cycle.push(node.to_string());
        return Some(cycle);
    }
    if visited.contains(node) {
        return None;
    }

    path.push(node);
    if let Some(stage) = stages.get(node) {
        for dep in &stage.depends {
            if let Some(cycle) = find_cycle(dep.as_str(), stages, visited, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    visited.insert(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RetryStatus, StageStatus, Status};
    use pretty_assertions::assert_eq;

    fn abc() -> Workflow {
        Workflow::new("ns", "wf")
            .with_stage(StageItem::new("A"))
            .with_stage(StageItem::new("B").depends_on("A"))
            .with_stage(StageItem::new("C"))
    }

    fn with_stage(mut run: WorkflowRun, name: &str, status: Status) -> WorkflowRun {
        run.status
            .stages
            .insert(name.to_string(), StageStatus::with_status(status));
        run
    }

    fn policy() -> StageRetryPolicy {
        StageRetryPolicy::new(3, 60)
    }

    #[test]
    fn test_fresh_run_starts_roots() {
        let run = WorkflowRun::new("ns", "r", "wf");
        let next = next_stages(policy(), &abc(), &run, Utc::now());
        assert_eq!(next.runnable, vec!["A", "C"]);
    }

    #[test]
    fn test_succeeded_dependency_unlocks_dependent() {
        let run = with_stage(WorkflowRun::new("ns", "r", "wf"), "A", Status::new(Phase::Succeeded));
        let next = next_stages(policy(), &abc(), &run, Utc::now());
        assert_eq!(next.runnable, vec!["B", "C"]);
        assert!(next.abandoned_retries.is_empty());
    }

    #[test]
    fn test_failed_dependency_blocks_dependent() {
        let run = with_stage(WorkflowRun::new("ns", "r", "wf"), "A", Status::new(Phase::Failed));
        let next = next_stages(policy(), &abc(), &run, Utc::now());
        assert_eq!(next.runnable, vec!["C"]);
    }

    #[test]
    fn test_trivial_failure_does_not_block() {
        let wf = Workflow::new("ns", "wf")
            .with_stage(StageItem::new("lint").trivial())
            .with_stage(StageItem::new("build").depends_on("lint"));
        let run = with_stage(WorkflowRun::new("ns", "r", "wf"), "lint", Status::new(Phase::Failed));
        let next = next_stages(policy(), &wf, &run, Utc::now());
        assert_eq!(next.runnable, vec!["build"]);
    }

    #[test]
    fn test_initialised_pending_stage_is_candidate() {
        let run = with_stage(WorkflowRun::new("ns", "r", "wf"), "A", Status::new(Phase::Pending));
        let next = next_stages(policy(), &abc(), &run, Utc::now());
        assert_eq!(next.runnable, vec!["A", "C"]);
    }

    #[test]
    fn test_retry_waits_for_interval() {
        let now = Utc::now();
        let mut status = Status::new(Phase::Pending);
        status.retry_status = Some(RetryStatus {
            times: 1,
            start_time: now - Duration::seconds(10),
        });
        let run = with_stage(WorkflowRun::new("ns", "r", "wf"), "C", status);

        let early = next_stages(policy(), &abc(), &run, now);
        assert_eq!(early.runnable, vec!["A"]);

        let later = next_stages(policy(), &abc(), &run, now + Duration::seconds(60));
        assert_eq!(later.runnable, vec!["A", "C"]);
    }

    #[test]
    fn test_retry_limit_reached_is_abandoned() {
        let now = Utc::now();
        let mut status = Status::new(Phase::Pending);
        status.retry_status = Some(RetryStatus {
            times: 3,
            start_time: now - Duration::hours(1),
        });
        let run = with_stage(WorkflowRun::new("ns", "r", "wf"), "C", status);
        let next = next_stages(policy(), &abc(), &run, now);
        assert_eq!(next.runnable, vec!["A"]);
        assert_eq!(next.abandoned_retries, vec!["C"]);
    }

    #[test]
    fn test_started_stages_are_skipped() {
        let run = with_stage(WorkflowRun::new("ns", "r", "wf"), "A", Status::new(Phase::Running));
        let next = next_stages(policy(), &abc(), &run, Utc::now());
        assert_eq!(next.runnable, vec!["C"]);
    }

    #[test]
    fn test_validate_accepts_dag() {
        assert!(validate_workflow(&abc()).is_ok());
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let wf = Workflow::new("ns", "wf")
            .with_stage(StageItem::new("a").depends_on("c"))
            .with_stage(StageItem::new("b").depends_on("a"))
            .with_stage(StageItem::new("c").depends_on("b"));
        let err = validate_workflow(&wf).unwrap_err();
        assert!(err.message.starts_with("cycle detected"));
        assert_eq!(err.stages.first(), err.stages.last());
    }

    #[test]
    fn test_validate_rejects_dangling_and_duplicate() {
        let dangling = Workflow::new("ns", "wf").with_stage(StageItem::new("a").depends_on("ghost"));
        assert!(validate_workflow(&dangling).unwrap_err().message.contains("unknown stage 'ghost'"));

        let duplicate = Workflow::new("ns", "wf")
            .with_stage(StageItem::new("a"))
            .with_stage(StageItem::new("a"));
        assert!(validate_workflow(&duplicate).unwrap_err().message.contains("duplicate"));

        let selfish = Workflow::new("ns", "wf").with_stage(StageItem::new("a").depends_on("a"));
        assert!(validate_workflow(&selfish).is_err());
    }
}
