//! Admission control for workflow runs.
//!
//! Decides whether a run may start, has to wait, or is rejected, based on an
//! overall limit and a per-workflow limit. State lives in memory only and is
//! rebuilt from events after a restart.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::config::{ParallelismConfig, ParallelismConstraint};

/// Outcome of [`ParallelismController::attempt_new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptAction {
    /// The run may execute now.
    Start,
    /// The run waits for a free slot.
    Queued,
    /// The waiting queue is full; the run is rejected.
    Failed,
}

impl fmt::Display for AttemptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Queued => write!(f, "Queued"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Default)]
struct WorkflowSlots {
    running: HashSet<String>,
    waiting: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    workflows: HashMap<String, WorkflowSlots>,
    total_running: usize,
    total_waiting: usize,
}

/// Gate deciding whether new runs may execute.
#[derive(Debug)]
pub struct ParallelismController {
    config: Option<ParallelismConfig>,
    state: Mutex<State>,
}

impl ParallelismController {
    /// Creates a controller. Without a config every run starts.
    #[must_use]
    pub fn new(config: Option<ParallelismConfig>) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Tries to admit `run` of `workflow`.
    ///
    /// A run that is already running is admitted again. Otherwise both
    /// constraints vote; a `Failed` vote rejects the run unless it is already
    /// waiting, a `Queued` vote registers it as waiting, and two `Start` votes
    /// register it as running.
    pub fn attempt_new(&self, namespace: &str, workflow: &str, run: &str) -> AttemptAction {
        let Some(config) = self.config else {
            return AttemptAction::Start;
        };
        let key = workflow_key(namespace, workflow);

        let mut state = self.state.lock();
        let State {
            workflows,
            total_running,
            total_waiting,
        } = &mut *state;

        let (already_queued, wf_running, wf_waiting) = match workflows.get(&key) {
            Some(slots) if slots.running.contains(run) => return AttemptAction::Start,
            Some(slots) => (slots.waiting.contains(run), slots.running.len(), slots.waiting.len()),
            None => (false, 0, 0),
        };

        let overall = vote(&config.overall, *total_running, *total_waiting);
        let single = vote(&config.single_workflow, wf_running, wf_waiting);

        let action = if overall == AttemptAction::Failed || single == AttemptAction::Failed {
            if already_queued {
                AttemptAction::Queued
            } else {
                AttemptAction::Failed
            }
        } else if overall == AttemptAction::Queued || single == AttemptAction::Queued {
            let slots = workflows.entry(key).or_default();
            if slots.waiting.insert(run.to_string()) {
                *total_waiting += 1;
            }
            AttemptAction::Queued
        } else {
            let slots = workflows.entry(key).or_default();
            if slots.running.insert(run.to_string()) {
                *total_running += 1;
            }
            if slots.waiting.remove(run) {
                *total_waiting = total_waiting.saturating_sub(1);
            }
            AttemptAction::Start
        };

        tracing::info!(wfr = run, workflow, namespace, %action, "Admission decision");
        action
    }

    /// Releases whatever `run` holds: its running slot, or its place in the
    /// waiting set if it ended while queued. Waiting runs are not promoted.
    pub fn mark_finished(&self, namespace: &str, workflow: &str, run: &str) {
        if self.config.is_none() {
            return;
        }

        let mut state = self.state.lock();
        let key = workflow_key(namespace, workflow);
        let Some(slots) = state.workflows.get_mut(&key) else {
            return;
        };
        let was_running = slots.running.remove(run);
        let was_waiting = slots.waiting.remove(run);
        if slots.running.is_empty() && slots.waiting.is_empty() {
            state.workflows.remove(&key);
        }

        if was_running {
            state.total_running = state.total_running.saturating_sub(1);
            tracing::info!(wfr = run, workflow, remaining = state.total_running, "Released running slot");
        }
        if was_waiting {
            state.total_waiting = state.total_waiting.saturating_sub(1);
            tracing::info!(wfr = run, workflow, waiting = state.total_waiting, "Dropped waiting run");
        }
    }

    /// Runs currently holding a slot.
    #[must_use]
    pub fn running(&self) -> usize {
        self.state.lock().total_running
    }

    /// Runs currently waiting.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().total_waiting
    }
}

fn workflow_key(namespace: &str, workflow: &str) -> String {
    format!("{namespace}/{workflow}")
}

/// One constraint's vote. Without a queue limit the parallel cap does not apply.
fn vote(constraint: &ParallelismConstraint, running: usize, waiting: usize) -> AttemptAction {
    let (Ok(max_parallel), Ok(max_queue)) = (
        usize::try_from(constraint.max_parallel),
        usize::try_from(constraint.max_queue_size),
    ) else {
        return AttemptAction::Start;
    };
    if max_parallel == 0 || max_queue == 0 || running < max_parallel {
        return AttemptAction::Start;
    }
    if waiting >= max_queue {
        AttemptAction::Failed
    } else {
        AttemptAction::Queued
    }
}
