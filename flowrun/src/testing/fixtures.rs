//! Workflow fixtures.

use crate::core::{StageItem, Workflow};

/// Namespace every fixture lives in.
pub const TEST_NAMESPACE: &str = "ns";

/// Name of the workflow built by [`linear_workflow`].
pub const TEST_WORKFLOW: &str = "wf";

/// A chain `stages[0] -> stages[1] -> ...` named [`TEST_WORKFLOW`].
#[must_use]
pub fn linear_workflow(stages: &[&str]) -> Workflow {
    let mut workflow = Workflow::new(TEST_NAMESPACE, TEST_WORKFLOW);
    let mut previous: Option<&str> = None;
    for name in stages {
        let mut stage = StageItem::new(*name);
        if let Some(previous) = previous {
            stage = stage.depends_on(previous);
        }
        workflow = workflow.with_stage(stage);
        previous = Some(name);
    }
    workflow
}

/// Workflow `name` with stages `A -> B` and an independent `C`.
#[must_use]
pub fn diamond_workflow(name: &str) -> Workflow {
    Workflow::new(TEST_NAMESPACE, name)
        .with_stage(StageItem::new("A"))
        .with_stage(StageItem::new("B").depends_on("A"))
        .with_stage(StageItem::new("C"))
}
