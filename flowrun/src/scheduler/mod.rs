//! DAG scheduling: which stages run next and what that means for the run.
//!
//! Everything here is pure. The operator feeds in the workflow definition and
//! the latest run status and acts on the answer.

mod dag;
mod overall;

pub use dag::{next_stages, validate_workflow, NextStages, StageRetryPolicy};
pub use overall::overall_status;
