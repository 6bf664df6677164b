//! Testing utilities for code driving the engine.
//!
//! This module provides:
//! - Workflow fixtures
//! - A pod builder that needs no templates
//! - A harness wiring an in-memory store and a collecting recorder into an
//!   [`EngineContext`](crate::operator::EngineContext)
//! - Assertions on stored run status

mod assertions;
mod fixtures;
mod harness;
mod mocks;

pub use assertions::{assert_overall_phase, assert_stage_phase};
pub use fixtures::{diamond_workflow, linear_workflow, TEST_NAMESPACE, TEST_WORKFLOW};
pub use harness::TestHarness;
pub use mocks::{RecordingHandler, TestPodBuilder};
