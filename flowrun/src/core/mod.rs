//! Core domain model types for flowrun.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Phase and status values with the pure merge helpers
//! - Stage events recorded in stage status
//! - The stored resources: workflows, runs and pods

mod event;
mod resource;
mod status;

pub use event::StageEvent;
pub use resource::{
    ArtifactItem, Container, ExecutionContext, ObjectMeta, ObjectReference, Pod, PodSpec,
    PresetVolume, StageItem, Volume, Workflow, WorkflowRef, WorkflowRun, WorkflowRunSpec,
};
pub use status::{
    resolve_status, static_status, KeyValue, Phase, PodInfo, RetryStatus, StageStatus, Status,
    WorkflowRunStatus,
};
