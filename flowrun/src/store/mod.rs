//! Ports to the outside world: the resource store and the pod builder.
//!
//! The engine never talks to an API server directly. Everything it reads or
//! writes goes through a [`ResourceStore`], and stage pods are produced by a
//! [`PodBuilder`]. [`InMemoryStore`] implements the store for tests and for
//! embedders without a cluster.

mod memory;

pub use memory::{InMemoryStore, PodFault};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::{Pod, StageItem, Workflow, WorkflowRun};
use crate::errors::{PodBuildError, StoreError};

/// A change to a workflow run observed through [`ResourceStore::watch`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The run was created.
    Created(WorkflowRun),
    /// The run was updated.
    Updated(WorkflowRun),
    /// The run was deleted.
    Deleted(WorkflowRun),
}

impl RunEvent {
    /// The run the event is about.
    #[must_use]
    pub fn run(&self) -> &WorkflowRun {
        match self {
            Self::Created(run) | Self::Updated(run) | Self::Deleted(run) => run,
        }
    }

    /// `namespace/name` of the run.
    #[must_use]
    pub fn key(&self) -> String {
        self.run().metadata.key()
    }

    /// Event name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Access to stored workflows, runs and pods.
///
/// Writes of runs are optimistic: [`update_workflow_run`](Self::update_workflow_run)
/// fails with [`StoreError::Conflict`] when the stored resource version is
/// not the one carried by the submitted object.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetches a run.
    async fn get_workflow_run(&self, namespace: &str, name: &str) -> Result<WorkflowRun, StoreError>;

    /// Creates a run and returns the stored object.
    async fn create_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError>;

    /// Replaces a run if its resource version is current; returns the stored object.
    async fn update_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError>;

    /// Deletes a run.
    async fn delete_workflow_run(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Lists runs, optionally limited to one namespace.
    async fn list_workflow_runs(&self, namespace: Option<&str>) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Fetches a workflow.
    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Workflow, StoreError>;

    /// Creates a workflow.
    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, StoreError>;

    /// Creates a pod.
    async fn create_pod(&self, pod: Pod) -> Result<Pod, StoreError>;

    /// Fetches a pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError>;

    /// Deletes a pod.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Subscribes to run changes made after the call.
    fn watch(&self) -> broadcast::Receiver<RunEvent>;
}

/// Renders the pod that executes one stage of a run.
///
/// Failures are permanent for the stage.
#[cfg_attr(test, mockall::automock)]
pub trait PodBuilder: Send + Sync {
    /// Builds the pod for `stage`.
    fn build(&self, workflow: &Workflow, run: &WorkflowRun, stage: &StageItem) -> Result<Pod, PodBuildError>;
}
