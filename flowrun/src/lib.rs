//! # Flowrun
//!
//! The WorkflowRun execution engine of a Kubernetes-native CI/CD
//! orchestrator.
//!
//! A workflow is a DAG of stages; a workflow run is one execution of it.
//! The engine watches runs and drives each one to completion:
//!
//! - **Scheduling**: stages whose dependencies succeeded get a pod, failed
//!   stages are retried within a budget, and the overall run status is
//!   derived from the stage statuses
//! - **Admission**: overall and per-workflow parallelism limits queue or
//!   reject new runs
//! - **Quota handling**: stages refused on namespace quota wait in a
//!   priority queue and are relaunched in the background
//! - **Cleanup**: timeouts, garbage collection of finished runs and a
//!   bounded run history per workflow
//!
//! The engine talks to the cluster only through the
//! [`ResourceStore`](store::ResourceStore) and
//! [`PodBuilder`](store::PodBuilder) ports.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowrun::prelude::*;
//!
//! let config = load_config("/etc/flowrun/config.json")?;
//! init_logging(&config.logging);
//!
//! let engine = Engine::builder(store, pod_builder)
//!     .with_config(config)
//!     .start()
//!     .await?;
//!
//! // ...
//! engine.shutdown().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod controller;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod operator;
pub mod parallelism;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod utils;
pub mod workers;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{load_config, ControllerConfig, GcConfig, ParallelismConfig};
    pub use crate::controller::{Controller, EventHandler, RunHandler};
    pub use crate::core::{
        Phase, Pod, StageItem, StageStatus, Status, Workflow, WorkflowRun, WorkflowRunStatus,
    };
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::errors::{EngineError, PodBuildError, StoreError};
    pub use crate::events::{EventRecorder, EventType, LoggingEventRecorder};
    pub use crate::observability::init_logging;
    pub use crate::operator::{EngineContext, RunOperator};
    pub use crate::store::{InMemoryStore, PodBuilder, ResourceStore, RunEvent};
}

/// Version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
