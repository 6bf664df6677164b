//! Error types for the flowrun engine.
//!
//! Errors are split by the collaborator that produced them: the resource
//! store, the pod builder, the blocking-stage queue, timeout parsing and
//! configuration. [`EngineError`] wraps all of them for operations that cross
//! component boundaries.

use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The resource store rejected or failed a request.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The pod builder could not produce a pod for a stage.
    #[error("{0}")]
    PodBuild(#[from] PodBuildError),

    /// The workflow definition is malformed.
    #[error("{0}")]
    InvalidWorkflow(#[from] InvalidWorkflowError),

    /// A timeout string could not be parsed.
    #[error("{0}")]
    Timeout(#[from] TimeParseError),

    /// The blocking-stage queue refused an operation.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// The controller configuration is unusable.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The workflow run has no workflow reference.
    #[error("WorkflowRun '{0}' has no workflow reference")]
    MissingWorkflowRef(String),

    /// An optimistic update kept conflicting until the retry budget ran out.
    #[error("update of WorkflowRun '{name}' still conflicting after {attempts} attempts")]
    RetryExhausted {
        /// Name of the run being updated.
        name: String,
        /// Attempts made.
        attempts: usize,
    },
}

impl EngineError {
    /// Returns true if the underlying cause is a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }
}

/// Errors returned by a [`ResourceStore`](crate::store::ResourceStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} '{key}' not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// `namespace/name` key.
        key: String,
    },

    /// The stored resource version advanced since the object was read.
    #[error("conflict updating {kind} '{key}': stored version {stored}, submitted {submitted}")]
    Conflict {
        /// Resource kind.
        kind: &'static str,
        /// `namespace/name` key.
        key: String,
        /// Version held by the store.
        stored: u64,
        /// Version carried by the rejected write.
        submitted: u64,
    },

    /// An object with the same key already exists.
    #[error("{kind} '{key}' already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// `namespace/name` key.
        key: String,
    },

    /// Pod creation was refused because the namespace quota is exhausted.
    #[error("exceeded quota: {0}")]
    QuotaExceeded(String),

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns true for a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for an optimistic-concurrency conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true when the object to create is already there.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true when the request failed on resource quota.
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }
}

/// Error raised by a [`PodBuilder`](crate::store::PodBuilder).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("build pod for stage '{stage}': {message}")]
pub struct PodBuildError {
    /// The stage whose pod could not be built.
    pub stage: String,
    /// What went wrong.
    pub message: String,
}

impl PodBuildError {
    /// Creates a new pod build error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Error raised when a workflow DAG is malformed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid workflow '{workflow}': {message}")]
pub struct InvalidWorkflowError {
    /// Workflow name.
    pub workflow: String,
    /// What is wrong with it.
    pub message: String,
    /// Stages involved in the problem.
    pub stages: Vec<String>,
}

impl InvalidWorkflowError {
    /// Creates a new error.
    #[must_use]
    pub fn new(workflow: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Errors from the blocking-stage priority queue.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been closed.
    #[error("blocking stage queue closed")]
    Closed,

    /// No item exists for the key.
    #[error("stage not found")]
    NotFound,
}

/// Error raised when a timeout string is malformed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid timeout '{input}'")]
pub struct TimeParseError {
    /// The rejected input.
    pub input: String,
}

/// Errors raised while loading controller configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The content is not valid JSON for the config schema.
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A required setting is missing or invalid.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result alias for engine operations.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
