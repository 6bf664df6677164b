//! User-facing events recorded on workflow runs.
//!
//! The engine reports notable transitions (pods created, stages queued,
//! garbage collection, timeouts) through an [`EventRecorder`]. The recorder
//! is injected; nothing here is global.

mod recorder;

pub use recorder::{
    CollectingEventRecorder, EventRecorder, EventType, LoggingEventRecorder, NoOpEventRecorder,
    RecordedEvent,
};

/// Event reasons emitted by the engine.
pub mod reasons {
    /// A stage was marked running and its pod is about to be created.
    pub const STAGE_INITIALIZED: &str = "StageInitialized";
    /// A stage pod was created. Also used for non-quota pod creation failures.
    pub const STAGE_POD_CREATED: &str = "StagePodCreated";
    /// A stage waits for quota in the blocking-stage queue.
    pub const STAGE_QUEUED: &str = "StageQueued";
    /// The pod builder failed; recorded on the stage status.
    pub const GENERATE_POD_ERROR: &str = "GeneratePodError";
    /// The pod builder failed; recorded as a warning event.
    pub const GENERATE_POD_SPEC_ERROR: &str = "GeneratePodSpecError";
    /// Pod creation failed for a reason other than quota.
    pub const CREATE_POD_ERROR: &str = "CreatePodError";
    /// A stage used up its retries.
    pub const RETRY_LIMIT_EXCEEDED: &str = "RetryLimitExceeded";
    /// A stage is scheduled to run again.
    pub const STAGE_RETRY: &str = "StageRetry";
    /// Garbage collection.
    pub const GC: &str = "GC";
    /// The run exceeded its timeout.
    pub const TIMEOUT: &str = "Timeout";
    /// The run waits for an admission slot.
    pub const PARALLELISM_QUEUED: &str = "ParallelismQueued";
    /// The run was rejected because the admission queue is full.
    pub const PARALLELISM_EXCEEDED: &str = "ParallelismExceeded";
    /// The run's workflow is malformed.
    pub const INVALID_WORKFLOW: &str = "InvalidWorkflow";
}
