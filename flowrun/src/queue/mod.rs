//! Stages waiting for namespace quota.
//!
//! A stage whose pod is refused because the namespace quota is exhausted is
//! not failed. It is parked in a priority queue ordered by the time it was
//! blocked and relaunched in the background until it gets through or its
//! run's timeout passes.

mod heap;
mod priority;
mod processor;
mod stage;

pub use heap::{HeapItem, KeyedHeap};
pub use priority::PriorityQueue;
pub use processor::{BlockingStageProcessor, ProcessOutcome};
pub use stage::{BlockingStage, DEFAULT_TIMEOUT_SECS, MAX_RETRY, TIME_STEP_SECS};
