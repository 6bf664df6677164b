//! Background workers acting on runs after the fact.
//!
//! - [`GcProcessor`] collects finished runs once their grace period passed.
//! - [`TimeoutProcessor`] fails runs that exceeded their timeout.
//! - [`RunHistoryLimiter`] deletes the oldest runs of a workflow beyond the
//!   configured history size.

mod gc;
mod limits;
mod timeout;

pub use gc::GcProcessor;
pub use limits::RunHistoryLimiter;
pub use timeout::TimeoutProcessor;

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::core::WorkflowRun;

/// Default interval between two passes over tracked runs.
pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// A run tracked by a tick-driven worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRunItem {
    /// Run name.
    pub name: String,
    /// Run namespace.
    pub namespace: String,
    /// When the worker should act on the run.
    pub expire_time: DateTime<Utc>,
    /// Attempts left after the next one.
    pub retry: u32,
}

impl WorkflowRunItem {
    /// Creates an item for `run` expiring at `expire_time`.
    #[must_use]
    pub fn new(run: &WorkflowRun, expire_time: DateTime<Utc>, retry: u32) -> Self {
        Self {
            name: run.name().to_string(),
            namespace: run.namespace().to_string(),
            expire_time,
            retry,
        }
    }

    /// Key under which the item is tracked.
    #[must_use]
    pub fn key(&self) -> String {
        item_key(&self.namespace, &self.name)
    }

    /// Returns true once `now` passed the expiry time.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time < now
    }
}

impl fmt::Display for WorkflowRunItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

pub(crate) fn item_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:{name}")
}

/// Adds a std duration to a timestamp, saturating at the far future.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
