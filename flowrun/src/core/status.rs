//! Status values of a workflow run and its stages.
//!
//! Besides the value types, this module holds the two pure functions the
//! update protocol is built on: [`resolve_status`], which decides which of two
//! competing statuses wins, and [`static_status`], which strips timestamps so
//! that two statuses can be compared for real changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::StageEvent;

/// Phase of a stage or of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Not started yet.
    Pending,
    /// Executing.
    Running,
    /// Waiting for an external event.
    Waiting,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Stopped before finishing.
    Cancelled,
    /// A phase this version does not know about. Treated as failed.
    #[serde(other)]
    Unknown,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Waiting => write!(f, "Waiting"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl Phase {
    /// Returns true if the phase can never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the phase counts as a failure (unknown phases included).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Unknown)
    }
}

/// Retry bookkeeping of a stage that is waiting to be run again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatus {
    /// Retries already performed.
    pub times: u32,
    /// When the stage was put back to pending.
    pub start_time: DateTime<Utc>,
}

/// Status of a stage or a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Current phase.
    pub phase: Phase,
    /// Machine-readable reason of the last transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// When the phase last changed.
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// When execution started.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Retry state, present only for stages scheduled to run again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_status: Option<RetryStatus>,
}

impl Status {
    /// Creates a status in the given phase, stamped now.
    #[must_use]
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            last_transition_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Sets the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Sets the start time.
    #[must_use]
    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Sets the transition time.
    #[must_use]
    pub fn with_transition_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_transition_time = Some(at);
        self
    }
}

/// Where the pod of a stage lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
}

impl PodInfo {
    /// Creates pod info.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// A key-value output produced by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Output key.
    pub key: String,
    /// Output value.
    pub value: String,
}

impl KeyValue {
    /// Creates an output pair.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Status of one stage inside a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    /// Execution status.
    pub status: Status,
    /// Pod running the stage, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodInfo>,
    /// Outputs reported by the stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<KeyValue>,
    /// Events reported by the stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<StageEvent>,
    /// Dependencies recorded when the stage was initialised.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    /// Whether a failure of this stage is ignored.
    #[serde(default)]
    pub trivial: bool,
}

impl StageStatus {
    /// Creates a stage status holding only the given status.
    #[must_use]
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// Status of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStatus {
    /// Per-stage status, keyed by stage name.
    #[serde(default)]
    pub stages: HashMap<String, StageStatus>,
    /// Overall status of the run.
    #[serde(default)]
    pub overall: Status,
    /// Whether garbage collection has been performed.
    #[serde(default)]
    pub cleaned: bool,
}

/// Decides the final status from the latest persisted one and a reported update.
///
/// Terminal statuses are sticky: once `latest` is terminal it is returned
/// unchanged. Otherwise a terminal `update` wins, and between two
/// non-terminal statuses the one with the later transition time wins.
#[must_use]
pub fn resolve_status<'a>(latest: &'a Status, update: &'a Status) -> &'a Status {
    if latest.phase.is_terminal() {
        return latest;
    }

    if update.phase.is_terminal() {
        return update;
    }

    if update.last_transition_time > latest.last_transition_time {
        update
    } else {
        latest
    }
}

/// Returns a copy of `status` with every transition time cleared.
///
/// Only meant as a comparison key: two statuses that differ only in
/// timestamps are the same change.
#[must_use]
pub fn static_status(status: &WorkflowRunStatus) -> WorkflowRunStatus {
    let mut copy = status.clone();
    copy.overall.last_transition_time = None;
    for stage in copy.stages.values_mut() {
        stage.status.last_transition_time = None;
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    const ALL: [Phase; 7] = [
        Phase::Pending,
        Phase::Running,
        Phase::Waiting,
        Phase::Succeeded,
        Phase::Failed,
        Phase::Cancelled,
        Phase::Unknown,
    ];

    fn at(phase: Phase, offset_secs: i64) -> Status {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        Status::new(phase).with_transition_time(base + Duration::seconds(offset_secs))
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        for latest in [Phase::Succeeded, Phase::Failed] {
            for update in ALL {
                let l = at(latest, 0);
                let u = at(update, 100);
                assert_eq!(resolve_status(&l, &u).phase, latest);
            }
        }
    }

    #[test]
    fn test_terminal_update_wins_over_running() {
        let latest = at(Phase::Running, 100);
        let update = at(Phase::Failed, 0);
        assert_eq!(resolve_status(&latest, &update).phase, Phase::Failed);
    }

    #[test]
    fn test_later_transition_wins() {
        let latest = at(Phase::Pending, 0);
        let update = at(Phase::Running, 5);
        assert_eq!(resolve_status(&latest, &update).phase, Phase::Running);

        let stale = at(Phase::Waiting, -5);
        assert_eq!(resolve_status(&latest, &stale).phase, Phase::Pending);
    }

    #[test]
    fn test_static_status_ignores_timestamps() {
        let mut a = WorkflowRunStatus::default();
        a.overall = at(Phase::Running, 1);
        a.stages
            .insert("build".to_string(), StageStatus::with_status(at(Phase::Running, 2)));

        let mut b = a.clone();
        b.overall.last_transition_time = None;
        b.stages.get_mut("build").unwrap().status = at(Phase::Running, 99);

        assert_eq!(static_status(&a), static_status(&b));

        b.stages.get_mut("build").unwrap().status.phase = Phase::Succeeded;
        assert_ne!(static_status(&a), static_status(&b));
    }

    #[test]
    fn test_unknown_phase_deserializes() {
        let phase: Phase = serde_json::from_str(r#""Exploded""#).unwrap();
        assert_eq!(phase, Phase::Unknown);
        assert!(phase.is_failure());
        assert!(!phase.is_terminal());
    }

    #[test]
    fn test_status_serialize_camel_case() {
        let status = Status::new(Phase::Running).with_reason("StageInitialized");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Running");
        assert_eq!(json["reason"], "StageInitialized");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
