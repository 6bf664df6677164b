//! Controller configuration.
//!
//! The configuration is a JSON document that may carry `#` line comments.
//! Every section has defaults, so an empty object is a valid (if not very
//! useful) configuration:
//!
//! ```json
//! {
//!     # image running the data cleanup pod
//!     "images": { "gc": "alpine:3.19" },
//!     "logging": { "level": "info" },
//!     "gc": { "enabled": true, "delay_seconds": 300, "retry": 1 },
//!     "limits": { "max_workflow_runs": 50 },
//!     "parallelism": { "overall": { "max_parallel": 10, "max_queue_size": 20 } }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::scheduler::StageRetryPolicy;

/// Key of the cleanup image in [`ControllerConfig::images`].
pub const GC_IMAGE: &str = "gc";

/// Top-level controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Images used by the controller itself, keyed by purpose.
    pub images: HashMap<String, String>,
    /// Logging setup.
    pub logging: LoggingConfig,
    /// Garbage collection of finished runs.
    pub gc: GcConfig,
    /// Retention limits.
    pub limits: LimitsConfig,
    /// Admission limits; absent means unlimited.
    pub parallelism: Option<ParallelismConfig>,
    /// Stage retry policy.
    pub stage_retry: StageRetryConfig,
    /// Default claim used to pass artifacts between stages.
    pub pvc: String,
    /// Work queue and resync settings.
    pub controller: LoopConfig,
    /// Blocking-stage queue settings.
    pub blocking: BlockingConfig,
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Whether finished runs are collected at all.
    pub enabled: bool,
    /// Seconds to wait after a run finished before collecting it.
    pub delay_seconds: u64,
    /// Extra attempts after a failed collection.
    pub retry: u32,
    /// Mount path of the run data volume inside the cleanup pod.
    pub data_root: String,
    /// How long to wait for deleted stage pods to disappear.
    pub pod_deletion_timeout_seconds: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_seconds: 300,
            retry: 1,
            data_root: "/workflowruns".to_string(),
            pod_deletion_timeout_seconds: 300,
        }
    }
}

impl GcConfig {
    /// Delay before a finished run is collected.
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds)
    }
}

/// Retention limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Runs kept per workflow; 0 keeps all of them.
    #[serde(alias = "max_workflowruns")]
    pub max_workflow_runs: usize,
}

/// One admission constraint. Values `<= 0` disable the respective limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelismConstraint {
    /// Runs allowed to execute at once.
    pub max_parallel: i64,
    /// Runs allowed to wait once `max_parallel` is reached.
    pub max_queue_size: i64,
}

impl ParallelismConstraint {
    /// Creates a constraint.
    #[must_use]
    pub fn new(max_parallel: i64, max_queue_size: i64) -> Self {
        Self {
            max_parallel,
            max_queue_size,
        }
    }
}

/// Admission limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelismConfig {
    /// Limit over all workflows.
    pub overall: ParallelismConstraint,
    /// Limit per workflow.
    pub single_workflow: ParallelismConstraint,
}

/// Stage retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetryConfig {
    /// Retries allowed per stage.
    pub limit: u32,
    /// Seconds between a stage being reset and re-run.
    pub interval_seconds: u64,
}

impl Default for StageRetryConfig {
    fn default() -> Self {
        Self {
            limit: 3,
            interval_seconds: 30,
        }
    }
}

impl From<StageRetryConfig> for StageRetryPolicy {
    fn from(config: StageRetryConfig) -> Self {
        Self::new(config.limit, config.interval_seconds)
    }
}

/// Controller loop configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Seconds between full resyncs of all runs; 0 disables resync.
    pub resync_seconds: u64,
    /// Attempts per work item before it is dropped.
    pub max_retries: usize,
    /// Attempts of the optimistic status update.
    pub update_attempts: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            resync_seconds: 300,
            max_retries: 5,
            update_attempts: 5,
        }
    }
}

/// Blocking-stage queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockingConfig {
    /// Pause after a stage was refused on quota again.
    pub quota_backoff_ms: u64,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            quota_backoff_ms: 1000,
        }
    }
}

impl BlockingConfig {
    /// Pause after a quota refusal.
    #[must_use]
    pub fn quota_backoff(&self) -> Duration {
        Duration::from_millis(self.quota_backoff_ms)
    }
}

impl ControllerConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON text with `#` comments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(&trim_comments(text))?)
    }

    /// Checks settings that other components rely on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when garbage collection is enabled
    /// without a cleanup image.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gc.enabled && self.gc_image().is_none() {
            return Err(ConfigError::Invalid(format!(
                "gc is enabled but images.{GC_IMAGE} is not set"
            )));
        }
        if self.controller.update_attempts == 0 {
            return Err(ConfigError::Invalid(
                "controller.update_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Image of the cleanup pod, if configured.
    #[must_use]
    pub fn gc_image(&self) -> Option<&str> {
        self.images
            .get(GC_IMAGE)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Sets an image.
    #[must_use]
    pub fn with_image(mut self, key: impl Into<String>, image: impl Into<String>) -> Self {
        self.images.insert(key.into(), image.into());
        self
    }

    /// Sets the garbage collection section.
    #[must_use]
    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    /// Sets the admission limits.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: ParallelismConfig) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Sets the stage retry policy.
    #[must_use]
    pub fn with_stage_retry(mut self, limit: u32, interval_seconds: u64) -> Self {
        self.stage_retry = StageRetryConfig {
            limit,
            interval_seconds,
        };
        self
    }

    /// Sets the per-workflow run limit.
    #[must_use]
    pub fn with_max_workflow_runs(mut self, max: usize) -> Self {
        self.limits.max_workflow_runs = max;
        self
    }

    /// Sets the pause after a quota refusal.
    #[must_use]
    pub fn with_quota_backoff_ms(mut self, ms: u64) -> Self {
        self.blocking.quota_backoff_ms = ms;
        self
    }
}

/// Reads, parses and validates a configuration file.
///
/// # Errors
///
/// Returns a [`ConfigError`] when the file cannot be read, parsed or
/// validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<ControllerConfig, ConfigError> {
    let path = path.as_ref();
    tracing::info!(file = %path.display(), "Loading controller configuration");
    let text = std::fs::read_to_string(path)?;
    let config = ControllerConfig::from_json_str(&text)?;
    config.validate()?;
    Ok(config)
}

/// Strips `#` comments outside string literals from every line.
fn trim_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let mut in_string = false;
        let mut escaped = false;
        let mut cut = None;
        for (i, c) in line.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '"' => in_string = !in_string,
                '#' if !in_string => {
                    cut = Some(i);
                    break;
                }
                _ => {}
            }
        }
        match cut {
            Some(i) => {
                out.push_str(&line[..i]);
                if line.ends_with('\n') {
                    out.push('\n');
                }
            }
            None => out.push_str(line),
        }
    }
    out
}
