//! Resource objects the engine reads and writes through the store.
//!
//! These mirror the custom resources of the orchestrator closely enough for
//! the engine's needs: a [`Workflow`] is the immutable DAG definition, a
//! [`WorkflowRun`] one execution of it, and a [`Pod`] the unit a stage runs in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::WorkflowRunStatus;

/// Metadata shared by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    pub name: String,
    /// Object namespace.
    pub namespace: String,
    /// Store-assigned unique id.
    #[serde(default)]
    pub uid: String,
    /// Version used for optimistic concurrency; bumped on every write.
    #[serde(default)]
    pub resource_version: u64,
    /// When the object was created.
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Object labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Creates metadata with a name and namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Returns the `namespace/name` key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// An artifact a stage produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactItem {
    /// Artifact name.
    pub name: String,
    /// Path or reference the artifact is collected from.
    pub source: String,
}

/// One stage of a workflow DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageItem {
    /// Stage name, unique in the workflow.
    pub name: String,
    /// Names of stages that must succeed first.
    #[serde(default)]
    pub depends: Vec<String>,
    /// A trivial stage's failure neither fails the run nor blocks dependents.
    #[serde(default)]
    pub trivial: bool,
    /// Artifacts produced by the stage.
    #[serde(default)]
    pub artifacts: Vec<ArtifactItem>,
}

impl StageItem {
    /// Creates a stage with no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends.push(stage.into());
        self
    }

    /// Marks the stage trivial.
    #[must_use]
    pub fn trivial(mut self) -> Self {
        self.trivial = true;
        self
    }

    /// Adds an artifact.
    #[must_use]
    pub fn with_artifact(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.artifacts.push(ArtifactItem {
            name: name.into(),
            source: source.into(),
        });
        self
    }
}

/// Immutable DAG definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Stages in declaration order.
    pub stages: Vec<StageItem>,
}

impl Workflow {
    /// Creates an empty workflow.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            stages: Vec::new(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageItem) -> Self {
        self.stages.push(stage);
        self
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageItem> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns whether the named stage is trivial. Unknown stages are not.
    #[must_use]
    pub fn is_trivial(&self, name: &str) -> bool {
        self.stage(name).is_some_and(|s| s.trivial)
    }
}

/// Reference from a run to its workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    /// Workflow name.
    pub name: String,
    /// Workflow namespace; empty means the run's namespace.
    #[serde(default)]
    pub namespace: String,
}

/// Where a run's pods execute and which volume holds its data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Namespace pods are created in; empty means the run's namespace.
    #[serde(default)]
    pub namespace: String,
    /// Claim holding the run's working directory; empty disables data cleanup.
    #[serde(default)]
    pub pvc: String,
}

/// A volume mounted into every stage pod of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetVolume {
    /// Volume name.
    pub name: String,
    /// Where the volume is mounted.
    pub mount_path: String,
}

/// Desired state of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunSpec {
    /// Workflow being executed.
    pub workflow_ref: Option<WorkflowRef>,
    /// Run-level timeout, e.g. `"1h30m"`.
    #[serde(default)]
    pub timeout: String,
    /// Execution placement.
    #[serde(default)]
    pub execution_context: ExecutionContext,
    /// Volumes mounted into every stage pod.
    #[serde(default)]
    pub preset_volumes: Vec<PresetVolume>,
}

/// One execution of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: WorkflowRunSpec,
    /// Observed state.
    #[serde(default)]
    pub status: WorkflowRunStatus,
}

impl WorkflowRun {
    /// Creates a run of `workflow` in `namespace`.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: WorkflowRunSpec {
                workflow_ref: Some(WorkflowRef {
                    name: workflow.into(),
                    namespace: String::new(),
                }),
                ..WorkflowRunSpec::default()
            },
            status: WorkflowRunStatus::default(),
        }
    }

    /// Sets the timeout string.
    #[must_use]
    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.spec.timeout = timeout.into();
        self
    }

    /// Sets the PVC of the execution context.
    #[must_use]
    pub fn with_pvc(mut self, pvc: impl Into<String>) -> Self {
        self.spec.execution_context.pvc = pvc.into();
        self
    }

    /// Run name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Run namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Workflow name, empty if the reference is missing.
    #[must_use]
    pub fn workflow_name(&self) -> &str {
        self.spec.workflow_ref.as_ref().map_or("", |r| r.name.as_str())
    }

    /// Namespace the referenced workflow lives in.
    #[must_use]
    pub fn workflow_namespace(&self) -> &str {
        match &self.spec.workflow_ref {
            Some(r) if !r.namespace.is_empty() => &r.namespace,
            _ => &self.metadata.namespace,
        }
    }

    /// Namespace stage pods are created in.
    #[must_use]
    pub fn execution_namespace(&self) -> &str {
        if self.spec.execution_context.namespace.is_empty() {
            &self.metadata.namespace
        } else {
            &self.spec.execution_context.namespace
        }
    }

    /// Returns true once the overall phase is terminal.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.status.overall.phase.is_terminal()
    }

    /// Reference used when recording events on this run.
    #[must_use]
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference::new("WorkflowRun", &self.metadata.namespace, &self.metadata.name)
    }
}

/// A container in a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Entrypoint override.
    #[serde(default)]
    pub command: Vec<String>,
    /// Volume mounts as `(volume, path)`.
    #[serde(default)]
    pub volume_mounts: Vec<(String, String)>,
}

/// A volume backed by a persistent volume claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name.
    pub name: String,
    /// Claim backing the volume.
    pub claim_name: String,
}

/// Pod specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Containers to run.
    pub containers: Vec<Container>,
    /// Volumes available to containers.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Restart policy, e.g. `"Never"`.
    #[serde(default)]
    pub restart_policy: String,
}

/// A pod as created in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Pod specification.
    pub spec: PodSpec,
}

/// Identifies the object an event is recorded on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectReference {
    /// Resource kind.
    pub kind: String,
    /// Object namespace.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectReference {
    /// Creates a reference.
    #[must_use]
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}
