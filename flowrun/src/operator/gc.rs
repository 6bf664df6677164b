//! Garbage collection of a finished run: stage pods and data on the volume.

use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::RunOperator;
use crate::core::{Container, ObjectMeta, Phase, Pod, PodInfo, PodSpec, Status, Volume};
use crate::errors::{EngineError, PodBuildError, Result, StoreError};
use crate::events::{reasons, EventType};
use crate::store::ResourceStore;

/// Label carrying the run a pod belongs to.
pub const LABEL_WORKFLOW_RUN: &str = "flowrun.dev/workflowrun";
/// Label carrying the role of a pod.
pub const LABEL_POD_KIND: &str = "flowrun.dev/pod-kind";

const GC_CONTAINER: &str = "gc";
const GC_VOLUME: &str = "default-pv";
const GC_POD_PREFIX: &str = "wfrgc--";
const MAX_NAME_LEN: usize = 63;
const POD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Name of the cleanup pod of `run`.
///
/// Names that would exceed the object name limit are shortened and suffixed
/// with a hash of the full name so that they stay unique.
#[must_use]
pub fn gc_pod_name(run: &str) -> String {
    let name = format!("{GC_POD_PREFIX}{run}");
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let mut cut = MAX_NAME_LEN - 9;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}-{}", &name[..cut], &digest[..8])
}

impl RunOperator {
    /// Cleans up after the run.
    ///
    /// Non-terminal stages are cancelled and every recorded stage pod is
    /// deleted. Once the pods are gone, a cleanup pod removes the run's data
    /// from the volume. On the last try the run is marked cleaned even if
    /// parts of this failed. With `run_deleted` no events are emitted and
    /// the run is not written back.
    ///
    /// # Errors
    ///
    /// Returns the cleanup pod creation error, unless `last_try` is set.
    pub async fn gc(&mut self, last_try: bool, run_deleted: bool) -> Result<()> {
        let mut pods = Vec::new();
        let stage_names: Vec<String> = self.run.status.stages.keys().cloned().collect();
        for stage in stage_names {
            let Some(status) = self.run.status.stages.get(&stage) else {
                continue;
            };
            let phase = status.status.phase;
            let pod = status.pod.clone();

            if matches!(phase, Phase::Pending | Phase::Running | Phase::Waiting) {
                self.update_stage_status(&stage, Status::new(Phase::Cancelled).with_reason(reasons::GC));
            }
            match pod {
                Some(pod) => pods.push((stage, pod)),
                None => warn!(wfr = %self.run.name(), stg = %stage, "Pod information is missing, can't clean the pod"),
            }
        }

        let store = self.ctx.store.clone();
        let deletions = pods.iter().map(|(_, pod)| store.delete_pod(&pod.namespace, &pod.name));
        let results = join_all(deletions).await;

        let mut deleted = Vec::new();
        for ((stage, pod), result) in pods.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(ns = %pod.namespace, pod = %pod.name, "Start to delete pod");
                    deleted.push(pod);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(wfr = %self.run.name(), stg = %stage, pod = %pod.name, error = %e, "Delete pod error");
                    if !run_deleted {
                        self.record(
                            EventType::Warning,
                            reasons::GC,
                            &format!("Delete pod '{}' error: {e}", pod.name),
                        );
                    }
                }
            }
        }

        // The volume data may only go once no stage pod still uses it.
        let timeout = Duration::from_secs(self.ctx.config.gc.pod_deletion_timeout_seconds);
        let waits = deleted
            .iter()
            .map(|pod| wait_pod_gone(store.as_ref(), pod, timeout));
        let all_finished = join_all(waits).await.into_iter().all(|gone| gone);

        if !all_finished && !last_try {
            if !run_deleted {
                self.record(EventType::Warning, reasons::GC, "There are stage pods not Finished");
            }
            return Ok(());
        }

        let pvc = self.pvc().to_string();
        if !pvc.is_empty() {
            if let Err(e) = self.create_gc_pod(&pvc).await {
                warn!(wfr = %self.run.name(), error = %e, "Create GC pod error");
                if !last_try {
                    return Err(e);
                }
                if !run_deleted {
                    self.record(
                        EventType::Warning,
                        reasons::GC,
                        &format!("Create GC pod error: {e}"),
                    );
                }
            }
        }

        self.run.status.cleaned = true;
        if !run_deleted {
            self.record(EventType::Normal, reasons::GC, "GC is performed succeed.");
            if let Err(e) = self.update().await {
                error!(wfr = %self.run.name(), error = %e, "Update status after GC error");
            }
        }
        Ok(())
    }

    /// PVC holding the run's data: the run's own, else the controller's.
    fn pvc(&self) -> &str {
        let own = self.run.spec.execution_context.pvc.as_str();
        if own.is_empty() {
            self.ctx.config.pvc.as_str()
        } else {
            own
        }
    }

    async fn create_gc_pod(&self, pvc: &str) -> Result<()> {
        let image = self
            .ctx
            .config
            .gc_image()
            .ok_or_else(|| PodBuildError::new(GC_CONTAINER, "no cleanup image configured"))?;
        let data_root = self.ctx.config.gc.data_root.trim_end_matches('/');
        let run = self.run.name();

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_WORKFLOW_RUN.to_string(), run.to_string());
        labels.insert(LABEL_POD_KIND.to_string(), "gc".to_string());

        let pod = Pod {
            metadata: ObjectMeta {
                labels,
                ..ObjectMeta::new(self.run.execution_namespace(), gc_pod_name(run))
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: GC_CONTAINER.to_string(),
                    image: image.to_string(),
                    command: vec!["rm".to_string(), "-rf".to_string(), format!("{data_root}/{run}")],
                    volume_mounts: vec![(GC_VOLUME.to_string(), data_root.to_string())],
                }],
                volumes: vec![Volume {
                    name: GC_VOLUME.to_string(),
                    claim_name: pvc.to_string(),
                }],
                restart_policy: "Never".to_string(),
            },
        };

        match self.ctx.store.create_pod(pod).await {
            Ok(created) => {
                debug!(wfr = %run, pod = %created.metadata.name, "GC pod created");
                Ok(())
            }
            Err(StoreError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(EngineError::Store(e)),
        }
    }
}

/// Polls until `pod` is gone or `timeout` elapses. Returns false on timeout.
async fn wait_pod_gone(store: &dyn ResourceStore, pod: &PodInfo, timeout: Duration) -> bool {
    let started = Instant::now();
    loop {
        if let Err(e) = store.get_pod(&pod.namespace, &pod.name).await {
            if e.is_not_found() {
                info!(ns = %pod.namespace, pod = %pod.name, "Pod deleted");
                return true;
            }
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            warn!(ns = %pod.namespace, pod = %pod.name, "Pod deletion timeout");
            return false;
        }
        tokio::time::sleep(POD_POLL_INTERVAL.min(timeout - elapsed)).await;
    }
}
