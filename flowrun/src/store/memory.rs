//! In-memory resource store.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ResourceStore, RunEvent};
use crate::core::{ObjectMeta, Pod, Workflow, WorkflowRun};
use crate::errors::StoreError;

const WATCH_CAPACITY: usize = 1024;

/// A failure injected into pod creation.
#[derive(Debug, Clone)]
pub struct PodFault {
    /// Pods whose name contains this string are affected.
    pub name_contains: String,
    /// Error returned instead of creating the pod.
    pub error: StoreError,
    /// Remaining failures; `None` fails forever.
    pub remaining: Option<usize>,
}

impl PodFault {
    /// Fails creation of matching pods with `error` until cleared.
    #[must_use]
    pub fn always(name_contains: impl Into<String>, error: StoreError) -> Self {
        Self {
            name_contains: name_contains.into(),
            error,
            remaining: None,
        }
    }

    /// Fails creation of matching pods `times` times.
    #[must_use]
    pub fn times(name_contains: impl Into<String>, error: StoreError, times: usize) -> Self {
        Self {
            remaining: Some(times),
            ..Self::always(name_contains, error)
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    run_update_conflicts: usize,
    run_get_errors: Vec<StoreError>,
    pod_create: Vec<PodFault>,
    pod_delete: HashMap<String, StoreError>,
    lingering_pods: HashSet<String>,
}

/// A [`ResourceStore`] backed by hash maps.
///
/// Behaves like an API server for the engine's purposes: resource versions
/// are bumped on every write, stale updates are rejected, and run changes
/// are broadcast to watchers. Faults can be injected to exercise error paths.
#[derive(Debug)]
pub struct InMemoryStore {
    runs: RwLock<HashMap<String, WorkflowRun>>,
    workflows: RwLock<HashMap<String, Workflow>>,
    pods: RwLock<HashMap<String, Pod>>,
    faults: Mutex<Faults>,
    run_updates: AtomicUsize,
    pod_creates: AtomicUsize,
    events: broadcast::Sender<RunEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            runs: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            pods: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            run_updates: AtomicUsize::new(0),
            pod_creates: AtomicUsize::new(0),
            events,
        }
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful run updates so far.
    #[must_use]
    pub fn run_update_count(&self) -> usize {
        self.run_updates.load(Ordering::SeqCst)
    }

    /// Pod creation attempts so far, failed ones included.
    #[must_use]
    pub fn pod_create_attempts(&self) -> usize {
        self.pod_creates.load(Ordering::SeqCst)
    }

    /// Returns all stored pods.
    #[must_use]
    pub fn pods(&self) -> Vec<Pod> {
        self.pods.read().values().cloned().collect()
    }

    /// Makes the next `n` run updates fail with a conflict.
    pub fn inject_update_conflicts(&self, n: usize) {
        self.faults.lock().run_update_conflicts = n;
    }

    /// Makes the next run reads fail with the given errors, in order.
    pub fn inject_get_errors(&self, errors: Vec<StoreError>) {
        self.faults.lock().run_get_errors = errors;
    }

    /// Adds a pod creation fault.
    pub fn inject_pod_fault(&self, fault: PodFault) {
        self.faults.lock().pod_create.push(fault);
    }

    /// Makes deletion of the named pod fail.
    pub fn inject_pod_delete_error(&self, name: impl Into<String>, error: StoreError) {
        self.faults.lock().pod_delete.insert(name.into(), error);
    }

    /// Makes deletion of pod `name` succeed without removing it, like a pod
    /// stuck terminating.
    pub fn inject_lingering_pod(&self, name: impl Into<String>) {
        self.faults.lock().lingering_pods.insert(name.into());
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    fn stamp(meta: &mut ObjectMeta) {
        if meta.uid.is_empty() {
            meta.uid = Uuid::new_v4().to_string();
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Utc::now());
        }
        meta.resource_version = 1;
    }

    fn publish(&self, event: RunEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn pod_fault(&self, name: &str) -> Option<StoreError> {
        let mut faults = self.faults.lock();
        let pos = faults
            .pod_create
            .iter()
            .position(|f| name.contains(&f.name_contains))?;
        let fault = &mut faults.pod_create[pos];
        let error = fault.error.clone();
        let exhausted = match fault.remaining.as_mut() {
            Some(n) if *n <= 1 => true,
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        };
        if exhausted {
            faults.pod_create.remove(pos);
        }
        Some(error)
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_workflow_run(&self, namespace: &str, name: &str) -> Result<WorkflowRun, StoreError> {
        {
            let mut faults = self.faults.lock();
            if !faults.run_get_errors.is_empty() {
                return Err(faults.run_get_errors.remove(0));
            }
        }
        let key = key(namespace, name);
        self.runs
            .read()
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "WorkflowRun",
                key,
            })
    }

    async fn create_workflow_run(&self, mut run: WorkflowRun) -> Result<WorkflowRun, StoreError> {
        let key = run.metadata.key();
        {
            let mut runs = self.runs.write();
            if runs.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: "WorkflowRun",
                    key,
                });
            }
            Self::stamp(&mut run.metadata);
            runs.insert(key, run.clone());
        }
        self.publish(RunEvent::Created(run.clone()));
        Ok(run)
    }

    async fn update_workflow_run(&self, mut run: WorkflowRun) -> Result<WorkflowRun, StoreError> {
        let key = run.metadata.key();
        {
            let mut runs = self.runs.write();
            let stored = runs.get(&key).ok_or_else(|| StoreError::NotFound {
                kind: "WorkflowRun",
                key: key.clone(),
            })?;
            let stored_version = stored.metadata.resource_version;

            let injected = {
                let mut faults = self.faults.lock();
                if faults.run_update_conflicts > 0 {
                    faults.run_update_conflicts -= 1;
                    true
                } else {
                    false
                }
            };
            if injected || stored_version != run.metadata.resource_version {
                return Err(StoreError::Conflict {
                    kind: "WorkflowRun",
                    key,
                    stored: stored_version,
                    submitted: run.metadata.resource_version,
                });
            }

            run.metadata.resource_version = stored_version + 1;
            runs.insert(key, run.clone());
        }
        self.run_updates.fetch_add(1, Ordering::SeqCst);
        self.publish(RunEvent::Updated(run.clone()));
        Ok(run)
    }

    async fn delete_workflow_run(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = key(namespace, name);
        let removed = self.runs.write().remove(&key).ok_or(StoreError::NotFound {
            kind: "WorkflowRun",
            key,
        })?;
        self.publish(RunEvent::Deleted(removed));
        Ok(())
    }

    async fn list_workflow_runs(&self, namespace: Option<&str>) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .read()
            .values()
            .filter(|r| namespace.map_or(true, |ns| r.namespace() == ns))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.metadata.key().cmp(&b.metadata.key()));
        Ok(runs)
    }

    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Workflow, StoreError> {
        let key = key(namespace, name);
        self.workflows
            .read()
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "Workflow", key })
    }

    async fn create_workflow(&self, mut workflow: Workflow) -> Result<Workflow, StoreError> {
        let key = workflow.metadata.key();
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: "Workflow", key });
        }
        Self::stamp(&mut workflow.metadata);
        workflows.insert(key, workflow.clone());
        Ok(workflow)
    }

    async fn create_pod(&self, mut pod: Pod) -> Result<Pod, StoreError> {
        self.pod_creates.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.pod_fault(&pod.metadata.name) {
            return Err(error);
        }
        let key = pod.metadata.key();
        let mut pods = self.pods.write();
        if pods.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: "Pod", key });
        }
        Self::stamp(&mut pod.metadata);
        pods.insert(key, pod.clone());
        Ok(pod)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError> {
        let key = key(namespace, name);
        self.pods
            .read()
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "Pod", key })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = key(namespace, name);
        {
            let faults = self.faults.lock();
            if let Some(error) = faults.pod_delete.get(name).cloned() {
                return Err(error);
            }
            if faults.lingering_pods.contains(name) && self.pods.read().contains_key(&key) {
                return Ok(());
            }
        }
        self.pods
            .write()
            .remove(&key)
            .map(|_| ())
            .ok_or(StoreError::NotFound { kind: "Pod", key })
    }

    fn watch(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }
}
