//! Bounded run history per workflow.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::add_duration;
use crate::core::WorkflowRun;
use crate::store::ResourceStore;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    namespace: String,
    created: DateTime<Utc>,
    refreshed: DateTime<Utc>,
}

/// Keeps at most `max` runs per workflow, deleting the oldest ones.
///
/// Runs are kept sorted by creation time. Each sighting refreshes an entry;
/// entries not refreshed for a while belong to runs deleted behind the
/// controller's back and are pruned.
pub struct RunHistoryLimiter {
    store: Arc<dyn ResourceStore>,
    max: usize,
    lists: Mutex<HashMap<String, Vec<Entry>>>,
}

impl std::fmt::Debug for RunHistoryLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHistoryLimiter")
            .field("max", &self.max)
            .field("workflows", &self.lists.lock().len())
            .finish_non_exhaustive()
    }
}

impl RunHistoryLimiter {
    /// Creates a limiter. A `max` of zero keeps every run.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, max: usize) -> Self {
        info!(max, "Create run history limiter");
        Self {
            store,
            max,
            lists: Mutex::new(HashMap::new()),
        }
    }

    /// Records `run`, deleting the oldest run of its workflow when the
    /// history grows beyond the limit.
    ///
    /// Returns the names of the deleted runs.
    pub async fn add_or_refresh(&self, run: &WorkflowRun) -> Vec<String> {
        if self.max == 0 {
            return Vec::new();
        }
        let now = Utc::now();
        let evicted = {
            let mut lists = self.lists.lock();
            let list = lists.entry(workflow_key(run)).or_default();
            let created = run.metadata.creation_timestamp.unwrap_or(now);

            if let Some(entry) = list
                .iter_mut()
                .find(|e| e.name == run.name() && e.namespace == run.namespace())
            {
                entry.refreshed = now;
            } else {
                let pos = list.partition_point(|e| e.created <= created);
                list.insert(
                    pos,
                    Entry {
                        name: run.name().to_string(),
                        namespace: run.namespace().to_string(),
                        created,
                        refreshed: now,
                    },
                );
            }

            let overflow = list.len().saturating_sub(self.max);
            list.drain(..overflow).collect::<Vec<_>>()
        };

        let mut deleted = Vec::with_capacity(evicted.len());
        for old in evicted {
            info!(wfr = %old.name, ns = %old.namespace, "Delete old WorkflowRun beyond history limit");
            match self.store.delete_workflow_run(&old.namespace, &old.name).await {
                Ok(()) => deleted.push(old.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => error!(wfr = %old.name, error = %e, "Delete old WorkflowRun error"),
            }
        }
        deleted
    }

    /// Refreshes `run` if it is tracked.
    pub fn refresh(&self, run: &WorkflowRun) {
        let mut lists = self.lists.lock();
        if let Some(entry) = lists.get_mut(&workflow_key(run)).and_then(|list| {
            list.iter_mut()
                .find(|e| e.name == run.name() && e.namespace == run.namespace())
        }) {
            entry.refreshed = Utc::now();
        }
    }

    /// Drops entries not refreshed within `max_age` of `now`.
    ///
    /// Returns the number of dropped entries.
    pub fn prune_stale(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let mut lists = self.lists.lock();
        let mut pruned = 0;
        for list in lists.values_mut() {
            let before = list.len();
            list.retain(|e| add_duration(e.refreshed, max_age) >= now);
            pruned += before - list.len();
        }
        lists.retain(|_, list| !list.is_empty());
        if pruned > 0 {
            info!(pruned, "Pruned stale run history entries");
        }
        pruned
    }

    /// Tracked runs of `namespace/workflow`, oldest first.
    #[must_use]
    pub fn runs(&self, namespace: &str, workflow: &str) -> Vec<String> {
        self.lists
            .lock()
            .get(&format!("{namespace}/{workflow}"))
            .map(|list| list.iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default()
    }
}

fn workflow_key(run: &WorkflowRun) -> String {
    format!("{}/{}", run.workflow_namespace(), run.workflow_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;

    fn run_created_at(name: &str, minutes_ago: i64) -> WorkflowRun {
        let mut run = WorkflowRun::new("ns", name, "wf");
        run.metadata.creation_timestamp = Some(Utc::now() - chrono::Duration::minutes(minutes_ago));
        run
    }

    async fn seeded(names: &[(&str, i64)]) -> (Arc<InMemoryStore>, Vec<WorkflowRun>) {
        let store = Arc::new(InMemoryStore::new());
        let mut runs = Vec::new();
        for (name, age) in names {
            runs.push(store.create_workflow_run(run_created_at(name, *age)).await.unwrap());
        }
        (store, runs)
    }

    #[tokio::test]
    async fn test_oldest_run_is_deleted() {
        let (store, runs) = seeded(&[("r1", 30), ("r2", 20), ("r3", 10)]).await;
        let limiter = RunHistoryLimiter::new(store.clone(), 2);

        assert!(limiter.add_or_refresh(&runs[0]).await.is_empty());
        assert!(limiter.add_or_refresh(&runs[1]).await.is_empty());
        let deleted = limiter.add_or_refresh(&runs[2]).await;

        assert_eq!(deleted, vec!["r1".to_string()]);
        assert!(store.get_workflow_run("ns", "r1").await.is_err());
        assert_eq!(limiter.runs("ns", "wf"), vec!["r2", "r3"]);
    }

    #[tokio::test]
    async fn test_refresh_does_not_duplicate() {
        let (store, runs) = seeded(&[("r1", 5)]).await;
        let limiter = RunHistoryLimiter::new(store, 2);
        limiter.add_or_refresh(&runs[0]).await;
        limiter.add_or_refresh(&runs[0]).await;
        limiter.refresh(&runs[0]);
        assert_eq!(limiter.runs("ns", "wf"), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_sorted_by_creation() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = RunHistoryLimiter::new(store, 5);
        limiter.add_or_refresh(&run_created_at("new", 1)).await;
        limiter.add_or_refresh(&run_created_at("old", 60)).await;
        limiter.add_or_refresh(&run_created_at("mid", 30)).await;
        assert_eq!(limiter.runs("ns", "wf"), vec!["old", "mid", "new"]);
    }

    #[tokio::test]
    async fn test_missing_run_is_tolerated() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = RunHistoryLimiter::new(store, 1);
        limiter.add_or_refresh(&run_created_at("gone", 10)).await;
        let deleted = limiter.add_or_refresh(&run_created_at("fresh", 1)).await;
        assert!(deleted.is_empty());
        assert_eq!(limiter.runs("ns", "wf"), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_prune_stale() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = RunHistoryLimiter::new(store, 5);
        limiter.add_or_refresh(&run_created_at("a", 10)).await;
        limiter.add_or_refresh(&run_created_at("b", 5)).await;

        let window = Duration::from_secs(600);
        assert_eq!(limiter.prune_stale(window, Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::minutes(11);
        limiter.refresh(&run_created_at("b", 5));
        assert_eq!(limiter.prune_stale(window, later), 2);
        assert!(limiter.runs("ns", "wf").is_empty());
    }

    #[tokio::test]
    async fn test_zero_limit_keeps_everything() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = RunHistoryLimiter::new(store, 0);
        for i in 0..10 {
            assert!(limiter.add_or_refresh(&run_created_at(&i.to_string(), i)).await.is_empty());
        }
    }
}
