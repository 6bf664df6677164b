//! Delayed garbage collection of finished runs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{add_duration, item_key, WorkflowRunItem, DEFAULT_TICK};
use crate::core::{Phase, WorkflowRun};
use crate::operator::{EngineContext, RunOperator};

/// Collects finished runs after the configured delay.
///
/// A failed collection is retried on later ticks until the retry budget is
/// spent; the last attempt always marks the run cleaned.
pub struct GcProcessor {
    ctx: Arc<EngineContext>,
    items: DashMap<String, WorkflowRunItem>,
    tick: Duration,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for GcProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcProcessor")
            .field("items", &self.items.len())
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl GcProcessor {
    /// Creates a processor ticking every [`DEFAULT_TICK`].
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            items: DashMap::new(),
            tick: DEFAULT_TICK,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Sets the tick interval.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Get a handle that can be used to signal shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Tracks `run` if it finished and was not collected yet.
    ///
    /// Returns true if the run is tracked.
    pub fn add(&self, run: &WorkflowRun) -> bool {
        let gc = &self.ctx.config.gc;
        if !gc.enabled || run.status.cleaned {
            return false;
        }
        let overall = &run.status.overall;
        if !matches!(overall.phase, Phase::Succeeded | Phase::Failed) {
            return false;
        }

        let finished = overall.last_transition_time.unwrap_or_else(Utc::now);
        let item = WorkflowRunItem::new(run, add_duration(finished, gc.delay()), gc.retry);
        debug!(wfr = %item, expire = %item.expire_time, "Track run for GC");
        self.items.insert(item.key(), item);
        true
    }

    /// Stops tracking `namespace/name`.
    pub fn remove(&self, namespace: &str, name: &str) {
        self.items.remove(&item_key(namespace, name));
    }

    /// Tracked item of `namespace/name`.
    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<WorkflowRunItem> {
        self.items.get(&item_key(namespace, name)).map(|i| i.clone())
    }

    /// Number of tracked runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no run is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Collects every run whose delay passed at `now`.
    pub async fn process_expired(&self, now: DateTime<Utc>) {
        let expired: Vec<WorkflowRunItem> = self
            .items
            .iter()
            .filter(|i| i.is_expired(now))
            .map(|i| i.clone())
            .collect();

        for item in expired {
            info!(wfr = %item.name, ns = %item.namespace, retry = item.retry, "Start to GC WorkflowRun");
            let key = item.key();

            let mut op = match RunOperator::from_name(self.ctx.clone(), &item.namespace, &item.name).await {
                Ok(op) => op,
                Err(e) if e.is_not_found() => {
                    debug!(wfr = %item, "WorkflowRun is gone, stop GC");
                    self.items.remove(&key);
                    continue;
                }
                Err(e) => {
                    warn!(wfr = %item, error = %e, "Get WorkflowRun for GC error");
                    self.spend_retry(&key);
                    continue;
                }
            };

            match op.gc(item.retry == 0, false).await {
                Ok(()) => {
                    self.items.remove(&key);
                }
                Err(e) => {
                    warn!(wfr = %item, error = %e, retry = item.retry, "GC WorkflowRun error");
                    self.spend_retry(&key);
                }
            }
        }
    }

    /// Runs the tick loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(tick = ?self.tick, "GC processor started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("GC processor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.tick) => {
                    self.process_expired(Utc::now()).await;
                }
            }
        }
        info!("GC processor stopped");
    }

    fn spend_retry(&self, key: &str) {
        let exhausted = match self.items.get_mut(key) {
            Some(mut item) if item.retry > 0 => {
                item.retry -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if exhausted {
            self.items.remove(key);
        }
    }
}
