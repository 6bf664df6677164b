//! Deduplicating work queue feeding the controller worker.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::retry::{RetryConfig, RetryState};
use crate::store::RunEvent;

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<String>,
    pending: HashMap<String, RunEvent>,
    processing: HashSet<String>,
    dirty: HashMap<String, RunEvent>,
    retries: RetryState,
    shutting_down: bool,
}

/// Queue of run events keyed by `namespace/name`.
///
/// A key is queued at most once; a newer event for a queued key replaces the
/// older one. A key that is added while being processed is queued again
/// when [`done`](Self::done) is called, so one run is never handled by two
/// workers at the same time.
#[derive(Debug)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    available: Notify,
    retry: RetryConfig,
}

impl WorkQueue {
    /// Creates a queue using `retry` for rate-limited adds.
    #[must_use]
    pub fn new(retry: RetryConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            available: Notify::new(),
            retry,
        })
    }

    /// Queues `event`.
    pub fn add(&self, event: RunEvent) {
        let key = event.key();
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return;
        }
        if inner.processing.contains(&key) {
            inner.dirty.insert(key, event);
            return;
        }
        if inner.pending.insert(key.clone(), event).is_none() {
            inner.order.push_back(key);
        }
        drop(inner);
        self.available.notify_one();
    }

    /// Queues `event` after `delay`.
    pub fn add_after(self: &Arc<Self>, event: RunEvent, delay: Duration) {
        if delay.is_zero() {
            self.add(event);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(event);
        });
    }

    /// Queues `event` after the backoff delay of its key, counting a
    /// failure.
    pub fn add_rate_limited(self: &Arc<Self>, event: RunEvent) {
        let key = event.key();
        let delay = self.inner.lock().retries.next_delay(&key, &self.retry);
        debug!(key = %key, delay = ?delay, "Requeue with rate limit");
        self.add_after(event, delay);
    }

    /// Failures counted for `key`.
    #[must_use]
    pub fn num_requeues(&self, key: &str) -> usize {
        self.inner.lock().retries.num_requeues(key)
    }

    /// Clears the failures of `key`.
    pub fn forget(&self, key: &str) {
        self.inner.lock().retries.forget(key);
    }

    /// Waits for the next event. Returns `None` once the queue shut down.
    pub async fn get(&self) -> Option<(String, RunEvent)> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return None;
                }
                while let Some(key) = inner.order.pop_front() {
                    if let Some(event) = inner.pending.remove(&key) {
                        inner.processing.insert(key.clone());
                        return Some((key, event));
                    }
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as processed, requeueing it if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        if let Some(event) = inner.dirty.remove(key) {
            if !inner.shutting_down && inner.pending.insert(key.to_string(), event).is_none() {
                inner.order.push_back(key.to_string());
            }
            drop(inner);
            self.available.notify_one();
        }
    }

    /// Number of queued keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out events; waiting callers get `None`.
    pub fn shutdown(&self) {
        self.inner.lock().shutting_down = true;
        self.available.notify_waiters();
        self.available.notify_one();
    }

    /// Returns true after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }
}
