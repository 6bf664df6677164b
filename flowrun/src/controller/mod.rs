//! The controller loop: watch runs, queue their events, hand them to an
//! [`EventHandler`].
//!
//! Events from [`ResourceStore::watch`] and from periodic resyncs land in a
//! deduplicating [`WorkQueue`]. A single worker drains the queue; a failed
//! event is requeued with backoff until `max_retries` is spent, then dropped
//! until the next resync brings the run back.

mod handler;
mod queue;

pub use handler::{EventHandler, RunHandler};
pub use queue::WorkQueue;

#[cfg(test)]
pub use handler::MockEventHandler;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::LoopConfig;
use crate::errors::Result;
use crate::observability::SpanTimer;
use crate::retry::{with_retry, RetryConfig};
use crate::store::{ResourceStore, RunEvent};

/// Watches runs and feeds their events to a handler.
pub struct Controller {
    store: Arc<dyn ResourceStore>,
    handler: Arc<dyn EventHandler>,
    queue: Arc<WorkQueue>,
    config: LoopConfig,
    list_retry: RetryConfig,
    shutdown: Arc<Notify>,
    feeders: Mutex<Vec<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a stopped controller.
    ///
    /// `retry` shapes the backoff of failed events; its `max_retries` is
    /// replaced by `config.max_retries`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        handler: Arc<dyn EventHandler>,
        config: LoopConfig,
        retry: RetryConfig,
    ) -> Arc<Self> {
        let retry = retry.with_max_retries(config.max_retries);
        Arc::new(Self {
            store,
            handler,
            queue: WorkQueue::new(retry.clone()),
            config,
            list_retry: retry,
            shutdown: Arc::new(Notify::new()),
            feeders: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
        })
    }

    /// The work queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Get a handle that can be used to signal shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Lists every run as created, then starts the watch intake, the resync
    /// ticker and the worker.
    ///
    /// The watch is opened before listing so no change falls in between.
    ///
    /// # Errors
    ///
    /// Returns the store error if the initial list keeps failing.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let events = self.store.watch();
        let runs = self.list_runs().await?;
        info!(runs = runs.len(), "Controller starting");
        for run in runs {
            self.queue.add(RunEvent::Created(run));
        }

        let mut feeders = self.feeders.lock();
        feeders.push(tokio::spawn(Arc::clone(self).watch_loop(events)));
        if self.config.resync_seconds > 0 {
            let period = Duration::from_secs(self.config.resync_seconds);
            feeders.push(tokio::spawn(Arc::clone(self).resync_loop(period)));
        }
        drop(feeders);

        let controller = Arc::clone(self);
        *self.worker.lock() = Some(tokio::spawn(async move {
            while controller.process_next().await {}
            debug!("Controller worker stopped");
        }));
        Ok(())
    }

    /// Handles one queued event, waiting for one if the queue is empty.
    ///
    /// Returns false once the queue shut down.
    pub async fn process_next(&self) -> bool {
        let Some((key, event)) = self.queue.get().await else {
            return false;
        };
        let timer = SpanTimer::start("handle");
        let kind = event.kind();

        match self.handler.handle(event.clone()).await {
            Ok(()) => {
                self.queue.forget(&key);
                debug!(key = %key, event = kind, elapsed_ms = timer.elapsed_ms(), "WorkflowRun event handled");
            }
            Err(e) if self.queue.num_requeues(&key) < self.config.max_retries => {
                warn!(key = %key, event = kind, error = %e, "Handle WorkflowRun event error, requeue");
                self.queue.add_rate_limited(event);
            }
            Err(e) => {
                error!(
                    key = %key,
                    event = kind,
                    error = %e,
                    retries = self.config.max_retries,
                    "Dropping WorkflowRun event out of retries"
                );
                self.queue.forget(&key);
            }
        }
        self.queue.done(&key);
        true
    }

    /// Queues every stored run as updated, then tells the handler.
    pub async fn resync(&self) {
        match self.list_runs().await {
            Ok(runs) => {
                debug!(runs = runs.len(), "Resync WorkflowRuns");
                for run in runs {
                    self.queue.add(RunEvent::Updated(run));
                }
                self.handler.resynced().await;
            }
            Err(e) => error!(error = %e, "List WorkflowRuns for resync error"),
        }
    }

    /// Stops intake and the worker. The event being handled is finished
    /// first; queued events are dropped.
    pub async fn stop(&self) {
        info!("Controller stopping");
        self.shutdown.notify_waiters();
        self.queue.shutdown();

        let feeders: Vec<_> = self.feeders.lock().drain(..).collect();
        for feeder in feeders {
            feeder.abort();
            if let Err(e) = feeder.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Controller feeder task failed");
                }
            }
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Controller worker task failed");
            }
        }
        info!("Controller stopped");
    }

    async fn list_runs(&self) -> Result<Vec<crate::core::WorkflowRun>> {
        let store = self.store.clone();
        Ok(with_retry(&self.list_retry, "list-workflowruns", || {
            let store = store.clone();
            async move { store.list_workflow_runs(None).await }
        })
        .await?)
    }

    async fn watch_loop(self: Arc<Self>, mut events: broadcast::Receiver<RunEvent>) {
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.notified() => break,

                received = events.recv() => match received {
                    Ok(event) => self.queue.add(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch lagged, events lost until next resync");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Watch closed");
                        break;
                    }
                },
            }
        }
        debug!("Watch intake stopped");
    }

    async fn resync_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial list covered it.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.notified() => break,

                _ = ticker.tick() => self.resync().await,
            }
        }
        debug!("Resync ticker stopped");
    }
}
