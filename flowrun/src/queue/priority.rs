//! Thread-safe priority queue with an awaitable `pop`.

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::heap::{HeapItem, KeyedHeap};
use crate::errors::QueueError;

#[derive(Debug)]
struct Inner<T: HeapItem> {
    heap: KeyedHeap<T>,
    closed: bool,
}

/// Keyed min-heap shared between producers and one or more consumers.
///
/// Producers add items from any thread; [`pop`](Self::pop) waits until an
/// item is available or the queue is closed.
#[derive(Debug)]
pub struct PriorityQueue<T: HeapItem> {
    inner: Mutex<Inner<T>>,
    available: Notify,
}

impl<T: HeapItem> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: KeyedHeap::new(),
                closed: false,
            }),
            available: Notify::new(),
        }
    }
}

impl<T: HeapItem + Clone> PriorityQueue<T> {
    /// Creates an open, empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item`, replacing an item with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once the queue is closed.
    pub fn add(&self, item: T) -> Result<(), QueueError> {
        self.with_open(|heap| heap.push_or_fix(item))
    }

    /// Adds every item of `items`, replacing items with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once the queue is closed.
    pub fn bulk_add(&self, items: impl IntoIterator<Item = T>) -> Result<(), QueueError> {
        self.with_open(|heap| items.into_iter().for_each(|item| heap.push_or_fix(item)))
    }

    /// Adds `item` unless its key is already queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once the queue is closed.
    pub fn add_if_not_present(&self, item: T) -> Result<(), QueueError> {
        self.with_open(|heap| {
            heap.push_if_absent(item);
        })
    }

    /// Same as [`add`](Self::add).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once the queue is closed.
    pub fn update(&self, item: T) -> Result<(), QueueError> {
        self.add(item)
    }

    /// Removes the item with `key`, if queued.
    pub fn delete(&self, key: &str) -> Option<T> {
        self.inner.lock().heap.remove(key)
    }

    /// Removes every item matching `predicate`.
    pub fn remove_where(&self, predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        self.inner.lock().heap.remove_where(predicate)
    }

    /// Waits for and removes the item with the smallest priority.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once the queue is closed, including
    /// while waiting.
    pub async fn pop(&self) -> Result<T, QueueError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(QueueError::Closed);
                }
                if let Some(item) = inner.heap.pop() {
                    return Ok(item);
                }
            }

            notified.await;
        }
    }

    /// Returns a copy of the item with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if no such item is queued.
    pub fn get_by_key(&self, key: &str) -> Result<T, QueueError> {
        self.inner
            .lock()
            .heap
            .get(key)
            .cloned()
            .ok_or(QueueError::NotFound)
    }

    /// Copies of all queued items, in no particular order.
    #[must_use]
    pub fn list(&self) -> Vec<T> {
        self.inner.lock().heap.iter().cloned().collect()
    }

    /// Keys of all queued items.
    #[must_use]
    pub fn list_keys(&self) -> Vec<String> {
        self.inner.lock().heap.keys().map(str::to_string).collect()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Closes the queue and wakes every waiting consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_waiters();
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn with_open(&self, f: impl FnOnce(&mut KeyedHeap<T>)) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            f(&mut inner.heap);
        }
        self.available.notify_waiters();
        Ok(())
    }
}
