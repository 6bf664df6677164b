//! Binary min-heap with keyed access.
//!
//! Items live in an arena vector laid out as a binary heap; a side map from
//! key to arena index allows updating or removing any item in `O(log n)`.

use std::collections::HashMap;

/// An item that can live in a [`KeyedHeap`].
pub trait HeapItem {
    /// Priority; smaller values pop first.
    type Priority: Ord;

    /// Unique key of the item.
    fn key(&self) -> String;

    /// Current priority of the item.
    fn priority(&self) -> Self::Priority;
}

/// Min-heap indexed by key.
#[derive(Debug, Clone)]
pub struct KeyedHeap<T: HeapItem> {
    items: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T: HeapItem> Default for KeyedHeap<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: HeapItem> KeyedHeap<T> {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the heap holds no item.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns true if an item with `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts `item`, replacing and re-positioning an existing item with the same key.
    pub fn push_or_fix(&mut self, item: T) {
        let key = item.key();
        if let Some(&i) = self.index.get(&key) {
            self.items[i] = item;
            self.fix(i);
        } else {
            self.push_new(key, item);
        }
    }

    /// Inserts `item` unless an item with the same key exists. Returns true if inserted.
    pub fn push_if_absent(&mut self, item: T) -> bool {
        let key = item.key();
        if self.index.contains_key(&key) {
            return false;
        }
        self.push_new(key, item);
        true
    }

    /// Removes and returns the item with the smallest priority.
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    /// Removes the item with `key`.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        let i = *self.index.get(key)?;
        self.remove_at(i)
    }

    /// Returns the item with `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        self.index.get(key).map(|&i| &self.items[i])
    }

    /// Iterates items in heap order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Iterates keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Removes every item matching `predicate`, returning them.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let keys: Vec<String> = self
            .items
            .iter()
            .filter(|item| predicate(item))
            .map(HeapItem::key)
            .collect();
        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    fn push_new(&mut self, key: String, item: T) {
        let i = self.items.len();
        self.items.push(item);
        self.index.insert(key, i);
        self.sift_up(i);
    }

    fn remove_at(&mut self, i: usize) -> Option<T> {
        let last = self.items.len().checked_sub(1)?;
        self.swap(i, last);
        let item = self.items.pop()?;
        self.index.remove(&item.key());
        if i < self.items.len() {
            self.fix(i);
        }
        Some(item)
    }

    fn fix(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.items[a].priority() < self.items[b].priority()
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.items.swap(a, b);
        self.index.insert(self.items[a].key(), a);
        self.index.insert(self.items[b].key(), b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns true if the item moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.items.len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let child = if right < n && self.less(right, left) { right } else { left };
            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }
}
