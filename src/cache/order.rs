//! Insertion Order Module
//!
//! Tracks the order in which keys entered a bounded cache so the earliest
//! inserted one can be evicted first. Reads never reorder keys.

use std::collections::VecDeque;

// == Insertion Order ==
/// FIFO eviction order for cache slots.
///
/// Keys are stored in a VecDeque where:
/// - Front = earliest inserted (next to evict)
/// - Back = most recently inserted
#[derive(Debug)]
pub struct InsertionOrder<K> {
    order: VecDeque<K>,
}

impl<K> Default for InsertionOrder<K> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
        }
    }
}

impl<K: PartialEq> InsertionOrder<K> {
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    // == Push ==
    /// Records a newly inserted key at the back.
    ///
    /// Callers push a key only when it enters the cache; refreshing an
    /// existing slot keeps its position.
    pub fn push(&mut self, key: K) {
        self.order.push_back(key);
    }

    // == Remove ==
    /// Removes a key from the tracker.
    pub fn remove(&mut self, key: &K) {
        self.order.retain(|k| k != key);
    }

    // == Evict Oldest ==
    /// Returns and removes the earliest inserted key.
    ///
    /// Returns None if tracker is empty.
    pub fn evict_oldest(&mut self) -> Option<K> {
        self.order.pop_front()
    }

    /// Returns the earliest inserted key without removing it.
    pub fn peek_oldest(&self) -> Option<&K> {
        self.order.front()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }

    /// Iterates keys from earliest to latest insertion.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }
}
