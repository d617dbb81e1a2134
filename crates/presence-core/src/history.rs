//! Fixed-capacity ring buffer for rolling per-session state.

use std::collections::VecDeque;

/// Bounded history: pushing beyond capacity evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct History<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> History<T> {
    /// Capacity must be non-zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be non-zero");
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest-to-newest iteration.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    /// The newest `count` samples, oldest first.
    pub fn last(&self, count: usize) -> impl Iterator<Item = &T> {
        let skip = self.buf.len().saturating_sub(count);
        self.buf.iter().skip(skip)
    }
}
