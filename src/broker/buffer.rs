//! Bounded per-topic payload buffer.

use std::collections::VecDeque;

/// Ring of raw payloads in arrival order. Once full, each push evicts the
/// oldest entry.
#[derive(Debug, Clone)]
pub struct TopicBuffer {
    entries: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl TopicBuffer {
    /// Create a buffer holding at most `capacity` payloads (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { entries: VecDeque::with_capacity(capacity.min(64)), capacity }
    }

    pub fn push(&mut self, payload: Vec<u8>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(payload);
    }

    /// Most recently received payload.
    #[must_use]
    pub fn latest(&self) -> Option<&[u8]> {
        self.entries.back().map(Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
#[path = "buffer_test.rs"]
mod tests;
