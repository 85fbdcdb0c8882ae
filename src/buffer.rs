//! Bounded retention buffer for live viewing.
//!
//! Keeps the last N snapshots in capture order, independent of whether any of
//! them were persisted. Append and eviction happen under one write lock, so a
//! reader never sees a half-evicted buffer. Readers get an `Arc<Snapshot>` back
//! and never hold the lock while they use it.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::SentinelError;
use crate::snapshot::Snapshot;

pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

pub struct RetentionBuffer {
    frames: RwLock<VecDeque<Arc<Snapshot>>>,
    capacity: usize,
}

impl RetentionBuffer {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append the newest snapshot, evicting the oldest when full.
    pub fn append(&self, snapshot: Arc<Snapshot>) {
        let mut frames = self.frames.write().unwrap_or_else(PoisonError::into_inner);
        while frames.len() >= self.capacity {
            frames.pop_front();
        }
        frames.push_back(snapshot);
    }

    /// Snapshot `index` frames older than the newest (`0` is the newest).
    pub fn get_by_reverse_index(&self, index: usize) -> Result<Arc<Snapshot>, SentinelError> {
        let frames = self.frames.read().unwrap_or_else(PoisonError::into_inner);
        let len = frames.len();
        if index >= len {
            return Err(SentinelError::IndexOutOfRange { index, len });
        }
        Ok(Arc::clone(&frames[len - 1 - index]))
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.frames
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.frames
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Encoded bytes held by the buffer.
    pub fn memory_bytes(&self) -> usize {
        self.frames
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.raw().len())
            .sum()
    }
}

impl Default for RetentionBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
