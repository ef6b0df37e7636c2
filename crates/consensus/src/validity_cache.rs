//! Bounded block validity memo

use crate::types::BlockHash;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Remembers whether a block hash passed validation
///
/// Capacity-bounded with FIFO eviction. A miss only costs a re-validation.
pub struct ValidityCache {
    entries: DashMap<BlockHash, bool>,
    order: Mutex<VecDeque<BlockHash>>,
    capacity: usize,
}

impl ValidityCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, hash: &BlockHash) -> Option<bool> {
        self.entries.get(hash).map(|r| *r.value())
    }

    pub fn insert(&self, hash: BlockHash, valid: bool) {
        if self.entries.insert(hash, valid).is_some() {
            return;
        }

        let mut order = self.order.lock();
        order.push_back(hash);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    /// Return the memoized result or compute and store it
    pub fn get_or_insert_with(&self, hash: BlockHash, validate: impl FnOnce() -> bool) -> bool {
        if let Some(valid) = self.get(&hash) {
            return valid;
        }
        let valid = validate();
        self.insert(hash, valid);
        valid
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
