//! Bounded request-id memory for idempotent apply.
//!
//! A cancelled write may already be committed, so clients retry with the
//! same request id. The ring remembers the last `capacity` ids; applying a
//! remembered command is a no-op. The ring is part of the replicated state
//! and is serialized into snapshots so every replica agrees on what has
//! been seen.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use warren_types::RequestId;

/// Default number of remembered request ids.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// FIFO ring of recently applied request ids with set-backed lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRing {
    capacity: usize,
    order: VecDeque<RequestId>,
    seen: BTreeSet<RequestId>,
}

impl DedupRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "dedup capacity must be positive");
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: BTreeSet::new(),
        }
    }

    /// True if `id` was applied within the retention window.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.seen.contains(id)
    }

    /// Records `id`, evicting the oldest entry when full.
    pub fn record(&mut self, id: RequestId) {
        if self.seen.contains(&id) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.clone());
        self.order.push_back(id);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupRing {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_remembers() {
        let mut ring = DedupRing::new(4);
        let id = RequestId::new("r1");
        assert!(!ring.contains(&id));
        ring.record(id.clone());
        assert!(ring.contains(&id));
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut ring = DedupRing::new(2);
        let a = RequestId::new("a");
        let b = RequestId::new("b");
        let c = RequestId::new("c");
        ring.record(a.clone());
        ring.record(b.clone());
        ring.record(c.clone());

        assert!(!ring.contains(&a));
        assert!(ring.contains(&b));
        assert!(ring.contains(&c));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn duplicate_record_does_not_evict() {
        let mut ring = DedupRing::new(2);
        let a = RequestId::new("a");
        let b = RequestId::new("b");
        ring.record(a.clone());
        ring.record(b.clone());
        ring.record(b.clone());
        assert!(ring.contains(&a));
    }
}
