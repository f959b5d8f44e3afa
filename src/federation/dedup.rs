//! Activity de-duplication
//!
//! A fixed-size ring of recently seen activity IRIs. Re-posts of an IRI
//! inside the window are acknowledged but produce no side effects.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Number of activity IRIs remembered
pub const DEDUP_WINDOW: usize = 8192;

/// Ring of recently seen activity IRIs with O(1) insert and lookup
pub struct DedupRing {
    inner: Mutex<RingState>,
    capacity: usize,
}

struct RingState {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingState {
                seen: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Record an IRI; returns false when it was already in the window
    pub fn insert(&self, id: &str) -> bool {
        let mut state = self.inner.lock().expect("dedup ring poisoned");

        if state.seen.contains(id) {
            return false;
        }

        if state.order.len() == self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.seen.remove(&oldest);
            }
        }

        state.seen.insert(id.to_string());
        state.order.push_back(id.to_string());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }
}

impl Default for DedupRing {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}
