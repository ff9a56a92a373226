//! Object id allocation.
//!
//! Free ids are kept as disjoint blocks keyed by their start. Allocation is
//! first fit; released ranges are merged with adjacent free blocks so the
//! pool does not fragment under alloc/free churn.

use crate::types::ObjectId;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub(crate) struct IdPool {
    /// start -> length
    free: BTreeMap<u128, u128>,
}

impl IdPool {
    /// Pool owning ids `1..=capacity`.
    pub fn with_capacity(capacity: u64) -> Self {
        let mut pool = IdPool::default();
        if capacity > 0 {
            pool.free.insert(1, capacity as u128);
        }
        pool
    }

    pub fn empty() -> Self {
        IdPool::default()
    }

    /// Take `range` consecutive ids.
    pub fn alloc(&mut self, range: u32) -> Option<ObjectId> {
        if range == 0 {
            return None;
        }
        let range = range as u128;
        let (&start, &len) = self.free.iter().find(|(_, len)| **len >= range)?;
        self.free.remove(&start);
        if len > range {
            self.free.insert(start + range, len - range);
        }
        self.verify_invariants();
        Some(ObjectId(start))
    }

    /// Return ids to the pool.
    pub fn release(&mut self, start: ObjectId, range: u32) {
        if range == 0 || !start.is_valid() {
            return;
        }
        let mut start = start.0;
        let mut len = range as u128;

        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            debug_assert!(prev_start + prev_len <= start, "double free of id {}", start);
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(start + len)) {
            self.free.remove(&(start + len));
            len += next_len;
        }
        self.free.insert(start, len);
        self.verify_invariants();
    }

    pub fn available(&self) -> u128 {
        self.free.values().sum()
    }

    pub fn block_count(&self) -> usize {
        self.free.len()
    }

    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        let mut end = 0u128;
        for (&start, &len) in &self.free {
            debug_assert!(len > 0, "Invariant violated: empty free block at {}", start);
            debug_assert!(
                start > end || end == 0,
                "Invariant violated: free blocks overlap or touch at {}",
                start
            );
            end = start + len;
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn verify_invariants(&self) {}
}
