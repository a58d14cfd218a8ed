//! Free-range slot allocator
//!
//! Free space is kept as an ordered map from run start to run length. Runs
//! are disjoint and never adjacent: `free` always merges a returned run with
//! its neighbours, so the largest allocatable run only shrinks when space is
//! actually in use.

use std::collections::BTreeMap;

/// Index of a slot in the pool. The same index addresses all role regions.
pub type SlotIndex = usize;

/// First-fit allocator over `n_slots` equal-width slots
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    n_slots: usize,
    free: BTreeMap<SlotIndex, usize>,
}

impl SlotAllocator {
    /// Create an allocator with every slot free
    pub fn new(n_slots: usize) -> Self {
        let mut free = BTreeMap::new();
        if n_slots > 0 {
            free.insert(0, n_slots);
        }
        Self { n_slots, free }
    }

    /// Total slots managed
    pub fn n_slots(&self) -> usize {
        self.n_slots
    }

    /// Reserve a contiguous run of `n` slots, returning its first index.
    ///
    /// Returns `None` for `n == 0`, for `n` larger than the pool, or when no
    /// free run is long enough.
    pub fn allocate(&mut self, n: usize) -> Option<SlotIndex> {
        if n == 0 || n > self.n_slots {
            return None;
        }
        let (&start, &len) = self.free.iter().find(|&(_, &len)| len >= n)?;
        self.free.remove(&start);
        if len > n {
            self.free.insert(start + n, len - n);
        }
        Some(start)
    }

    /// Return the run `[pos, pos + n)` to the free list.
    ///
    /// Out-of-range or empty runs are ignored.
    pub fn free(&mut self, pos: SlotIndex, n: usize) {
        if n == 0 || pos.checked_add(n).map_or(true, |end| end > self.n_slots) {
            return;
        }

        let prev = self
            .free
            .range(..pos)
            .next_back()
            .map(|(&start, &len)| (start, len))
            .filter(|&(start, len)| start + len == pos);
        let next = self
            .free
            .range(pos..)
            .next()
            .map(|(&start, &len)| (start, len))
            .filter(|&(start, _)| pos + n == start);

        let mut start = pos;
        let mut len = n;
        if let Some((prev_start, prev_len)) = prev {
            start = prev_start;
            len += prev_len;
        }
        if let Some((next_start, next_len)) = next {
            self.free.remove(&next_start);
            len += next_len;
        }
        self.free.insert(start, len);
    }

    /// Free runs as `(start, len)` pairs, ascending
    pub fn free_ranges(&self) -> Vec<(SlotIndex, usize)> {
        self.free.iter().map(|(&s, &l)| (s, l)).collect()
    }

    /// Slots currently free
    pub fn free_slots(&self) -> usize {
        self.free.values().sum()
    }

    /// Length of the longest free run
    pub fn largest_free(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }
}
