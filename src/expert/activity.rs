//! Usage bookkeeping for eviction
//!
//! Each resident expert unit carries a hit count. Units are kept per layer
//! in an ordered set keyed `(hit_count, layer, expert)`, so the least used
//! unit of a layer is its set minimum and the global victim is the smallest
//! of the per-layer minima.

use std::collections::{BTreeSet, HashMap};

/// One resident (layer, expert) with its usage count
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActivityUnit {
    pub hit_count: u64,
    pub layer: usize,
    pub expert: usize,
}

/// Ranks resident expert units by hit count
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    layers: Vec<BTreeSet<ActivityUnit>>,
    counts: HashMap<(usize, usize), u64>,
}

impl ActivityTracker {
    pub fn new(n_layers: usize) -> Self {
        Self {
            layers: vec![BTreeSet::new(); n_layers],
            counts: HashMap::new(),
        }
    }

    /// Start tracking a freshly loaded unit with one hit
    pub fn admit(&mut self, layer: usize, expert: usize) {
        self.remove(layer, expert);
        self.insert(layer, expert, 1);
    }

    /// Record another hit on a tracked unit
    pub fn touch(&mut self, layer: usize, expert: usize) {
        let count = self.remove(layer, expert).unwrap_or(0);
        self.insert(layer, expert, count.saturating_add(1));
    }

    /// Stop tracking a unit, returning its hit count
    pub fn remove(&mut self, layer: usize, expert: usize) -> Option<u64> {
        let hit_count = self.counts.remove(&(layer, expert))?;
        if let Some(set) = self.layers.get_mut(layer) {
            set.remove(&ActivityUnit {
                hit_count,
                layer,
                expert,
            });
        }
        Some(hit_count)
    }

    fn insert(&mut self, layer: usize, expert: usize, hit_count: u64) {
        if let Some(set) = self.layers.get_mut(layer) {
            set.insert(ActivityUnit {
                hit_count,
                layer,
                expert,
            });
            self.counts.insert((layer, expert), hit_count);
        }
    }

    /// Least used unit of one layer not rejected by `exclude`
    pub fn layer_victim(
        &self,
        layer: usize,
        exclude: impl Fn(usize, usize) -> bool,
    ) -> Option<ActivityUnit> {
        self.layers
            .get(layer)?
            .iter()
            .find(|u| !exclude(u.layer, u.expert))
            .copied()
    }

    /// Least used unit overall not rejected by `exclude`
    pub fn victim(&self, exclude: impl Fn(usize, usize) -> bool) -> Option<ActivityUnit> {
        (0..self.layers.len())
            .filter_map(|layer| self.layer_victim(layer, &exclude))
            .min()
    }

    pub fn contains(&self, layer: usize, expert: usize) -> bool {
        self.counts.contains_key(&(layer, expert))
    }

    pub fn hit_count(&self, layer: usize, expert: usize) -> Option<u64> {
        self.counts.get(&(layer, expert)).copied()
    }

    /// Units tracked
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_is_least_hit() {
        let mut t = ActivityTracker::new(2);
        t.admit(0, 1);
        t.admit(1, 0);
        t.touch(0, 1);
        assert_eq!(t.hit_count(0, 1), Some(2));

        let v = t.victim(|_, _| false).unwrap();
        assert_eq!((v.layer, v.expert, v.hit_count), (1, 0, 1));
    }

    #[test]
    fn test_ties_break_on_layer_then_expert() {
        let mut t = ActivityTracker::new(3);
        t.admit(2, 0);
        t.admit(1, 5);
        t.admit(1, 3);
        let v = t.victim(|_, _| false).unwrap();
        assert_eq!((v.layer, v.expert), (1, 3));
    }

    #[test]
    fn test_exclusion_and_removal() {
        let mut t = ActivityTracker::new(1);
        t.admit(0, 0);
        t.admit(0, 1);
        let v = t.victim(|_, e| e == 0).unwrap();
        assert_eq!(v.expert, 1);

        assert_eq!(t.remove(0, 1), Some(1));
        assert!(t.victim(|_, e| e == 0).is_none());
        assert_eq!(t.len(), 1);
        assert!(!t.contains(0, 1));
    }

    #[test]
    fn test_readmit_resets_count() {
        let mut t = ActivityTracker::new(1);
        t.admit(0, 0);
        t.touch(0, 0);
        t.touch(0, 0);
        t.admit(0, 0);
        assert_eq!(t.hit_count(0, 0), Some(1));
        assert_eq!(t.len(), 1);
    }
}
