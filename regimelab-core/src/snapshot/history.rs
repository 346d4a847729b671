//! Bounded look-back window of merged snapshots.

use super::IndicatorSnapshot;
use std::collections::VecDeque;

/// The current snapshot plus up to `capacity - 1` earlier ones.
///
/// Only snapshots that were pushed (i.e. bars that have closed) are ever
/// stored, so lag 0 is always "now" and nothing later is reachable.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    capacity: usize,
    window: VecDeque<IndicatorSnapshot>,
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window: VecDeque::with_capacity(capacity),
        }
    }

    /// A history holding only `snapshot`, for one-off evaluation.
    pub fn single(snapshot: IndicatorSnapshot) -> Self {
        let mut history = Self::new(1);
        history.push(snapshot);
        history
    }

    pub fn push(&mut self, snapshot: IndicatorSnapshot) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(snapshot);
    }

    /// Snapshot `lag` bars ago (0 = current bar).
    pub fn at(&self, lag: usize) -> Option<&IndicatorSnapshot> {
        let len = self.window.len();
        if lag >= len {
            return None;
        }
        self.window.get(len - 1 - lag)
    }

    pub fn current(&self) -> Option<&IndicatorSnapshot> {
        self.at(0)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(v: f64) -> IndicatorSnapshot {
        IndicatorSnapshot::new().with("x", v)
    }

    #[test]
    fn lag_zero_is_latest() {
        let mut h = SnapshotHistory::new(3);
        h.push(snap(1.0));
        h.push(snap(2.0));
        assert_eq!(h.at(0).unwrap().resolve("x", None), Some(2.0));
        assert_eq!(h.at(1).unwrap().resolve("x", None), Some(1.0));
        assert!(h.at(2).is_none());
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut h = SnapshotHistory::new(2);
        for v in [1.0, 2.0, 3.0] {
            h.push(snap(v));
        }
        assert_eq!(h.len(), 2);
        assert_eq!(h.at(1).unwrap().resolve("x", None), Some(2.0));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let h = SnapshotHistory::new(0);
        assert_eq!(h.capacity(), 1);
    }
}
