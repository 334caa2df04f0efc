//! Fixed-capacity history ring with eviction on insert.

use std::collections::VecDeque;

/// Keeps the most recent `capacity` entries, dropping the oldest on overflow.
///
/// Insertion never fails. A ring with capacity 0 accepts and immediately
/// discards every entry.
#[derive(Debug, Clone)]
pub struct HistoryRing<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> HistoryRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning the evicted one if the ring was full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(entry);
        }
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// The most recent `n` entries, oldest first.
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &T> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }
}

impl<T: Clone> HistoryRing<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_last_n_oldest_first() {
        let mut ring = HistoryRing::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn test_push_reports_evicted_entry() {
        let mut ring = HistoryRing::new(2);
        assert_eq!(ring.push("a"), None);
        assert_eq!(ring.push("b"), None);
        assert_eq!(ring.push("c"), Some("a"));
        assert_eq!(ring.push("d"), Some("b"));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut ring = HistoryRing::new(10);
        for i in 0..1000 {
            ring.push(i);
            assert!(ring.len() <= 10);
        }
        assert_eq!(ring.iter().next(), Some(&990));
        assert_eq!(ring.latest(), Some(&999));
    }

    #[test]
    fn test_last_n() {
        let mut ring = HistoryRing::new(5);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.last_n(3).copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.last_n(9).count(), 5);
    }

    #[test]
    fn test_zero_capacity_discards() {
        let mut ring = HistoryRing::new(0);
        assert_eq!(ring.push(1), Some(1));
        assert!(ring.is_empty());
    }
}
