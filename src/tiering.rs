use std::collections::{HashSet, VecDeque};

use crate::options::NUM_LEVELS;

/// Residency bookkeeping for sorted runs: every live file number is either
/// an SST on disk (`file_set`) or a PMEM skiplist instance
/// (`skiplist_set`), never both. PMEM residents are additionally tracked in
/// per-level lists ordered oldest-first, which is the eviction order for
/// LRU tiering.
pub struct TieringStats {
    file_set: HashSet<u64>,
    skiplist_set: HashSet<u64>,
    number_list: Vec<VecDeque<u64>>,
}

impl TieringStats {
    pub fn new() -> Self {
        Self {
            file_set: HashSet::new(),
            skiplist_set: HashSet::new(),
            number_list: vec![VecDeque::new(); NUM_LEVELS],
        }
    }

    pub fn insert_into_file_set(&mut self, number: u64) {
        debug_assert!(!self.skiplist_set.contains(&number));
        self.file_set.insert(number);
    }

    pub fn insert_into_skiplist_set(&mut self, number: u64) {
        debug_assert!(!self.file_set.contains(&number));
        self.skiplist_set.insert(number);
    }

    pub fn is_in_file_set(&self, number: u64) -> bool {
        self.file_set.contains(&number)
    }

    pub fn is_in_skiplist_set(&self, number: u64) -> bool {
        self.skiplist_set.contains(&number)
    }

    pub fn remove(&mut self, number: u64) {
        self.file_set.remove(&number);
        self.skiplist_set.remove(&number);
        for list in &mut self.number_list {
            list.retain(|n| *n != number);
        }
    }

    /// Demotion bookkeeping: the number stays live but its run moved from
    /// PMEM to an SST with the same identity.
    pub fn move_to_file_set(&mut self, number: u64) {
        self.skiplist_set.remove(&number);
        for list in &mut self.number_list {
            list.retain(|n| *n != number);
        }
        self.file_set.insert(number);
    }

    /// Record a new PMEM resident at `level` as the most recently used.
    pub fn push_to_number_list(&mut self, level: usize, number: u64) {
        self.number_list[level].push_back(number);
    }

    /// A trivial move keeps the run resident but refiles it under its new
    /// level.
    pub fn move_level(&mut self, number: u64, new_level: usize) {
        let tracked = self.number_list.iter().any(|l| l.contains(&number));
        for list in &mut self.number_list {
            list.retain(|n| *n != number);
        }
        if tracked {
            self.number_list[new_level].push_back(number);
        }
    }

    /// Least-recently-used PMEM resident at `level` that is not among
    /// `exclude` (the running compaction's inputs).
    pub fn pick_eviction_victim(&self, level: usize, exclude: &HashSet<u64>) -> Option<u64> {
        self.number_list[level]
            .iter()
            .find(|n| !exclude.contains(n))
            .copied()
    }

    pub fn file_set_size(&self) -> usize {
        self.file_set.len()
    }

    pub fn skiplist_set_size(&self) -> usize {
        self.skiplist_set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sets_stay_disjoint() {
        let mut stats = TieringStats::new();
        stats.insert_into_skiplist_set(1);
        stats.push_to_number_list(1, 1);
        assert!(stats.is_in_skiplist_set(1));
        assert!(!stats.is_in_file_set(1));

        stats.move_to_file_set(1);
        assert!(stats.is_in_file_set(1));
        assert!(!stats.is_in_skiplist_set(1));
        assert_eq!(stats.pick_eviction_victim(1, &HashSet::new()), None);
    }

    #[test]
    fn test_eviction_order_is_lru() {
        let mut stats = TieringStats::new();
        for n in [10, 11, 12] {
            stats.insert_into_skiplist_set(n);
            stats.push_to_number_list(2, n);
        }
        assert_eq!(stats.pick_eviction_victim(2, &HashSet::new()), Some(10));
        // compaction inputs are skipped
        let exclude: HashSet<u64> = [10].into_iter().collect();
        assert_eq!(stats.pick_eviction_victim(2, &exclude), Some(11));

        stats.remove(10);
        assert_eq!(stats.pick_eviction_victim(2, &HashSet::new()), Some(11));
    }
}
