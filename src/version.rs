use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::key::KeyBytes;
use crate::options::{MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};

/// Soft byte cap of a level; the compaction score is size / cap.
pub fn max_bytes_for_level(level: usize) -> f64 {
    // level 0 is scored by file count, not bytes.
    let mut result = 10.0 * 1048576.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

/// Metadata of one sorted run (SST file or PMEM skiplist instance).
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: KeyBytes,
    pub largest: KeyBytes,
    /// Seeks this file may absorb before it becomes a compaction candidate.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: KeyBytes, largest: KeyBytes) -> Self {
        // one compaction costs about as much as 16 KiB worth of seeks.
        let allowed = (file_size as i64 / 16384).max(100);
        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed),
        }
    }

    /// Returns true when the budget just ran out.
    pub fn record_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) == 1
    }
}

fn after_file(user_key: &[u8], f: &FileMetaData) -> bool {
    user_key > f.largest.key_ref()
}

fn before_file(user_key: &[u8], f: &FileMetaData) -> bool {
    user_key < f.smallest.key_ref()
}

/// A snapshot of the per-level run lists. Shared behind `Arc`; readers and
/// compactions hold a clone while the set moves on.
pub struct Version {
    pub levels: Vec<Vec<Arc<FileMetaData>>>,
    /// Highest size-compaction score and the level it belongs to.
    pub compaction_score: f64,
    pub compaction_level: usize,
    /// Seek-compaction candidate, set from the read path.
    pub file_to_compact: Mutex<Option<(usize, Arc<FileMetaData>)>>,
}

impl Version {
    pub fn empty() -> Self {
        Self {
            levels: vec![Vec::new(); NUM_LEVELS],
            compaction_score: -1.0,
            compaction_level: 0,
            file_to_compact: Mutex::new(None),
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.levels[level].iter().map(|f| f.file_size).sum()
    }

    /// Runs that may contain `user_key`, in search order: level 0 newest
    /// first, then one candidate per deeper level.
    pub fn files_for_get(&self, user_key: &[u8]) -> Vec<(usize, Arc<FileMetaData>)> {
        let mut out = Vec::new();
        let mut l0: Vec<_> = self.levels[0]
            .iter()
            .filter(|f| !after_file(user_key, f) && !before_file(user_key, f))
            .cloned()
            .collect();
        l0.sort_by(|a, b| b.number.cmp(&a.number));
        out.extend(l0.into_iter().map(|f| (0, f)));

        for level in 1..NUM_LEVELS {
            let files = &self.levels[level];
            let idx = files.partition_point(|f| f.largest.key_ref() < user_key);
            if idx < files.len() && !before_file(user_key, &files[idx]) {
                out.push((level, files[idx].clone()));
            }
        }
        out
    }

    /// Does `level` overlap the user-key range `[smallest, largest]`?
    pub fn overlap_in_level(&self, level: usize, smallest: &[u8], largest: &[u8]) -> bool {
        if level == 0 {
            return self.levels[0]
                .iter()
                .any(|f| !after_file(smallest, f) && !before_file(largest, f));
        }
        let files = &self.levels[level];
        let idx = files.partition_point(|f| f.largest.key_ref() < smallest);
        idx < files.len() && !before_file(largest, &files[idx])
    }

    /// All runs at `level` overlapping `[begin, end]` (user keys, `None` is
    /// unbounded). For level 0 the range grows until it is closed under
    /// overlap.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut i = 0;
        while i < self.levels[level].len() {
            let f = self.levels[level][i].clone();
            i += 1;
            if let Some(b) = &begin {
                if after_file(b, &f) {
                    continue;
                }
            }
            if let Some(e) = &end {
                if before_file(e, &f) {
                    continue;
                }
            }
            if level == 0 {
                // an L0 file may widen the range; restart with the union.
                let mut widened = false;
                if let Some(b) = &begin {
                    if f.smallest.key_ref() < &b[..] {
                        begin = Some(f.smallest.key_ref().to_vec());
                        widened = true;
                    }
                }
                if let Some(e) = &end {
                    if f.largest.key_ref() > &e[..] {
                        end = Some(f.largest.key_ref().to_vec());
                        widened = true;
                    }
                }
                if widened {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(f);
        }
        inputs
    }

    /// Push a fresh memtable flush as deep as it can go without overlap,
    /// bounded by `MAX_MEM_COMPACT_LEVEL` and grandparent growth.
    pub fn pick_level_for_memtable_output(&self, smallest: &[u8], largest: &[u8]) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, smallest, largest) {
            return level;
        }
        let max_grandparent_overlap = 10 * (2 << 20) as u64;
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, smallest, largest) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps =
                    self.overlapping_inputs(level + 2, Some(smallest), Some(largest));
                let total: u64 = overlaps.iter().map(|f| f.file_size).sum();
                if total > max_grandparent_overlap {
                    break;
                }
            }
            level += 1;
        }
        level
    }
}

/// One serialized manifest record: the delta between two versions.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(usize, Vec<u8>)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<NewFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFileEntry {
    pub level: usize,
    pub number: u64,
    pub file_size: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    /// Residency of the run, so TieringStats survives recovery.
    pub pmem: bool,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn add_file(&mut self, level: usize, meta: &FileMetaData, pmem: bool) {
        self.new_files.push(NewFileEntry {
            level,
            number: meta.number,
            file_size: meta.file_size,
            smallest: meta.smallest.raw_ref().to_vec(),
            largest: meta.largest.raw_ref().to_vec(),
            pmem,
        });
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: Vec<u8>) {
        self.compact_pointers.push((level, key));
    }
}

/// Applies a sequence of edits on top of a base version.
pub struct VersionBuilder {
    base: Arc<Version>,
    added: Vec<Vec<Arc<FileMetaData>>>,
    deleted: Vec<HashSet<u64>>,
}

impl VersionBuilder {
    pub fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            added: vec![Vec::new(); NUM_LEVELS],
            deleted: vec![HashSet::new(); NUM_LEVELS],
        }
    }

    pub fn apply(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for entry in &edit.new_files {
            let meta = Arc::new(FileMetaData::new(
                entry.number,
                entry.file_size,
                KeyBytes::from_bytes(entry.smallest.clone().into()),
                KeyBytes::from_bytes(entry.largest.clone().into()),
            ));
            self.deleted[entry.level].remove(&entry.number);
            self.added[entry.level].push(meta);
        }
    }

    /// Also used when installing a compaction: carry live metadata through
    /// so `allowed_seeks` state is not reset for untouched files.
    pub fn finish(self) -> Version {
        let mut version = Version::empty();
        for level in 0..NUM_LEVELS {
            let mut files: Vec<Arc<FileMetaData>> = self.base.levels[level]
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.number))
                .cloned()
                .collect();
            files.extend(self.added[level].iter().cloned());
            if level == 0 {
                files.sort_by_key(|f| f.number);
            } else {
                files.sort_by(|a, b| a.smallest.cmp(&b.smallest));
            }
            debug_assert!(
                {
                    let mut numbers = HashSet::new();
                    files.iter().all(|f| numbers.insert(f.number))
                },
                "file appears twice at level {}",
                level
            );
            version.levels[level] = files;
        }
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyVec, ValueType};

    fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            1024,
            KeyVec::from_parts(smallest, 1, ValueType::Value).into_key_bytes(),
            KeyVec::from_parts(largest, 1, ValueType::Value).into_key_bytes(),
        ))
    }

    fn version_with(levels: Vec<(usize, Arc<FileMetaData>)>) -> Version {
        let mut v = Version::empty();
        for (level, f) in levels {
            v.levels[level].push(f);
        }
        for level in 1..NUM_LEVELS {
            v.levels[level].sort_by(|a, b| a.smallest.cmp(&b.smallest));
        }
        v
    }

    #[test]
    fn test_files_for_get_order() {
        let v = version_with(vec![
            (0, meta(4, b"a", b"m")),
            (0, meta(7, b"c", b"z")),
            (1, meta(2, b"a", b"k")),
            (1, meta(3, b"l", b"z")),
        ]);
        let hits = v.files_for_get(b"d");
        let numbers: Vec<u64> = hits.iter().map(|(_, f)| f.number).collect();
        // newest L0 first, then the single L1 candidate
        assert_eq!(numbers, vec![7, 4, 2]);
    }

    #[test]
    fn test_l0_overlap_widens() {
        let v = version_with(vec![
            (0, meta(1, b"a", b"c")),
            (0, meta(2, b"b", b"f")),
            (0, meta(3, b"e", b"h")),
            (0, meta(4, b"x", b"z")),
        ]);
        let inputs = v.overlapping_inputs(0, Some(b"a"), Some(b"c"));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        // a-c overlaps b-f, which pulls in e-h; x-z stays out
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_memtable_output_level() {
        let v = version_with(vec![(2, meta(9, b"p", b"q"))]);
        // no overlap anywhere: capped at MAX_MEM_COMPACT_LEVEL
        assert_eq!(v.pick_level_for_memtable_output(b"a", b"b"), 2);
        // overlap at level 2 stops the push at level 1
        let v2 = version_with(vec![(1, meta(9, b"a", b"c"))]);
        assert_eq!(v2.pick_level_for_memtable_output(b"b", b"d"), 0);
    }

    #[test]
    fn test_builder_apply_and_finish() {
        let base = Arc::new(version_with(vec![(1, meta(1, b"a", b"c"))]));
        let mut edit = VersionEdit::new();
        edit.delete_file(1, 1);
        let new_meta = meta(5, b"d", b"f");
        edit.add_file(1, &new_meta, true);

        let mut builder = VersionBuilder::new(base);
        builder.apply(&edit);
        let v = builder.finish();
        assert_eq!(v.levels[1].len(), 1);
        assert_eq!(v.levels[1][0].number, 5);
    }
}
