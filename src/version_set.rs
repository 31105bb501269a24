use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::{bail, Context, Result};
use log::info;

use crate::error::DbError;
use crate::filename::{current_file_name, manifest_file_name};
use crate::iterators::concat_iterator::ConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::key::KeySlice;
use crate::lsm_iterator::RunIterator;
use crate::manifest::Manifest;
use crate::options::{L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::pmem::iterator::PmemIterator;
use crate::pmem::skiplist::PmemSkiplists;
use crate::table_cache::TableCache;
use crate::version::{
    max_bytes_for_level, FileMetaData, Version, VersionBuilder, VersionEdit,
};

/// Merged view over every input run of a compaction.
pub type CompactionInputIter =
    TwoMergeIterator<MergeIterator<RunIterator>, ConcatIterator<RunIterator>>;

/// A picked compaction: the input runs at `level` and `level + 1`, the
/// grandparent runs bounding output size, and the edit under construction.
pub struct Compaction {
    level: usize,
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    max_grandparent_overlap_bytes: u64,
    input_version: Arc<Version>,
    level_ptrs: Vec<usize>,
    pub edit: VersionEdit,
}

impl Compaction {
    fn new(level: usize, input_version: Arc<Version>, max_file_size: usize) -> Self {
        Self {
            level,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            max_grandparent_overlap_bytes: 10 * max_file_size as u64,
            input_version,
            level_ptrs: vec![0; NUM_LEVELS],
            edit: VersionEdit::new(),
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    /// Every input file number, used to shield inputs from inline eviction.
    pub fn input_numbers(&self) -> HashSet<u64> {
        self.inputs
            .iter()
            .flatten()
            .map(|f| f.number)
            .collect()
    }

    /// A single input with nothing to merge below and bounded grandparent
    /// overlap moves by edit only.
    pub fn is_trivial_move(&self) -> bool {
        let grandparent_bytes: u64 = self.grandparents.iter().map(|f| f.file_size).sum();
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && grandparent_bytes <= self.max_grandparent_overlap_bytes
    }

    /// Rotate the output before `key` would drag in too much grandparent
    /// overlap during the eventual compaction to `level + 2`.
    pub fn should_stop_before(&mut self, key: KeySlice) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && key.key_ref()
                > self.grandparents[self.grandparent_index].largest.key_ref()
        {
            if self.seen_key {
                self.overlapped_bytes +=
                    self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;
        if self.overlapped_bytes > self.max_grandparent_overlap_bytes {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// No level below `level + 1` holds `user_key`, so a tombstone at the
    /// output level is the bottommost record for it.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in self.level + 2..NUM_LEVELS {
            let files = &self.input_version.levels[level];
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if user_key <= f.largest.key_ref() {
                    if user_key >= f.smallest.key_ref() {
                        return false;
                    }
                    break;
                }
                // keys arrive in ascending order, never look back.
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            let level = self.level + which;
            for f in &self.inputs[which] {
                self.edit.delete_file(level, f.number);
            }
        }
    }
}

/// Owns the current `Version`, the monotone counters, and the manifest log.
pub struct VersionSet {
    db_path: PathBuf,
    current: Arc<Version>,
    /// Older versions still pinned by readers or compactions; their files
    /// must survive the obsolete-file sweep.
    live: Vec<Weak<Version>>,
    pub next_file_number: u64,
    pub manifest_file_number: u64,
    pub last_sequence: u64,
    pub log_number: u64,
    compact_pointer: Vec<Vec<u8>>,
    manifest: Option<Manifest>,
    max_file_size: usize,
}

impl VersionSet {
    pub fn new(db_path: PathBuf, max_file_size: usize) -> Self {
        Self {
            db_path,
            current: Arc::new(Version::empty()),
            live: Vec::new(),
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            compact_pointer: vec![Vec::new(); NUM_LEVELS],
            manifest: None,
            max_file_size,
        }
    }

    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    fn install(&mut self, version: Version) {
        self.live.retain(|w| w.strong_count() > 0);
        let version = Arc::new(version);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    /// File numbers referenced by the current version or any version a
    /// reader still holds.
    pub fn live_files(&self) -> HashSet<u64> {
        let mut live: HashSet<u64> = self
            .current
            .levels
            .iter()
            .flatten()
            .map(|f| f.number)
            .collect();
        for version in self.live.iter().filter_map(|w| w.upgrade()) {
            live.extend(version.levels.iter().flatten().map(|f| f.number));
        }
        live
    }

    /// `stats`-property line per level.
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = (0..NUM_LEVELS)
            .map(|l| self.current.num_files(l).to_string())
            .collect();
        format!("files[ {} ]", counts.join(" "))
    }

    fn finalize(version: &mut Version) {
        let (mut best_level, mut best_score) = (0, -1.0f64);
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                version.num_files(0) as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                version.level_bytes(level) as f64 / max_bytes_for_level(level)
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }
        version.compaction_level = best_level;
        version.compaction_score = best_score;
    }

    /* ------------------- manifest ------------------- */

    /// Start a brand-new database: manifest 1, first log gets number 2.
    pub fn create_new(&mut self) -> Result<()> {
        self.manifest_file_number = 1;
        self.next_file_number = 2;
        self.write_snapshot(&HashMap::new())
    }

    /// Rebuild state from CURRENT + manifest. Returns the residency of
    /// every file mentioned by the replayed edits, for TieringStats.
    pub fn recover(&mut self) -> Result<HashMap<u64, bool>> {
        let current_path = current_file_name(&self.db_path);
        let name = std::fs::read_to_string(&current_path)
            .context("fail to read CURRENT")?;
        let name = name.trim_end();
        let records = Manifest::recover(self.db_path.join(name))?;
        if records.is_empty() {
            bail!(DbError::Corruption("empty manifest".to_string()));
        }

        let mut builder = VersionBuilder::new(self.current.clone());
        let mut residency = HashMap::new();
        let mut next_file = 0;
        let mut last_seq = 0;
        let mut log_number = 0;
        for edit in &records {
            builder.apply(edit);
            for entry in &edit.new_files {
                residency.insert(entry.number, entry.pmem);
            }
            for (level, key) in &edit.compact_pointers {
                self.compact_pointer[*level] = key.clone();
            }
            if let Some(n) = edit.next_file_number {
                next_file = n;
            }
            if let Some(n) = edit.last_sequence {
                last_seq = n;
            }
            if let Some(n) = edit.log_number {
                log_number = n;
            }
        }
        let mut version = builder.finish();
        Self::finalize(&mut version);
        self.install(version);
        self.next_file_number = next_file.max(2);
        self.last_sequence = last_seq;
        self.log_number = log_number;

        // roll the manifest forward so recovery starts from a snapshot.
        self.manifest_file_number = self.new_file_number();
        self.write_snapshot(&residency)?;
        Ok(residency)
    }

    /// Write a full-state edit into a fresh manifest and repoint CURRENT.
    fn write_snapshot(&mut self, residency: &HashMap<u64, bool>) -> Result<()> {
        let path = manifest_file_name(&self.db_path, self.manifest_file_number);
        let manifest = Manifest::create(&path)?;

        let mut edit = VersionEdit::new();
        edit.comparator_name = Some("tierdb.BytewiseComparator".to_string());
        edit.log_number = Some(self.log_number);
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);
        for (level, key) in self.compact_pointer.iter().enumerate() {
            if !key.is_empty() {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        for (level, files) in self.current.levels.iter().enumerate() {
            for f in files {
                let pmem = residency.get(&f.number).copied().unwrap_or(false);
                edit.add_file(level, f, pmem);
            }
        }
        manifest.add_record(&edit)?;
        self.manifest = Some(manifest);

        // CURRENT is replaced atomically via rename.
        let tmp = self.db_path.join("CURRENT.dbtmp");
        std::fs::write(
            &tmp,
            format!("MANIFEST-{:06}\n", self.manifest_file_number),
        )?;
        std::fs::rename(&tmp, current_file_name(&self.db_path))?;
        Ok(())
    }

    /// Apply an edit: log it to the manifest, then install the new version.
    pub fn log_and_apply(&mut self, mut edit: VersionEdit) -> Result<()> {
        if edit.log_number.is_none() {
            edit.log_number = Some(self.log_number);
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        let mut builder = VersionBuilder::new(self.current.clone());
        builder.apply(&edit);
        let mut version = builder.finish();
        Self::finalize(&mut version);

        let manifest = self
            .manifest
            .as_ref()
            .expect("log_and_apply before create/recover");
        manifest.add_record(&edit)?;

        for (level, key) in &edit.compact_pointers {
            self.compact_pointer[*level] = key.clone();
        }
        if let Some(n) = edit.log_number {
            self.log_number = n;
        }
        self.install(version);
        Ok(())
    }

    /* ------------------- compaction picking ------------------- */

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0
            || self.current.file_to_compact.lock().is_some()
    }

    /// Size compactions beat seek compactions; both expand to the full
    /// overlap closure at `level + 1`.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current.clone();
        let size_compaction = current.compaction_score >= 1.0;
        let seek_compaction = current.file_to_compact.lock().clone();

        let (level, mut inputs0) = if size_compaction {
            let level = current.compaction_level;
            // round-robin: first file past the previous compaction end.
            let pointer = &self.compact_pointer[level];
            let mut picked = None;
            if !pointer.is_empty() {
                picked = current.levels[level]
                    .iter()
                    .find(|f| {
                        f.largest.as_key_slice() > KeySlice::from_slice(pointer)
                    })
                    .cloned();
            }
            let file = picked.or_else(|| current.levels[level].first().cloned())?;
            (level, vec![file])
        } else if let Some((level, file)) = seek_compaction {
            (level, vec![file])
        } else {
            return None;
        };

        if level == 0 {
            let smallest = inputs0
                .iter()
                .map(|f| f.smallest.key_ref().to_vec())
                .min()
                .unwrap();
            let largest = inputs0
                .iter()
                .map(|f| f.largest.key_ref().to_vec())
                .max()
                .unwrap();
            inputs0 = current.overlapping_inputs(0, Some(&smallest), Some(&largest));
            assert!(!inputs0.is_empty());
        }

        let mut c = Compaction::new(level, current, self.max_file_size);
        c.inputs[0] = inputs0;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    fn range_of(files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
        let smallest = files
            .iter()
            .map(|f| f.smallest.key_ref().to_vec())
            .min()
            .unwrap();
        let largest = files
            .iter()
            .map(|f| f.largest.key_ref().to_vec())
            .max()
            .unwrap();
        (smallest, largest)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level;
        let current = c.input_version.clone();
        let (smallest, largest) = Self::range_of(&c.inputs[0]);
        c.inputs[1] = current.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));

        // grow the upper set while it does not drag in more lower files.
        if !c.inputs[1].is_empty() {
            let all: Vec<_> = c.inputs[0]
                .iter()
                .chain(c.inputs[1].iter())
                .cloned()
                .collect();
            let (all_smallest, all_largest) = Self::range_of(&all);
            let expanded0 =
                current.overlapping_inputs(level, Some(&all_smallest), Some(&all_largest));
            if expanded0.len() > c.inputs[0].len() {
                let (new_smallest, new_largest) = Self::range_of(&expanded0);
                let expanded1 = current.overlapping_inputs(
                    level + 1,
                    Some(&new_smallest),
                    Some(&new_largest),
                );
                if expanded1.len() == c.inputs[1].len() {
                    info!(
                        "expanding L{} compaction from {} to {} files",
                        level,
                        c.inputs[0].len(),
                        expanded0.len()
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                }
            }
        }

        let all: Vec<_> = c.inputs[0]
            .iter()
            .chain(c.inputs[1].iter())
            .cloned()
            .collect();
        let (all_smallest, all_largest) = Self::range_of(&all);
        if level + 2 < NUM_LEVELS {
            c.grandparents =
                current.overlapping_inputs(level + 2, Some(&all_smallest), Some(&all_largest));
        }

        // remember where this compaction ends so the next pick rotates on.
        let next_pointer = c.inputs[0]
            .iter()
            .map(|f| f.largest.raw_ref().to_vec())
            .max_by(|a, b| KeySlice::from_slice(a).cmp(&KeySlice::from_slice(b)))
            .unwrap();
        self.compact_pointer[level] = next_pointer.clone();
        c.edit.set_compact_pointer(level, next_pointer);
    }

    /// A compaction over an explicit user-key range (CompactRange).
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<Compaction> {
        let current = self.current.clone();
        let inputs0 = current.overlapping_inputs(level, begin, end);
        if inputs0.is_empty() {
            return None;
        }
        let mut c = Compaction::new(level, current, self.max_file_size);
        c.inputs[0] = inputs0;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /* ------------------- input iterator ------------------- */

    fn run_iterator(
        number: u64,
        table_cache: &TableCache,
        skiplists: &Arc<PmemSkiplists>,
    ) -> Result<RunIterator> {
        if skiplists.contains_instance(number) {
            Ok(RunIterator::Pmem(PmemIterator::create_and_seek_to_first(
                skiplists.clone(),
                number,
            )?))
        } else {
            Ok(RunIterator::Sst(table_cache.new_iterator(number)?))
        }
    }

    /// Merge every input run of `c` in internal-key order: level-L runs go
    /// through a heap (they may overlap at level 0), level-L+1 runs are
    /// concatenated.
    pub fn make_input_iterator(
        &self,
        c: &Compaction,
        table_cache: &TableCache,
        skiplists: &Arc<PmemSkiplists>,
    ) -> Result<CompactionInputIter> {
        let mut upper = Vec::with_capacity(c.inputs[0].len());
        for f in &c.inputs[0] {
            upper.push(Box::new(Self::run_iterator(
                f.number,
                table_cache,
                skiplists,
            )?));
        }
        let mut lower = Vec::with_capacity(c.inputs[1].len());
        for f in &c.inputs[1] {
            lower.push(Self::run_iterator(f.number, table_cache, skiplists)?);
        }
        TwoMergeIterator::create(
            MergeIterator::create(upper),
            ConcatIterator::create(lower)?,
        )
    }
}
