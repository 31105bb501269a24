//! The compaction engine: merges input runs into warm and hot outputs,
//! choosing PMEM or disk residency per the tiering policy.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use parking_lot::MutexGuard;

use crate::db::{CompactionStats, DbInner, DbState};
use crate::error::DbError;
use crate::filename::table_file_name;
use crate::iterators::{HotnessIterator, StorageIterator};
use crate::key::{KeyBytes, KeySlice, KeyVec, ValueType};
use crate::mem_table::MemTable;
use crate::options::{SstType, TieringOption};
use crate::pmem::PmemPtr;
use crate::pmem::iterator::PmemIterator;
use crate::table::builder::SsTableBuilder;
use crate::version::{FileMetaData, VersionEdit};
use crate::version_set::{Compaction, CompactionInputIter};

/// Which of the two concurrent compaction outputs an entry lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    Warm,
    Hot,
}

/// One finished (or in-flight) output run of a compaction.
struct Output {
    number: u64,
    smallest: KeyVec,
    largest: KeyVec,
    file_size: u64,
    entries: u64,
    pmem: bool,
}

impl Output {
    fn new(number: u64, pmem: bool) -> Self {
        Self {
            number,
            smallest: KeyVec::new(),
            largest: KeyVec::new(),
            file_size: 0,
            entries: 0,
            pmem,
        }
    }

    fn meta(&self) -> FileMetaData {
        FileMetaData::new(
            self.number,
            self.file_size,
            KeyBytes::from_bytes(self.smallest.raw_ref().to_vec().into()),
            KeyBytes::from_bytes(self.largest.raw_ref().to_vec().into()),
        )
    }
}

enum OutputBuilder {
    Sst(SsTableBuilder),
    Pmem { number: u64, entries: usize, bytes: u64 },
}

/// State threaded through one `do_compaction_work` run.
pub(crate) struct CompactionState {
    compaction: Compaction,
    /// Sequences at or below this are invisible to every live snapshot.
    smallest_snapshot: u64,
    outputs: Vec<Output>,
    outputs_hot: Vec<Output>,
    builder: Option<OutputBuilder>,
    builder_hot: Option<OutputBuilder>,
    /// Hot routing is enabled for this run: input level 0 or 1 and a
    /// PMEM warm target.
    hot_permitted: bool,
    total_bytes: u64,
}

impl CompactionState {
    pub(crate) fn new(compaction: Compaction, smallest_snapshot: u64) -> Self {
        Self {
            compaction,
            smallest_snapshot,
            outputs: Vec::new(),
            outputs_hot: Vec::new(),
            builder: None,
            builder_hot: None,
            hot_permitted: false,
            total_bytes: 0,
        }
    }
}

impl DbInner {
    /// One background work unit: an immutable-memtable flush always wins,
    /// then a manual request, then the picked size/seek compaction.
    pub(crate) fn background_compaction(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
    ) -> Result<()> {
        if state.imm.is_some() {
            return self.compact_mem_table(state);
        }

        let is_manual = state.manual_compaction.is_some();
        let compaction = if let Some(m) = &state.manual_compaction {
            let (level, begin, end) = (m.level, m.begin.clone(), m.end.clone());
            state
                .versions
                .compact_range(level, begin.as_deref(), end.as_deref())
        } else {
            state.versions.pick_compaction()
        };

        let result = match compaction {
            None => Ok(()),
            Some(c) if !is_manual && c.is_trivial_move() => self.trivial_move(state, c),
            Some(c) => {
                let smallest_snapshot = state
                    .snapshots
                    .smallest_snapshot(state.versions.last_sequence);
                let mut cs = CompactionState::new(c, smallest_snapshot);
                let status = self.do_compaction_work(state, &mut cs);
                if let Err(e) = &status {
                    if !self.shutting_down.load(Ordering::Acquire) {
                        self.record_background_error(state, DbError::from_anyhow(e));
                    }
                }
                self.cleanup_compaction(state, cs, status.is_ok());
                self.delete_obsolete_files(state);
                status
            }
        };

        if is_manual {
            if let Some(m) = state.manual_compaction.as_mut() {
                m.done = true;
            }
        }
        result
    }

    fn trivial_move(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        mut c: Compaction,
    ) -> Result<()> {
        assert_eq!(1, c.num_input_files(0));
        let f = c.input(0, 0).clone();
        let level = c.level();
        let pmem = self.skiplists.contains_instance(f.number);
        c.edit.delete_file(level, f.number);
        c.edit.add_file(level + 1, &f, pmem);
        let edit = std::mem::take(&mut c.edit);
        state.versions.log_and_apply(edit)?;
        state.tiering.move_level(f.number, level + 1);
        info!(
            "moved {:06} ({} bytes) from L{} to L{}: {}",
            f.number,
            f.file_size,
            level,
            level + 1,
            state.versions.level_summary()
        );
        Ok(())
    }

    /// Flush the immutable memtable as a level-0 run and retire its log.
    pub(crate) fn compact_mem_table(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
    ) -> Result<()> {
        let imm = state.imm.clone().expect("no immutable memtable");
        let mut edit = VersionEdit::new();
        self.write_level0_table(state, &imm, &mut edit)?;
        if self.shutting_down.load(Ordering::Acquire) {
            bail!(DbError::Io(
                "shutting down during memtable compaction".to_string()
            ));
        }
        edit.log_number = Some(state.log_number);
        state.versions.log_and_apply(edit)?;
        state.imm = None;
        self.has_imm.store(false, Ordering::Release);
        self.delete_obsolete_files(state);
        Ok(())
    }

    /// Build a sorted run from a memtable; residency and target level are
    /// chosen here. The mutex is released across the build.
    pub(crate) fn write_level0_table(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
    ) -> Result<()> {
        if mem.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);

        let smallest_user = mem
            .map
            .front()
            .map(|e| e.key().key_ref().to_vec())
            .unwrap();
        let largest_user = mem.map.back().map(|e| e.key().key_ref().to_vec()).unwrap();
        let base = state.versions.current();
        let level = base.pick_level_for_memtable_output(&smallest_user, &largest_user);
        let use_pmem =
            self.pick_warm_residency(state, level, mem.len() + 2, None, number)?;

        info!(
            "level-0 table {:06}: {} entries -> L{} ({})",
            number,
            mem.len(),
            level,
            if use_pmem { "pmem" } else { "sst" }
        );

        let mem_ref = mem.clone();
        let built = MutexGuard::unlocked(state, || {
            if use_pmem {
                self.build_pmem_run(number, mem_ref.iter())
            } else {
                self.build_sst(number, mem_ref.iter())
            }
        });
        state.pending_outputs.remove(&number);
        let built = built?;

        edit.add_file(level, &built, use_pmem);
        if use_pmem {
            state.tiering.insert_into_skiplist_set(number);
            if matches!(
                self.options.tiering_option,
                TieringOption::ColdDataTiering | TieringOption::LruTiering
            ) {
                state.tiering.push_to_number_list(level, number);
            }
        } else {
            state.tiering.insert_into_file_set(number);
        }
        state.stats[level].add(CompactionStats {
            micros: start.elapsed().as_micros() as u64,
            bytes_read: 0,
            bytes_written: built.file_size,
        });
        Ok(())
    }

    fn build_sst(
        &self,
        number: u64,
        mut iter: impl for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>> + 'static,
    ) -> Result<FileMetaData> {
        let mut builder =
            SsTableBuilder::new(self.options.block_size, self.options.filter_bits_per_key);
        let mut smallest = KeyVec::new();
        let mut largest = KeyVec::new();
        while iter.is_valid() {
            if smallest.is_empty() {
                smallest.set_from_slice(iter.key());
            }
            largest.set_from_slice(iter.key());
            builder.add(iter.key(), iter.value());
            iter.next()?;
        }
        let path = table_file_name(&self.path, number);
        let table = builder
            .build(number, Some(self.block_cache.clone()), &path)
            .with_context(|| format!("fail to build table {:06}", number));
        let table = match table {
            Ok(t) => t,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };
        Ok(FileMetaData::new(
            number,
            table.table_size(),
            smallest.into_key_bytes(),
            largest.into_key_bytes(),
        ))
    }

    pub(crate) fn build_pmem_run(
        &self,
        number: u64,
        mut iter: impl for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>> + 'static,
    ) -> Result<FileMetaData> {
        let result = (|| -> Result<FileMetaData> {
            self.skiplists.create_instance(number)?;
            let buffers = self.skiplists.buffers();
            let pool = buffers.pool_for(number);
            let mut smallest = KeyVec::new();
            let mut largest = KeyVec::new();
            let mut bytes = 0u64;
            while iter.is_valid() {
                let key = iter.key();
                if smallest.is_empty() {
                    smallest.set_from_slice(key);
                }
                largest.set_from_slice(key);
                // buffer entry first so the pointer is valid before any
                // reader can observe the node.
                let ptr = buffers.append(pool, key.raw_ref(), iter.value())?;
                self.skiplists.insert_by_ptr(number, key.raw_ref(), ptr, 0)?;
                bytes += (key.raw_len() + iter.value().len()) as u64;
                iter.next()?;
            }
            self.skiplists.insert_null_terminator(number)?;
            buffers.flush(pool)?;
            self.skiplists.flush(number)?;
            Ok(FileMetaData::new(
                number,
                bytes,
                smallest.into_key_bytes(),
                largest.into_key_bytes(),
            ))
        })();
        if result.is_err() {
            let _ = self.skiplists.delete_file(number);
        }
        result
    }

    /// The tiering decision for a warm output at `output_level`.
    pub(crate) fn pick_warm_residency(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        output_level: usize,
        needed_nodes: usize,
        inputs: Option<&HashSet<u64>>,
        number: u64,
    ) -> Result<bool> {
        if self.options.sst_type != SstType::PmemSst {
            return Ok(false);
        }
        let free_ok = !self.skiplists.is_free_list_empty_warning(number)
            && self.skiplists.free_nodes(number) >= needed_nodes;
        let use_pmem = match self.options.tiering_option {
            TieringOption::NoTiering => false,
            TieringOption::LeveledTiering => {
                output_level <= self.options.pmem_skiplist_level_threshold && free_ok
            }
            TieringOption::ColdDataTiering => free_ok,
            TieringOption::LruTiering => {
                let any_input_on_sst = inputs
                    .map(|set| set.iter().any(|n| state.tiering.is_in_file_set(*n)))
                    .unwrap_or(false);
                if any_input_on_sst {
                    // never promote disk-resident data back into PMEM.
                    false
                } else if free_ok {
                    true
                } else {
                    let exclude = inputs.cloned().unwrap_or_default();
                    self.evict_one_pmem_resident(state, output_level, &exclude)?
                        && self.skiplists.free_nodes(number) >= needed_nodes
                }
            }
        };
        Ok(use_pmem)
    }

    /// Inline LRU eviction: demote the least-recently-used PMEM resident at
    /// `level` to an SST with the same file number.
    fn evict_one_pmem_resident(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        level: usize,
        exclude: &HashSet<u64>,
    ) -> Result<bool> {
        // prefer a victim at the output level; fall back across levels so
        // a lopsided LRU list cannot wedge the node pool.
        let victim = std::iter::once(level)
            .chain((0..crate::options::NUM_LEVELS).filter(|l| *l != level))
            .filter_map(|l| state.tiering.pick_eviction_victim(l, exclude))
            .next();
        let Some(victim) = victim else {
            warn!("pmem free list exhausted and no eviction victim at L{}", level);
            return Ok(false);
        };
        info!("evicting pmem run {:06} to sst", victim);

        let mut iter =
            PmemIterator::create_and_seek_to_first(self.skiplists.clone(), victim)?;
        let mut builder =
            SsTableBuilder::new(self.options.block_size, self.options.filter_bits_per_key);
        while iter.is_valid() {
            builder.add(iter.key(), iter.value());
            iter.next()?;
        }
        iter.run_cleanup();
        let path = table_file_name(&self.path, victim);
        builder.build(victim, Some(self.block_cache.clone()), &path)?;
        // table durable; flip the residency, then free the nodes.
        state.tiering.move_to_file_set(victim);
        self.skiplists.delete_file_with_check_ref(victim)?;
        Ok(true)
    }

    /* ------------------- the merge ------------------- */

    pub(crate) fn do_compaction_work(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        cs: &mut CompactionState,
    ) -> Result<()> {
        let start = Instant::now();
        info!(
            "compacting {}@L{} + {}@L{} runs, snapshot floor {}",
            cs.compaction.num_input_files(0),
            cs.compaction.level(),
            cs.compaction.num_input_files(1),
            cs.compaction.level() + 1,
            cs.smallest_snapshot,
        );
        debug_assert!(state.versions.num_level_files(cs.compaction.level()) > 0);
        debug_assert!(cs.builder.is_none() && cs.builder_hot.is_none());

        let bytes_read: u64 = cs
            .compaction
            .inputs
            .iter()
            .flatten()
            .map(|f| f.file_size)
            .sum();

        let mut input = state.versions.make_input_iterator(
            &cs.compaction,
            &self.table_cache,
            &self.skiplists,
        )?;

        // the mutex is released for the whole merge; shared state is only
        // touched through short relocks inside.
        let cs_ref = &mut *cs;
        let merge_result = MutexGuard::unlocked(state, move || {
            let result = self.compaction_merge_loop(cs_ref, &mut input);
            // drop the input iterators before installing the edit so that
            // check-ref deletion of the inputs is not blocked by us.
            drop(input);
            result
        });
        merge_result?;

        if self.shutting_down.load(Ordering::Acquire) {
            bail!(DbError::Io("shutting down during compaction".to_string()));
        }

        self.install_compaction_results(state, cs)?;
        let level = cs.compaction.level();
        state.stats[(level + 1).min(crate::options::NUM_LEVELS - 1)].add(CompactionStats {
            micros: start.elapsed().as_micros() as u64,
            bytes_read,
            bytes_written: cs.total_bytes,
        });
        info!("compaction finished: {}", state.versions.level_summary());
        Ok(())
    }

    fn compaction_merge_loop(
        self: &Arc<Self>,
        cs: &mut CompactionState,
        input: &mut CompactionInputIter,
    ) -> Result<()> {
        let mut current_user_key: Vec<u8> = Vec::new();
        let mut has_current_user_key = false;
        let mut last_sequence_for_key = u64::MAX;

        while input.is_valid() {
            if self.shutting_down.load(Ordering::Acquire) {
                bail!(DbError::Io("shutting down during compaction".to_string()));
            }
            // an arriving immutable memtable always takes priority over
            // the merge, otherwise writers stall behind us.
            if self.has_imm.load(Ordering::Acquire) {
                let mut state = self.state.lock();
                if state.imm.is_some() {
                    self.compact_mem_table(&mut state)?;
                }
                self.background_work_finished.notify_all();
            }

            let key = input.key().to_key_vec();
            if cs.compaction.should_stop_before(key.as_key_slice()) && cs.builder.is_some() {
                self.finish_compaction_output(cs, OutputKind::Warm)?;
                if cs.builder_hot.is_some() {
                    self.finish_compaction_output(cs, OutputKind::Hot)?;
                }
            }

            // the standard LSM drop rules, gated on the snapshot floor.
            let ukey = key.key_ref();
            if !has_current_user_key || ukey != &current_user_key[..] {
                current_user_key.clear();
                current_user_key.extend_from_slice(ukey);
                has_current_user_key = true;
                last_sequence_for_key = u64::MAX;
            }
            let mut drop_entry = false;
            if last_sequence_for_key <= cs.smallest_snapshot {
                // a newer record for this user key is already visible to
                // the oldest snapshot.
                drop_entry = true;
            } else if key.value_type() == ValueType::Deletion
                && key.seq() <= cs.smallest_snapshot
                && cs.compaction.is_base_level_for_key(ukey)
            {
                // tombstone with nothing underneath it to shadow.
                drop_entry = true;
            }
            last_sequence_for_key = key.seq();

            if !drop_entry {
                if cs.builder.is_none() {
                    self.open_compaction_output(cs, OutputKind::Warm)?;
                }
                let ref_times = input.ref_times();
                let is_hot =
                    cs.hot_permitted && ref_times >= self.options.hot_threshold;
                if is_hot && cs.builder_hot.is_none() {
                    self.open_compaction_output(cs, OutputKind::Hot)?;
                }
                let kind = if is_hot && cs.builder_hot.is_some() {
                    OutputKind::Hot
                } else {
                    OutputKind::Warm
                };
                self.append_output(
                    cs,
                    kind,
                    key.as_key_slice(),
                    input.value(),
                    input.buffer_ptr(),
                    ref_times,
                )?;

                // close outputs that hit their size caps.
                let warm_full = match cs.builder.as_ref() {
                    Some(OutputBuilder::Sst(b)) => {
                        b.estimate_size() >= self.options.max_file_size
                    }
                    Some(OutputBuilder::Pmem { entries, .. }) => {
                        *entries >= self.options.max_skiplist_entries - 1
                    }
                    None => false,
                };
                if warm_full {
                    self.finish_compaction_output(cs, OutputKind::Warm)?;
                }
                let hot_full = match cs.builder_hot.as_ref() {
                    Some(OutputBuilder::Pmem { entries, .. }) => {
                        *entries >= self.options.max_skiplist_entries - 1
                    }
                    _ => false,
                };
                if hot_full {
                    self.finish_compaction_output(cs, OutputKind::Hot)?;
                }
            }

            input.next()?;
        }

        if self.shutting_down.load(Ordering::Acquire) {
            bail!(DbError::Io("shutting down during compaction".to_string()));
        }
        if cs.builder.is_some() {
            self.finish_compaction_output(cs, OutputKind::Warm)?;
        }
        if cs.builder_hot.is_some() {
            self.finish_compaction_output(cs, OutputKind::Hot)?;
        }
        Ok(())
    }

    /// Allocate a number and open the next output. Hot outputs are
    /// PMEM-only and silently declined when the node pool is low; callers
    /// then route hot entries to the warm output.
    fn open_compaction_output(
        self: &Arc<Self>,
        cs: &mut CompactionState,
        kind: OutputKind,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let number = state.versions.new_file_number();

        let use_pmem = match kind {
            OutputKind::Warm => {
                let inputs = cs.compaction.input_numbers();
                let use_pmem = self.pick_warm_residency(
                    &mut state,
                    cs.compaction.level() + 1,
                    self.options.max_skiplist_entries + 2,
                    Some(&inputs),
                    number,
                )?;
                cs.hot_permitted = use_pmem
                    && cs.compaction.level() <= 1
                    && self.options.sst_type == SstType::PmemSst;
                use_pmem
            }
            OutputKind::Hot => {
                if self.skiplists.is_free_list_empty_warning(number) {
                    // decline: hot entries flow into the warm output.
                    state.versions.reuse_file_number(number);
                    return Ok(());
                }
                true
            }
        };

        state.pending_outputs.insert(number);
        drop(state);

        if use_pmem {
            self.skiplists.create_instance(number)?;
        }
        let builder = if use_pmem {
            OutputBuilder::Pmem {
                number,
                entries: 0,
                bytes: 0,
            }
        } else {
            OutputBuilder::Sst(SsTableBuilder::new(
                self.options.block_size,
                self.options.filter_bits_per_key,
            ))
        };
        match kind {
            OutputKind::Warm => {
                cs.outputs.push(Output::new(number, use_pmem));
                cs.builder = Some(builder);
            }
            OutputKind::Hot => {
                cs.outputs_hot.push(Output::new(number, use_pmem));
                cs.builder_hot = Some(builder);
            }
        }
        Ok(())
    }

    fn append_output(
        &self,
        cs: &mut CompactionState,
        kind: OutputKind,
        key: KeySlice,
        value: &[u8],
        src_ptr: Option<PmemPtr>,
        ref_times: u16,
    ) -> Result<()> {
        let (builder, outputs) = match kind {
            OutputKind::Warm => (&mut cs.builder, &mut cs.outputs),
            OutputKind::Hot => (&mut cs.builder_hot, &mut cs.outputs_hot),
        };
        let output = outputs.last_mut().expect("append without open output");
        if output.entries == 0 {
            output.smallest.set_from_slice(key);
        }
        output.largest.set_from_slice(key);
        output.entries += 1;

        match builder.as_mut().expect("append without builder") {
            OutputBuilder::Sst(b) => b.add(key, value),
            OutputBuilder::Pmem {
                number,
                entries,
                bytes,
            } => {
                let ptr = match src_ptr {
                    // PMEM-sourced entries keep their stable buffer bytes.
                    Some(ptr) => ptr,
                    // disk-sourced entries are buffered before the node is
                    // linked, so no reader sees a dangling pointer.
                    None => {
                        let buffers = self.skiplists.buffers();
                        buffers.append(buffers.pool_for(*number), key.raw_ref(), value)?
                    }
                };
                self.skiplists
                    .insert_by_ptr(*number, key.raw_ref(), ptr, ref_times)?;
                *entries += 1;
                *bytes += (key.raw_len() + value.len()) as u64;
            }
        }
        Ok(())
    }

    fn finish_compaction_output(
        self: &Arc<Self>,
        cs: &mut CompactionState,
        kind: OutputKind,
    ) -> Result<()> {
        let (builder, outputs) = match kind {
            OutputKind::Warm => (&mut cs.builder, &mut cs.outputs),
            OutputKind::Hot => (&mut cs.builder_hot, &mut cs.outputs_hot),
        };
        let Some(builder) = builder.take() else {
            return Ok(());
        };
        let output = outputs.last_mut().expect("finish without output");
        let number = output.number;

        match builder {
            OutputBuilder::Sst(b) => {
                if b.is_empty() {
                    outputs.pop();
                    self.state.lock().pending_outputs.remove(&number);
                    return Ok(());
                }
                let entries = b.num_entries();
                let table = b.build(
                    number,
                    Some(self.block_cache.clone()),
                    table_file_name(&self.path, number),
                )?;
                output.file_size = table.table_size();
                cs.total_bytes += output.file_size;
                // verify the table is usable before committing to it.
                self.table_cache.get_table(number)?;
                self.state.lock().tiering.insert_into_file_set(number);
                info!(
                    "generated table {:06}@L{}: {} keys, {} bytes",
                    number,
                    cs.compaction.level(),
                    entries,
                    output.file_size
                );
            }
            OutputBuilder::Pmem {
                number: n,
                entries,
                bytes,
            } => {
                debug_assert_eq!(n, number);
                if entries == 0 {
                    // an empty hot output is discarded, nodes and all.
                    self.skiplists.delete_file(number)?;
                    outputs.pop();
                    self.state.lock().pending_outputs.remove(&number);
                    return Ok(());
                }
                self.skiplists.insert_null_terminator(number)?;
                let buffers = self.skiplists.buffers();
                buffers.flush(buffers.pool_for(number))?;
                self.skiplists.flush(number)?;
                output.file_size = bytes;
                cs.total_bytes += bytes;

                let level = match kind {
                    // hot outputs install back at level 0.
                    OutputKind::Hot => 0,
                    OutputKind::Warm => cs.compaction.level() + 1,
                };
                {
                    let mut state = self.state.lock();
                    state.tiering.insert_into_skiplist_set(number);
                    if matches!(
                        self.options.tiering_option,
                        TieringOption::ColdDataTiering | TieringOption::LruTiering
                    ) {
                        state.tiering.push_to_number_list(level, number);
                    }
                }
                if self.options.skiplist_cache {
                    // readability check, mirroring the SST verify above.
                    let mut iter = PmemIterator::create_and_seek_to_first(
                        self.skiplists.clone(),
                        number,
                    )?;
                    iter.run_cleanup();
                }
                info!(
                    "generated pmem run {:06}@L{}: {} keys, {} bytes",
                    number, level, entries, bytes
                );
            }
        }
        Ok(())
    }

    fn install_compaction_results(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        cs: &mut CompactionState,
    ) -> Result<()> {
        info!(
            "compacted {}@L{} + {}@L{} runs => {} bytes",
            cs.compaction.num_input_files(0),
            cs.compaction.level(),
            cs.compaction.num_input_files(1),
            cs.compaction.level() + 1,
            cs.total_bytes
        );
        cs.compaction.add_input_deletions();
        let level = cs.compaction.level();
        for out in &cs.outputs {
            cs.compaction.edit.add_file(level + 1, &out.meta(), out.pmem);
        }
        for out in &cs.outputs_hot {
            debug_assert!(out.pmem && out.entries > 0);
            cs.compaction.edit.add_file(0, &out.meta(), true);
        }
        let edit = std::mem::take(&mut cs.compaction.edit);
        state.versions.log_and_apply(edit)?;

        // inputs are gone from the version; their residency records go
        // now, the instances themselves fall to the obsolete sweep once no
        // pinned version can still read them.
        for f in cs.compaction.inputs.iter().flatten() {
            state.tiering.remove(f.number);
        }
        Ok(())
    }

    /// Abandon whatever an interrupted compaction left behind. Finished
    /// outputs of a failed run never made it into a version, so their
    /// residency records and PMEM instances go too.
    fn cleanup_compaction(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        mut cs: CompactionState,
        installed: bool,
    ) {
        if let Some(OutputBuilder::Pmem { number, .. }) = cs.builder.take() {
            let _ = self.skiplists.delete_file(number);
        }
        if let Some(OutputBuilder::Pmem { number, .. }) = cs.builder_hot.take() {
            let _ = self.skiplists.delete_file(number);
        }
        for out in cs.outputs.iter().chain(cs.outputs_hot.iter()) {
            state.pending_outputs.remove(&out.number);
            if !installed {
                state.tiering.remove(out.number);
                if out.pmem {
                    let _ = self.skiplists.delete_file(out.number);
                }
            }
        }
    }
}
