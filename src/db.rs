use std::collections::{HashSet, VecDeque};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use crossbeam::channel;
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::batch::WriteBatch;
use crate::error::DbError;
use crate::filename::{
    current_file_name, lock_file_name, log_file_name, parse_file_name, pmem_dir, FileType,
};
use crate::iterators::concat_iterator::ConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::StorageIterator;
use crate::key::{KeyVec, ValueType, MAX_SEQUENCE};
use crate::lsm_iterator::{FusedIterator, LsmIterator, RunIterator};
use crate::mem_table::MemTable;
use crate::options::{
    DsType, Options, ReadOptions, SstType, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER,
    L0_STOP_WRITES_TRIGGER, NUM_LEVELS, NUM_OF_BUFFER, NUM_OF_SKIPLIST_MANAGER,
};
use crate::pmem::buffer::PmemBuffers;
use crate::pmem::iterator::PmemIterator;
use crate::pmem::skiplist::PmemSkiplists;
use crate::snapshot::SnapshotList;
use crate::table::iterator::SsTableIterator;
use crate::table::BlockCache;
use crate::table_cache::TableCache;
use crate::tiering::TieringStats;
use crate::version::VersionEdit;
use crate::version_set::VersionSet;
use crate::wal::{Wal, WalReader};

/// Per-level compaction statistics surfaced through the `stats` property.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CompactionStats {
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl CompactionStats {
    pub fn add(&mut self, other: CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// A queued write waiting its turn at the head of the writer queue.
pub(crate) struct Writer {
    batch: Mutex<Option<WriteBatch>>,
    sync: bool,
    done: AtomicBool,
    status: Mutex<Option<DbError>>,
    cv: Condvar,
}

impl Writer {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Self {
        Self {
            batch: Mutex::new(batch),
            sync,
            done: AtomicBool::new(false),
            status: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn finish(&self, status: Option<DbError>) {
        *self.status.lock() = status;
        self.done.store(true, Ordering::Release);
    }

    fn take_result(&self) -> Result<()> {
        match self.status.lock().take() {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }
}

/// A pending CompactRange request consumed by the background thread.
pub(crate) struct ManualCompaction {
    pub level: usize,
    pub begin: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
    pub done: bool,
}

/// Everything guarded by the one DB mutex.
pub(crate) struct DbState {
    pub mem: Arc<MemTable>,
    pub imm: Option<Arc<MemTable>>,
    pub wal: Option<Arc<Wal>>,
    /// Number of the live WAL; lower-numbered logs die with the next flush.
    pub log_number: u64,
    pub versions: VersionSet,
    pub tiering: TieringStats,
    pub writers: VecDeque<Arc<Writer>>,
    pub snapshots: SnapshotList,
    pub pending_outputs: HashSet<u64>,
    pub bg_error: Option<DbError>,
    pub background_compaction_scheduled: bool,
    pub manual_compaction: Option<ManualCompaction>,
    pub stats: Vec<CompactionStats>,
    pub total_delayed_micros: u64,
}

pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) options: Options,
    pub(crate) state: Mutex<DbState>,
    /// Signalled whenever background work completes or fails.
    pub(crate) background_work_finished: Condvar,
    pub(crate) shutting_down: AtomicBool,
    /// Mirror of `state.imm.is_some()`, checked without the mutex from the
    /// compaction merge loop.
    pub(crate) has_imm: AtomicBool,
    pub(crate) table_cache: Arc<TableCache>,
    pub(crate) block_cache: Arc<BlockCache>,
    pub(crate) skiplists: Arc<PmemSkiplists>,
    compaction_tx: channel::Sender<()>,
    _lock_file: std::fs::File,
}

/// A tiered LSM key-value store: PMEM-resident sorted runs for hot and warm
/// levels, SSTables for cold ones.
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
    compaction_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// RAII snapshot handle; dropping it releases the pinned sequence.
pub struct Snapshot {
    seq: u64,
    inner: Arc<DbInner>,
}

impl Snapshot {
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.inner.state.lock().snapshots.release(self.seq);
    }
}

impl Db {
    pub fn open(options: Options, path: impl AsRef<Path>) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        if options.ds_type == DsType::Hashmap {
            bail!(DbError::NotSupported(
                "ds_type Hashmap is not implemented; use Skiplist".to_string()
            ));
        }
        if options.sst_type == SstType::PmemSst && !options.use_pmem_buffer {
            bail!(DbError::InvalidArgument(
                "PmemSst requires use_pmem_buffer".to_string()
            ));
        }

        std::fs::create_dir_all(&path).context("fail to create db dir")?;
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_file_name(&path))
            .context("fail to take LOCK")?;

        let block_cache = options
            .block_cache
            .clone()
            .unwrap_or_else(|| Arc::new(BlockCache::new(4096)));
        let table_cache = Arc::new(TableCache::new(
            path.clone(),
            block_cache.clone(),
            options.max_open_files.saturating_sub(10).max(16),
        ));
        let buffers = Arc::new(PmemBuffers::open(
            pmem_dir(&path),
            NUM_OF_BUFFER,
            options.pmem_buffer_capacity,
        )?);
        let skiplists = Arc::new(PmemSkiplists::open(
            pmem_dir(&path),
            NUM_OF_SKIPLIST_MANAGER,
            options.pmem_node_capacity,
            options.max_skiplist_entries + 2,
            options.deterministic_skiplist,
            buffers,
        )?);

        let (tx, rx) = channel::unbounded();
        let inner = Arc::new(DbInner {
            state: Mutex::new(DbState {
                mem: Arc::new(MemTable::create(0)),
                imm: None,
                wal: None,
                log_number: 0,
                versions: VersionSet::new(path.clone(), options.max_file_size),
                tiering: TieringStats::new(),
                writers: VecDeque::new(),
                snapshots: SnapshotList::new(),
                pending_outputs: HashSet::new(),
                bg_error: None,
                background_compaction_scheduled: false,
                manual_compaction: None,
                stats: vec![CompactionStats::default(); NUM_LEVELS],
                total_delayed_micros: 0,
            }),
            background_work_finished: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            table_cache,
            block_cache,
            skiplists,
            compaction_tx: tx,
            path,
            options,
            _lock_file: lock_file,
        });

        inner.recover()?;

        let thread_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("tierdb-compaction".to_string())
            .spawn(move || {
                while rx.recv().is_ok() {
                    if thread_inner.shutting_down.load(Ordering::Acquire) {
                        break;
                    }
                    thread_inner.background_call();
                }
            })?;

        {
            let mut state = inner.state.lock();
            inner.maybe_schedule_compaction(&mut state);
        }

        Ok(Db {
            inner,
            compaction_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(&WriteOptions::default(), batch)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(&WriteOptions::default(), batch)
    }

    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write_impl(options.sync, Some(batch))
    }

    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.get(options, key)
    }

    /// Ordered scan over the user-key range.
    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<FusedIterator<LsmIterator>> {
        self.inner.scan(lower, upper, None)
    }

    pub fn scan_at(
        &self,
        options: &ReadOptions,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<FusedIterator<LsmIterator>> {
        self.inner.scan(lower, upper, options.snapshot)
    }

    pub fn get_snapshot(&self) -> Snapshot {
        let mut state = self.inner.state.lock();
        let seq = state.versions.last_sequence;
        state.snapshots.acquire(seq);
        Snapshot {
            seq,
            inner: self.inner.clone(),
        }
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// Compact every run overlapping `[begin, end]` down the tree until no
    /// overlapping picks remain.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    pub fn get_property(&self, name: &str) -> Option<String> {
        self.inner.get_property(name)
    }

    /// Block until the background queue is idle. Test hook.
    pub fn wait_for_background_work(&self) {
        let mut state = self.inner.state.lock();
        while state.background_compaction_scheduled {
            self.inner.background_work_finished.wait(&mut state);
        }
    }

    /// Force the current memtable through a flush. Test hook.
    pub fn flush_memtable(&self) -> Result<()> {
        self.inner.write_impl(false, None)?;
        let mut state = self.inner.state.lock();
        while state.imm.is_some() && state.bg_error.is_none() {
            self.inner.background_work_finished.wait(&mut state);
        }
        match &state.bg_error {
            Some(e) => Err(e.clone().into()),
            None => Ok(()),
        }
    }

    pub fn close(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::Release);
        // wake the worker so it can observe the flag and exit.
        let _ = self.inner.compaction_tx.send(());
        if let Some(handle) = self.compaction_thread.lock().take() {
            let _ = handle.join();
        }
        let mut state = self.inner.state.lock();
        // the worker may have bailed with its work still marked scheduled;
        // clear it and wake anyone waiting on background progress, who
        // will observe the shutdown flag.
        state.background_compaction_scheduled = false;
        if let Some(wal) = state.wal.clone() {
            let _ = wal.sync();
        }
        self.inner.background_work_finished.notify_all();
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl DbInner {
    /* ------------------- recovery ------------------- */

    fn recover(self: &Arc<Self>) -> Result<()> {
        let current = current_file_name(&self.path);
        let mut state = self.state.lock();
        if current.exists() {
            if self.options.error_if_exists {
                bail!(DbError::InvalidArgument(format!(
                    "{:?} exists (error_if_exists is true)",
                    self.path
                )));
            }
            let residency = state.versions.recover()?;
            // rebuild tiering residency for the live runs and make sure
            // PMEM residents actually survived in the pools.
            let current_version = state.versions.current();
            for (level, files) in current_version.levels.iter().enumerate() {
                for f in files {
                    if residency.get(&f.number).copied().unwrap_or(false) {
                        if !self.skiplists.contains_instance(f.number) {
                            bail!(DbError::Corruption(format!(
                                "skiplist run {:06} missing from pmem pools",
                                f.number
                            )));
                        }
                        state.tiering.insert_into_skiplist_set(f.number);
                        state.tiering.push_to_number_list(level, f.number);
                    } else {
                        state.tiering.insert_into_file_set(f.number);
                    }
                }
            }
            self.replay_logs(&mut state)?;
        } else {
            if !self.options.create_if_missing {
                bail!(DbError::InvalidArgument(format!(
                    "{:?} does not exist (create_if_missing is false)",
                    self.path
                )));
            }
            state.versions.create_new()?;
            self.start_new_log(&mut state)?;
        }
        self.delete_obsolete_files(&mut state);
        Ok(())
    }

    fn start_new_log(&self, state: &mut DbState) -> Result<()> {
        let number = state.versions.new_file_number();
        let wal = Wal::create(log_file_name(&self.path, number))?;
        state.wal = Some(Arc::new(wal));
        state.log_number = number;
        state.mem = Arc::new(MemTable::create(number));

        let mut edit = VersionEdit::new();
        edit.log_number = Some(number);
        state.versions.log_and_apply(edit)?;
        Ok(())
    }

    /// Replay every WAL newer than the manifest's log number, oldest first.
    fn replay_logs(self: &Arc<Self>, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let min_log = state.versions.log_number;
        let mut logs = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((number, FileType::Log)) = parse_file_name(name) {
                if number >= min_log {
                    logs.push(number);
                }
            }
        }
        logs.sort_unstable();

        let mut max_seq = 0;
        for (i, number) in logs.iter().enumerate() {
            let last_log = i + 1 == logs.len();
            let mut reader = WalReader::open(
                log_file_name(&self.path, *number),
                self.options.paranoid_checks,
            )?;
            let mut mem = Arc::new(MemTable::create(*number));
            while let Some(record) = reader.read_record()? {
                let batch = WriteBatch::from_contents(&record)?;
                let end_seq = batch.sequence() + batch.count() as u64 - 1;
                max_seq = max_seq.max(end_seq);
                batch.insert_into(&mem)?;
                if mem.approximate_size() > self.options.write_buffer_size {
                    // mid-replay overflow: flush the prefix and continue
                    // into a fresh table for the rest of this log.
                    let mut edit = VersionEdit::new();
                    self.write_level0_table(state, &mem, &mut edit)?;
                    edit.log_number = Some(*number);
                    state.versions.log_and_apply(edit)?;
                    mem = Arc::new(MemTable::create(*number));
                }
            }
            state.versions.mark_file_number_used(*number);

            if last_log && self.options.reuse_logs && !mem.is_empty() {
                // keep appending to the old log and adopt its memtable.
                let wal = Wal::reopen_for_append(log_file_name(&self.path, *number))?;
                state.wal = Some(Arc::new(wal));
                state.log_number = *number;
                state.mem = mem;
                info!("reusing log {:06}", number);
            } else if !mem.is_empty() {
                let mut edit = VersionEdit::new();
                self.write_level0_table(state, &mem, &mut edit)?;
                edit.log_number = Some(*number);
                state.versions.log_and_apply(edit)?;
            }
        }

        if state.versions.last_sequence < max_seq {
            state.versions.last_sequence = max_seq;
        }
        if state.wal.is_none() {
            self.start_new_log(state)?;
        }
        Ok(())
    }

    /* ------------------- write path ------------------- */

    /// The writer-queue protocol: queue up, wait to reach the head (or be
    /// absorbed into a group), make room, commit the coalesced batch with
    /// the mutex released across WAL and memtable work.
    pub(crate) fn write_impl(self: &Arc<Self>, sync: bool, batch: Option<WriteBatch>) -> Result<()> {
        let w = Arc::new(Writer::new(batch, sync));
        let mut state = self.state.lock();
        state.writers.push_back(w.clone());
        while !w.is_done() && !Arc::ptr_eq(state.writers.front().unwrap(), &w) {
            w.cv.wait(&mut state);
        }
        if w.is_done() {
            return w.take_result();
        }

        let force = w.batch.lock().is_none();
        let mut status = self
            .make_room_for_write(&mut state, force)
            .err()
            .map(|e| DbError::from_anyhow(&e));
        let mut last_writer = w.clone();

        if status.is_none() && !force {
            let (mut group, last, group_sync) = Self::build_batch_group(&mut state);
            last_writer = last;
            let seq = state.versions.last_sequence + 1;
            group.set_sequence(seq);
            state.versions.last_sequence += group.count() as u64;

            let wal = state.wal.clone().expect("write with no live WAL");
            let mem = state.mem.clone();
            // the head writer owns the critical section; IO runs unlocked.
            MutexGuard::unlocked(&mut state, || {
                let result = (|| -> Result<()> {
                    wal.add_record(group.contents())?;
                    if group_sync {
                        wal.sync()?;
                    }
                    group.insert_into(&mem)
                })();
                status = result.err().map(|e| DbError::from_anyhow(&e));
            });
            if let Some(e) = &status {
                // a half-written group poisons the log tail: stop writes.
                self.record_background_error(&mut state, e.clone());
            }
        }

        loop {
            let ready = state.writers.pop_front().expect("writer queue underflow");
            let is_self = Arc::ptr_eq(&ready, &w);
            if !is_self {
                ready.finish(status.clone());
                ready.cv.notify_all();
            }
            if Arc::ptr_eq(&ready, &last_writer) {
                break;
            }
        }
        if let Some(front) = state.writers.front() {
            front.cv.notify_all();
        }
        drop(state);

        match status {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    /// Coalesce the head writer with queued non-conflicting writers, up to
    /// 1 MiB (less when the head batch is small, to not penalize it).
    fn build_batch_group(state: &mut DbState) -> (WriteBatch, Arc<Writer>, bool) {
        let first = state.writers.front().unwrap().clone();
        let mut group = first.batch.lock().take().expect("head writer without batch");
        let first_sync = first.sync;
        let mut size = group.byte_size();
        let max_size = if size <= 128 << 10 {
            size + (128 << 10)
        } else {
            1 << 20
        };

        let mut last = first.clone();
        for candidate in state.writers.iter().skip(1) {
            if candidate.sync && !first_sync {
                // a sync write must not be hidden inside a non-sync group.
                break;
            }
            let mut slot = candidate.batch.lock();
            let Some(batch) = slot.as_ref() else {
                // a compaction-forcing dummy write never joins a group.
                break;
            };
            if size + batch.byte_size() > max_size {
                break;
            }
            size += batch.byte_size();
            group.append(&slot.take().unwrap());
            last = candidate.clone();
        }
        (group, last, first_sync)
    }

    /// The write-stall policy, evaluated in order until an exit applies.
    fn make_room_for_write(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, DbState>,
        force: bool,
    ) -> Result<()> {
        let mut allow_delay = !force;
        let mut force = force;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                bail!(DbError::Io("shutting down".to_string()));
            }
            if let Some(e) = &state.bg_error {
                return Err(e.clone().into());
            }
            if allow_delay
                && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // shed a little pressure without blocking any one writer
                // for long; this delay is granted only once per write.
                let started = Instant::now();
                MutexGuard::unlocked(state, || {
                    std::thread::sleep(Duration::from_millis(1));
                });
                state.total_delayed_micros += started.elapsed().as_micros() as u64;
                allow_delay = false;
                continue;
            }
            if !force
                && state.mem.approximate_size() <= self.options.write_buffer_size
            {
                break;
            }
            if state.imm.is_some() {
                info!("current memtable full; waiting on flush");
                let started = Instant::now();
                self.background_work_finished.wait(state);
                state.total_delayed_micros += started.elapsed().as_micros() as u64;
                continue;
            }
            if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                warn!("too many L0 files; stopping writes");
                let started = Instant::now();
                self.background_work_finished.wait(state);
                state.total_delayed_micros += started.elapsed().as_micros() as u64;
                continue;
            }

            // rotate: fresh WAL first, then freeze the memtable.
            let new_log_number = state.versions.new_file_number();
            let wal = match Wal::create(log_file_name(&self.path, new_log_number)) {
                Ok(wal) => wal,
                Err(e) => {
                    state.versions.reuse_file_number(new_log_number);
                    return Err(e);
                }
            };
            state.wal = Some(Arc::new(wal));
            state.log_number = new_log_number;
            let imm = std::mem::replace(
                &mut state.mem,
                Arc::new(MemTable::create(new_log_number)),
            );
            state.imm = Some(imm);
            self.has_imm.store(true, Ordering::Release);
            force = false;
            self.maybe_schedule_compaction(state);
        }
        Ok(())
    }

    /* ------------------- read path ------------------- */

    pub(crate) fn get(self: &Arc<Self>, options: &ReadOptions, key: &[u8]) -> Result<Option<Bytes>> {
        let (mem, imm, version, seq) = {
            let state = self.state.lock();
            (
                state.mem.clone(),
                state.imm.clone(),
                state.versions.current(),
                options
                    .snapshot
                    .unwrap_or(state.versions.last_sequence),
            )
        };

        if let Some(result) = mem.get(key, seq) {
            return Ok(result);
        }
        if let Some(imm) = imm {
            if let Some(result) = imm.get(key, seq) {
                return Ok(result);
            }
        }

        let candidates = version.files_for_get(key);
        let mut first_sought = None;
        let mut sought = 0;
        let mut found = None;
        for (level, f) in &candidates {
            sought += 1;
            if sought == 1 {
                first_sought = Some((*level, f.clone()));
            }
            if let Some(result) = self.probe_run(f.number, key, seq)? {
                found = Some(result);
                break;
            }
        }

        // charge the first probed run for the wasted seek; when its budget
        // runs out it becomes a seek-compaction candidate.
        if sought > 1 {
            if let Some((level, f)) = first_sought {
                if f.record_seek() {
                    let mut slot = version.file_to_compact.lock();
                    if slot.is_none() {
                        *slot = Some((level, f));
                    }
                    drop(slot);
                    let mut state = self.state.lock();
                    self.maybe_schedule_compaction(&mut state);
                }
            }
        }

        Ok(found.flatten())
    }

    pub(crate) fn scan(
        self: &Arc<Self>,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        snapshot: Option<u64>,
    ) -> Result<FusedIterator<LsmIterator>> {
        let (mem, imm, version, seq) = {
            let state = self.state.lock();
            (
                state.mem.clone(),
                state.imm.clone(),
                state.versions.current(),
                snapshot.unwrap_or(state.versions.last_sequence),
            )
        };

        // seek target in internal-key space for the lower bound.
        let seek_key = match lower {
            Bound::Included(x) => Some(KeyVec::for_lookup(x, seq)),
            Bound::Excluded(x) => Some(KeyVec::for_lookup(x, MAX_SEQUENCE)),
            Bound::Unbounded => None,
        };
        let mem_lower = match &seek_key {
            Some(k) => Bound::Included(k.as_key_slice()),
            None => Bound::Unbounded,
        };
        let mem_upper = crate::mem_table::map_upper_user_bound(upper);
        let mem_upper = match &mem_upper {
            Bound::Included(k) => Bound::Included(k.as_key_slice()),
            Bound::Excluded(k) => Bound::Excluded(k.as_key_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };

        let mut mem_iters = Vec::new();
        mem_iters.push(Box::new(mem.scan(mem_lower, mem_upper)));
        if let Some(imm) = &imm {
            mem_iters.push(Box::new(imm.scan(mem_lower, mem_upper)));
        }

        let in_range = |f: &crate::version::FileMetaData| match (lower, upper) {
            (_, Bound::Included(u)) if f.smallest.key_ref() > u => false,
            (_, Bound::Excluded(u)) if f.smallest.key_ref() >= u => false,
            (Bound::Included(l), _) if f.largest.key_ref() < l => false,
            (Bound::Excluded(l), _) if f.largest.key_ref() < l => false,
            _ => true,
        };

        let mut l0_iters = Vec::new();
        for f in &version.levels[0] {
            if in_range(f) {
                l0_iters.push(Box::new(self.run_iterator_at(f.number, seek_key.as_ref())?));
            }
        }

        let mut level_iters = Vec::new();
        for level in 1..NUM_LEVELS {
            let mut run_iters = Vec::new();
            for f in &version.levels[level] {
                if in_range(f) {
                    run_iters.push(self.run_iterator_at(f.number, seek_key.as_ref())?);
                }
            }
            level_iters.push(Box::new(ConcatIterator::create(run_iters)?));
        }

        let inner = TwoMergeIterator::create(
            TwoMergeIterator::create(
                MergeIterator::create(mem_iters),
                MergeIterator::create(l0_iters),
            )?,
            MergeIterator::create(level_iters),
        )?;
        let end_bound = match upper {
            Bound::Included(x) => Bound::Included(Bytes::copy_from_slice(x)),
            Bound::Excluded(x) => Bound::Excluded(Bytes::copy_from_slice(x)),
            Bound::Unbounded => Bound::Unbounded,
        };
        let mut iter = LsmIterator::new(inner, end_bound, seq)?;
        if let Bound::Excluded(x) = lower {
            while iter.is_valid() && iter.key() == x {
                iter.next()?;
            }
        }
        Ok(FusedIterator::new(iter))
    }

    /// Probe one run for `key`. Outer `None` means the run does not hold
    /// the key; inner `None` means a tombstone ends the search.
    fn probe_run(&self, number: u64, key: &[u8], seq: u64) -> Result<Option<Option<Bytes>>> {
        if self.skiplists.contains_instance(number) {
            if let Some((ty, value)) = self.skiplists.lookup(number, key, seq) {
                return Ok(Some(match ty {
                    ValueType::Value => Some(value),
                    ValueType::Deletion => None,
                }));
            }
            if self.skiplists.contains_instance(number) {
                return Ok(None);
            }
            // demoted to an SST between the check and the lookup: the
            // number-identical table below has the same data.
        }
        let table = self.table_cache.get_table(number)?;
        if let Some(bloom) = &table.bloom {
            if !bloom.may_contain(farmhash::fingerprint32(key)) {
                return Ok(None);
            }
        }
        let lookup = KeyVec::for_lookup(key, seq);
        let iter = SsTableIterator::create_and_seek_to_key(table, lookup.as_key_slice())?;
        if iter.is_valid() && iter.key().key_ref() == key {
            return Ok(Some(match iter.key().value_type() {
                ValueType::Value => Some(Bytes::copy_from_slice(iter.value())),
                ValueType::Deletion => None,
            }));
        }
        Ok(None)
    }

    pub(crate) fn run_iterator_at(&self, number: u64, seek: Option<&KeyVec>) -> Result<RunIterator> {
        if self.skiplists.contains_instance(number) {
            let iter = match seek {
                Some(k) => PmemIterator::create_and_seek_to_key(
                    self.skiplists.clone(),
                    number,
                    k.as_key_slice(),
                ),
                None => PmemIterator::create_and_seek_to_first(self.skiplists.clone(), number),
            };
            match iter {
                Ok(iter) => return Ok(RunIterator::Pmem(iter)),
                // lost a race with inline eviction; read the run's SST.
                Err(_) => {}
            }
        }
        let table = self.table_cache.get_table(number)?;
        let iter = match seek {
            Some(k) => SsTableIterator::create_and_seek_to_key(table, k.as_key_slice())?,
            None => SsTableIterator::create_and_seek_to_first(table)?,
        };
        Ok(RunIterator::Sst(iter))
    }

    /* ------------------- background plumbing ------------------- */

    pub(crate) fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.background_compaction_scheduled {
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if state.bg_error.is_some() {
            return;
        }
        if state.imm.is_none()
            && state.manual_compaction.is_none()
            && !state.versions.needs_compaction()
        {
            return;
        }
        state.background_compaction_scheduled = true;
        let _ = self.compaction_tx.send(());
    }

    fn background_call(self: &Arc<Self>) {
        let mut state = self.state.lock();
        debug_assert!(state.background_compaction_scheduled);
        if !self.shutting_down.load(Ordering::Acquire) && state.bg_error.is_none() {
            if let Err(e) = self.background_compaction(&mut state) {
                if self.shutting_down.load(Ordering::Acquire) {
                    info!("ignoring compaction error during shutdown: {:#}", e);
                } else {
                    error!("background compaction failed: {:#}", e);
                    let kind = DbError::from_anyhow(&e);
                    self.record_background_error(&mut state, kind);
                }
            }
        }
        state.background_compaction_scheduled = false;
        // the previous run may have created enough garbage for another one.
        self.maybe_schedule_compaction(&mut state);
        self.background_work_finished.notify_all();
    }

    pub(crate) fn record_background_error(&self, state: &mut DbState, e: DbError) {
        if state.bg_error.is_none() {
            error!("background error is now sticky: {}", e);
            state.bg_error = Some(e);
            self.background_work_finished.notify_all();
        }
    }

    /// Remove runs no live version references: stale files on disk, stale
    /// skiplist instances in the PMEM pools. Disabled after a background
    /// error so an uncommitted edit cannot lose files it still needs.
    pub(crate) fn delete_obsolete_files(&self, state: &mut DbState) {
        if state.bg_error.is_some() {
            return;
        }
        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());

        let Ok(entries) = std::fs::read_dir(&self.path) else { return };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((number, ty)) = parse_file_name(name) else { continue };
            let keep = match ty {
                FileType::Log => number >= state.versions.log_number,
                FileType::Manifest => number >= state.versions.manifest_file_number,
                FileType::Table => live.contains(&number),
                FileType::Current | FileType::Lock => true,
            };
            if !keep {
                if ty == FileType::Table {
                    self.table_cache.evict(number);
                }
                info!("deleting obsolete {:?} {:06}", ty, number);
                if let Err(e) = std::fs::remove_file(self.path.join(name)) {
                    warn!("deleting {:06} failed: {}", number, e);
                }
            }
        }

        // compacted-away PMEM instances; outstanding iterators defer the
        // actual node free.
        for number in self.skiplists.instance_numbers() {
            if !live.contains(&number) {
                info!("deleting obsolete pmem run {:06}", number);
                if let Err(e) = self.skiplists.delete_file_with_check_ref(number) {
                    warn!("deleting pmem run {:06} failed: {:#}", number, e);
                }
            }
        }
    }

    /* ------------------- manual compaction ------------------- */

    pub(crate) fn compact_range(self: &Arc<Self>, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        // flush the memtable so its data participates.
        self.write_impl(false, None)?;
        {
            let mut state = self.state.lock();
            while state.imm.is_some() && state.bg_error.is_none() {
                self.background_work_finished.wait(&mut state);
            }
        }

        let max_level_with_files = {
            let state = self.state.lock();
            let version = state.versions.current();
            (1..NUM_LEVELS)
                .filter(|l| !version.overlapping_inputs(*l, begin, end).is_empty())
                .max()
                .unwrap_or(1)
        };

        for level in 0..max_level_with_files {
            let mut state = self.state.lock();
            if let Some(e) = &state.bg_error {
                return Err(e.clone().into());
            }
            state.manual_compaction = Some(ManualCompaction {
                level,
                begin: begin.map(|b| b.to_vec()),
                end: end.map(|e| e.to_vec()),
                done: false,
            });
            self.maybe_schedule_compaction(&mut state);
            while state
                .manual_compaction
                .as_ref()
                .map(|m| !m.done)
                .unwrap_or(false)
                && state.bg_error.is_none()
            {
                self.background_work_finished.wait(&mut state);
            }
            state.manual_compaction = None;
        }
        Ok(())
    }

    /* ------------------- properties ------------------- */

    pub(crate) fn get_property(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.num_level_files(level).to_string());
        }
        match name {
            "stats" => {
                let mut out = String::from(
                    "Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                let version = state.versions.current();
                for level in 0..NUM_LEVELS {
                    let stats = &state.stats[level];
                    if version.num_files(level) == 0 && stats.micros == 0 {
                        continue;
                    }
                    out.push_str(&format!(
                        "{:>5} {:>6} {:>8.2} {:>9.3} {:>8.2} {:>9.2}\n",
                        level,
                        version.num_files(level),
                        version.level_bytes(level) as f64 / 1048576.0,
                        stats.micros as f64 / 1e6,
                        stats.bytes_read as f64 / 1048576.0,
                        stats.bytes_written as f64 / 1048576.0,
                    ));
                }
                out.push_str(&format!(
                    "write-delays: {} us\npmem residents: {} / sst residents: {}\n",
                    state.total_delayed_micros,
                    state.tiering.skiplist_set_size(),
                    state.tiering.file_set_size(),
                ));
                Some(out)
            }
            "sstables" => {
                let version = state.versions.current();
                let mut out = String::new();
                for (level, files) in version.levels.iter().enumerate() {
                    if files.is_empty() {
                        continue;
                    }
                    out.push_str(&format!("--- level {} ---\n", level));
                    for f in files {
                        let tier = if state.tiering.is_in_skiplist_set(f.number) {
                            "pmem"
                        } else {
                            "sst"
                        };
                        out.push_str(&format!(
                            "{:06}({}): {} bytes [{:?} .. {:?}]\n",
                            f.number,
                            tier,
                            f.file_size,
                            f.smallest.key_ref(),
                            f.largest.key_ref(),
                        ));
                    }
                }
                Some(out)
            }
            "approximate-memory-usage" => {
                let mut total = state.mem.approximate_size();
                if let Some(imm) = &state.imm {
                    total += imm.approximate_size();
                }
                total += self.block_cache.weighted_size() as usize;
                Some(total.to_string())
            }
            _ => None,
        }
    }
}
