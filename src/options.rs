use std::sync::Arc;

use crate::table::BlockCache;

/// Number of LSM levels.
pub const NUM_LEVELS: usize = 7;

/// L0 file count that slows writers down by 1ms each.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// L0 file count that stops writers until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// L0 file count that triggers a size compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Deepest level a fresh memtable flush may be pushed to.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Forward pointers per PMEM skiplist node.
pub const SKIPLIST_LEVELS: usize = 12;

/// Nodes pre-allocated per skiplist manager.
pub const NUM_OF_PRE_ALLOC_NODE: usize = 58830;

/// Shard counts for the PMEM pools.
pub const NUM_OF_BUFFER: usize = 10;
pub const NUM_OF_SKIPLIST_MANAGER: usize = 10;

/// Where a freshly built sorted run materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SstType {
    /// Classic on-disk SSTable files.
    FileDescriptorSst,
    /// PMEM-resident sorted runs where tiering allows.
    PmemSst,
}

/// The in-PMEM index structure for PMEM-resident runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsType {
    Skiplist,
    Hashmap,
}

/// Policy dictating when a new sorted run goes to PMEM and when PMEM
/// residents are demoted to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieringOption {
    /// PMEM for output levels at or below `pmem_skiplist_level_threshold`.
    LeveledTiering,
    /// PMEM always; cold residents are demoted out-of-band.
    ColdDataTiering,
    /// PMEM unless any input already lives on disk; inline LRU eviction when
    /// the node pool runs dry.
    LruTiering,
    /// Disk only.
    NoTiering,
}

#[derive(Clone)]
pub struct Options {
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    /// When false, non-fatal WAL corruption is logged and skipped.
    pub paranoid_checks: bool,
    /// Memtable cap in bytes.
    pub write_buffer_size: usize,
    /// Table cache capacity is `max_open_files - 10`.
    pub max_open_files: usize,
    /// SST output cap in bytes.
    pub max_file_size: usize,
    pub block_size: usize,
    /// Shared block cache; a default one is created when `None`.
    pub block_cache: Option<Arc<BlockCache>>,
    /// Bloom filter bits per key; `None` disables the filter.
    pub filter_bits_per_key: Option<f64>,
    /// Reuse the last WAL and memtable on recovery instead of rotating.
    pub reuse_logs: bool,

    pub sst_type: SstType,
    pub ds_type: DsType,
    pub tiering_option: TieringOption,
    /// Route PMEM entries through the shared byte buffers.
    pub use_pmem_buffer: bool,
    /// Register PMEM iterators with the table cache for deferred cleanup.
    pub skiplist_cache: bool,

    /// Lookup-hit count at which an entry is routed to the hot output.
    pub hot_threshold: u16,
    /// Highest output level still eligible for PMEM under LeveledTiering.
    pub pmem_skiplist_level_threshold: usize,
    /// Nodes pre-allocated per skiplist manager (tests shrink this).
    pub pmem_node_capacity: usize,
    /// Entry count at which a PMEM output run is closed.
    pub max_skiplist_entries: usize,
    /// Byte capacity of each PMEM buffer pool.
    pub pmem_buffer_capacity: usize,
    /// Deterministic (insertion-ordinal) skiplist promotion instead of
    /// coin flips; reproduces identical layouts across runs.
    pub deterministic_skiplist: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 << 20,
            max_open_files: 1000,
            max_file_size: 2 << 20,
            block_size: 4096,
            block_cache: None,
            filter_bits_per_key: Some(10.0),
            reuse_logs: false,
            sst_type: SstType::FileDescriptorSst,
            ds_type: DsType::Skiplist,
            tiering_option: TieringOption::NoTiering,
            use_pmem_buffer: true,
            skiplist_cache: false,
            hot_threshold: 3,
            pmem_skiplist_level_threshold: 2,
            pmem_node_capacity: NUM_OF_PRE_ALLOC_NODE,
            max_skiplist_entries: 28300,
            pmem_buffer_capacity: 64 << 20,
            deterministic_skiplist: false,
        }
    }
}

impl Options {
    /// Small limits so tests exercise rotation and compaction quickly.
    #[cfg(test)]
    pub(crate) fn small_for_test() -> Self {
        Self {
            write_buffer_size: 4 << 10,
            max_file_size: 8 << 10,
            block_size: 512,
            pmem_node_capacity: 4096,
            max_skiplist_entries: 128,
            pmem_buffer_capacity: 1 << 20,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the WAL before acknowledging the write.
    pub sync: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Read at this snapshot sequence instead of the latest.
    pub snapshot: Option<u64>,
    pub verify_checksums: bool,
}
