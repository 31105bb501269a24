//! tierdb: an LSM key-value storage engine with a two-tier run hierarchy.
//!
//! Sorted runs live either in emulated persistent memory (a skiplist index
//! over a shared byte buffer) or on disk as SSTables. The compaction engine
//! decides per output where a run materializes, and routes frequently read
//! entries into a separate hot output that is written back to level 0.

pub mod batch;
pub mod block;
pub mod compact;
pub mod db;
pub mod error;
pub mod filename;
pub mod iterators;
pub mod key;
pub mod lsm_iterator;
pub mod manifest;
pub mod mem_table;
pub mod options;
pub mod pmem;
pub mod snapshot;
pub mod table;
pub mod table_cache;
pub mod tiering;
pub mod version;
pub mod version_set;
pub mod wal;

#[cfg(test)]
mod tests;

pub use batch::WriteBatch;
pub use db::{Db, Snapshot};
pub use error::DbError;
pub use iterators::StorageIterator;
pub use options::{DsType, Options, ReadOptions, SstType, TieringOption, WriteOptions};
