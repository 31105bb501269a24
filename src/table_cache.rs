use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::filename::table_file_name;
use crate::key::KeySlice;
use crate::table::iterator::SsTableIterator;
use crate::table::{BlockCache, FileObject, SsTable};

/// Caches open SSTable handles by file number, evictable when a file is
/// deleted.
pub struct TableCache {
    db_path: PathBuf,
    cache: moka::sync::Cache<u64, Arc<SsTable>>,
    block_cache: Arc<BlockCache>,
}

impl TableCache {
    pub fn new(db_path: PathBuf, block_cache: Arc<BlockCache>, capacity: usize) -> Self {
        Self {
            db_path,
            cache: moka::sync::Cache::new(capacity as u64),
            block_cache,
        }
    }

    pub fn get_table(&self, number: u64) -> Result<Arc<SsTable>> {
        self.cache
            .try_get_with(number, || {
                let path = table_file_name(&self.db_path, number);
                let file = FileObject::open(&path)
                    .with_context(|| format!("fail to open table {:06}", number))?;
                Ok(SsTable::open(number, Some(self.block_cache.clone()), file)?.into())
            })
            .map_err(|e: Arc<anyhow::Error>| anyhow::anyhow!("{}", e))
    }

    pub fn new_iterator(&self, number: u64) -> Result<SsTableIterator> {
        let table = self.get_table(number)?;
        SsTableIterator::create_and_seek_to_first(table)
    }

    pub fn new_iterator_at(&self, number: u64, key: KeySlice) -> Result<SsTableIterator> {
        let table = self.get_table(number)?;
        SsTableIterator::create_and_seek_to_key(table, key)
    }

    /// Drop the cached handle for a deleted file.
    pub fn evict(&self, number: u64) {
        self.cache.invalidate(&number);
    }
}
