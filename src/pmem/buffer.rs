use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bytes::{Buf, Bytes};
use integer_encoding::VarInt;
use parking_lot::RwLock;

use crate::error::DbError;
use crate::pmem::PmemPtr;

/// One append-only byte region. Entries are
/// `varint(klen) | key | varint(vlen) | value`; the key bytes include the
/// internal-key tag. The pool is a pure bump allocator: no ordering, no
/// index, no per-entry free.
struct BufferPool {
    data: Vec<u8>,
    /// Bytes already persisted to the pool file.
    flushed: usize,
}

/// The sharded buffer tier. Runs are assigned a pool by
/// `file_number % num_pools`, which bounds fragmentation and lets distinct
/// compactions append in parallel.
pub struct PmemBuffers {
    pools: Vec<RwLock<BufferPool>>,
    dir: PathBuf,
    capacity: usize,
}

impl PmemBuffers {
    /// Open the buffer pools under `dir`, reloading any existing pool files.
    pub fn open(dir: impl AsRef<Path>, num_pools: usize, capacity: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("fail to create pmem dir")?;
        let mut pools = Vec::with_capacity(num_pools);
        for id in 0..num_pools {
            let path = Self::pool_path(&dir, id as u32);
            let data = if path.exists() {
                fs::read(&path).with_context(|| format!("fail to reload pmem buffer {}", id))?
            } else {
                Vec::new()
            };
            let flushed = data.len();
            pools.push(RwLock::new(BufferPool { data, flushed }));
        }
        Ok(Self {
            pools,
            dir,
            capacity,
        })
    }

    fn pool_path(dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("buffer-{}.pool", id))
    }

    /// Shard assignment: runs spread over the pools by file number, which
    /// bounds fragmentation and lets distinct compactions append in
    /// parallel.
    pub fn pool_for(&self, file_number: u64) -> u32 {
        (file_number % self.pools.len() as u64) as u32
    }

    /// Append one encoded entry; the returned pointer is stable until
    /// `clear_all`.
    pub fn append(&self, pool_id: u32, key: &[u8], value: &[u8]) -> Result<PmemPtr> {
        let mut pool = self.pools[pool_id as usize].write();
        let entry_len = (key.len() as u32).required_space()
            + key.len()
            + (value.len() as u32).required_space()
            + value.len();
        if pool.data.len() + entry_len > self.capacity {
            bail!(DbError::Io(format!(
                "pmem buffer pool {} exhausted ({} bytes)",
                pool_id, self.capacity
            )));
        }
        let offset = pool.data.len() as u32;
        pool.data.extend_from_slice(&(key.len() as u32).encode_var_vec());
        pool.data.extend_from_slice(key);
        pool.data.extend_from_slice(&(value.len() as u32).encode_var_vec());
        pool.data.extend_from_slice(value);
        Ok(PmemPtr {
            pool: pool_id,
            offset,
        })
    }

    /// Decode the entry at `ptr` into (internal key, value).
    pub fn read_entry(&self, ptr: PmemPtr) -> (Bytes, Bytes) {
        debug_assert!((ptr.pool as usize) < self.pools.len(), "bad pmem pool id");
        let pool = self.pools[ptr.pool as usize].read();
        let buf = &pool.data[ptr.offset as usize..];
        let (klen, n) = u32::decode_var(buf).expect("corrupt pmem entry");
        let key = Bytes::copy_from_slice(&buf[n..n + klen as usize]);
        let mut rest = &buf[n + klen as usize..];
        let (vlen, m) = u32::decode_var(rest).expect("corrupt pmem entry");
        rest.advance(m);
        let value = Bytes::copy_from_slice(&rest[..vlen as usize]);
        (key, value)
    }

    /// Decode only the internal key at `ptr`.
    pub fn read_key(&self, ptr: PmemPtr) -> Bytes {
        debug_assert!((ptr.pool as usize) < self.pools.len(), "bad pmem pool id");
        let pool = self.pools[ptr.pool as usize].read();
        let buf = &pool.data[ptr.offset as usize..];
        let (klen, n) = u32::decode_var(buf).expect("corrupt pmem entry");
        Bytes::copy_from_slice(&buf[n..n + klen as usize])
    }

    /// Persist the unflushed tail of one pool to its file.
    pub fn flush(&self, pool_id: u32) -> Result<()> {
        let mut pool = self.pools[pool_id as usize].write();
        if pool.data.len() == pool.flushed && pool.flushed > 0 {
            return Ok(());
        }
        let path = Self::pool_path(&self.dir, pool_id);
        fs::write(&path, &pool.data)
            .with_context(|| format!("fail to flush pmem buffer {}", pool_id))?;
        pool.flushed = pool.data.len();
        Ok(())
    }

    /// Drop the whole generation: every pool resets to empty and all
    /// previously returned pointers become invalid.
    pub fn clear_all(&self) -> Result<()> {
        for (id, pool) in self.pools.iter().enumerate() {
            let mut pool = pool.write();
            pool.data.clear();
            pool.flushed = 0;
            let path = Self::pool_path(&self.dir, id as u32);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    pub fn used_bytes(&self, pool_id: u32) -> usize {
        self.pools[pool_id as usize].read().data.len()
    }
}
