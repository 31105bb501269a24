use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::error::DbError;

use crate::iterators::{HotnessIterator, StorageIterator};
use crate::key::{KeyBytes, KeySlice};
use crate::pmem::skiplist::{Oid, PmemSkiplists};
use crate::pmem::PmemPtr;

/// Cursor over a single PMEM skiplist instance.
///
/// The decoded key and value of the current node are cached per position so
/// `key()`/`value()` hand out borrowed slices. The iterator holds an
/// instance reference that blocks `delete_file_with_check_ref` until it is
/// released, and carries cleanup callbacks for the `skiplist_cache` sharing
/// path.
pub struct PmemIterator {
    lists: Arc<PmemSkiplists>,
    number: u64,
    current: Option<Oid>,
    key: KeyBytes,
    value: Bytes,
    buffer_ptr: PmemPtr,
    ref_times: u16,
    cleanups: Vec<Box<dyn FnOnce() + Send>>,
    released: bool,
}

impl PmemIterator {
    pub fn create_and_seek_to_first(lists: Arc<PmemSkiplists>, number: u64) -> Result<Self> {
        if !lists.iter_acquire(number) {
            bail!(DbError::InvalidArgument(format!(
                "no skiplist instance {}",
                number
            )));
        }
        let mut iter = Self {
            current: lists.first(number),
            lists,
            number,
            key: KeyBytes::new(),
            value: Bytes::new(),
            buffer_ptr: PmemPtr::NULL,
            ref_times: 0,
            cleanups: Vec::new(),
            released: false,
        };
        iter.load_current();
        Ok(iter)
    }

    /// Seek to the first node whose internal key is >= `target`.
    pub fn create_and_seek_to_key(
        lists: Arc<PmemSkiplists>,
        number: u64,
        target: KeySlice,
    ) -> Result<Self> {
        if !lists.iter_acquire(number) {
            bail!(DbError::InvalidArgument(format!(
                "no skiplist instance {}",
                number
            )));
        }
        let start = match lists.get_prev(number, target.key_ref()) {
            Some(prev) => lists.next(number, prev),
            None => lists.first(number),
        };
        let mut iter = Self {
            current: start,
            lists,
            number,
            key: KeyBytes::new(),
            value: Bytes::new(),
            buffer_ptr: PmemPtr::NULL,
            ref_times: 0,
            cleanups: Vec::new(),
            released: false,
        };
        iter.load_current();
        // versions of the same user key newer than the target still sort
        // before it; skip them.
        while iter.is_valid() && iter.key() < target {
            iter.advance()?;
        }
        Ok(iter)
    }

    fn load_current(&mut self) {
        match self.current {
            Some(oid) => {
                let entry = self.lists.node_entry(self.number, oid);
                let (key, value) = self.lists.buffers().read_entry(entry);
                self.key = KeyBytes::from_bytes(key);
                self.value = value;
                self.buffer_ptr = entry;
                self.ref_times = self.lists.node_ref_times(self.number, oid);
            }
            None => {
                self.key = KeyBytes::new();
                self.value = Bytes::new();
                self.buffer_ptr = PmemPtr::NULL;
                self.ref_times = 0;
            }
        }
    }

    fn advance(&mut self) -> Result<()> {
        if let Some(oid) = self.current {
            self.current = self.lists.next(self.number, oid);
            self.load_current();
        }
        Ok(())
    }

    pub fn file_number(&self) -> u64 {
        self.number
    }

    /// Stable pointer to the current entry's bytes in the buffer pool.
    pub fn current_buffer_ptr(&self) -> PmemPtr {
        self.buffer_ptr
    }

    pub fn current_ref_times(&self) -> u16 {
        self.ref_times
    }

    /// Defer work (for example a table-cache release) to cleanup time.
    pub fn add_cleanup(&mut self, f: Box<dyn FnOnce() + Send>) {
        self.cleanups.push(f);
    }

    /// Drop the instance reference and run the registered callbacks; a
    /// pending `delete_file_with_check_ref` free proceeds once the last
    /// reference is gone.
    pub fn run_cleanup(&mut self) {
        if !self.released {
            self.released = true;
            self.current = None;
            self.lists.iter_release(self.number);
        }
        for f in self.cleanups.drain(..) {
            f();
        }
    }
}

impl Drop for PmemIterator {
    fn drop(&mut self) {
        self.run_cleanup();
    }
}

impl StorageIterator for PmemIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.key.as_key_slice()
    }

    fn value(&self) -> &[u8] {
        &self.value
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> Result<()> {
        self.advance()
    }
}

impl HotnessIterator for PmemIterator {
    fn ref_times(&self) -> u16 {
        self.ref_times
    }

    fn buffer_ptr(&self) -> Option<PmemPtr> {
        if self.buffer_ptr.is_null() {
            None
        } else {
            Some(self.buffer_ptr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyVec, ValueType};
    use crate::pmem::buffer::PmemBuffers;
    use tempfile::tempdir;

    fn build_run(dir: &std::path::Path, number: u64, keys: &[(&str, u64, &str)]) -> Arc<PmemSkiplists> {
        let buffers = Arc::new(PmemBuffers::open(dir, 2, 1 << 20).unwrap());
        let lists =
            Arc::new(PmemSkiplists::open(dir, 2, 1024, 16, false, buffers.clone()).unwrap());
        lists.create_instance(number).unwrap();
        for (k, seq, v) in keys {
            let ikey = KeyVec::from_parts(k.as_bytes(), *seq, ValueType::Value);
            let ptr = buffers
                .append(buffers.pool_for(number), ikey.raw_ref(), v.as_bytes())
                .unwrap();
            lists
                .insert_by_ptr(number, ikey.raw_ref(), ptr, 0)
                .unwrap();
        }
        lists.insert_null_terminator(number).unwrap();
        lists
    }

    #[test]
    fn test_iterates_in_order() {
        let dir = tempdir().unwrap();
        let lists = build_run(
            dir.path(),
            5,
            &[("b", 2, "vb"), ("a", 3, "va"), ("c", 1, "vc")],
        );
        let mut iter = PmemIterator::create_and_seek_to_first(lists, 5).unwrap();
        let mut seen = Vec::new();
        while iter.is_valid() {
            seen.push((
                iter.key().key_ref().to_vec(),
                iter.value().to_vec(),
            ));
            iter.next().unwrap();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"va".to_vec()),
                (b"b".to_vec(), b"vb".to_vec()),
                (b"c".to_vec(), b"vc".to_vec()),
            ]
        );
    }

    #[test]
    fn test_seek_to_key() {
        let dir = tempdir().unwrap();
        let lists = build_run(
            dir.path(),
            5,
            &[("a", 1, "va"), ("c", 1, "vc"), ("e", 1, "ve")],
        );
        let target = KeyVec::for_lookup(b"b", u64::MAX >> 8);
        let iter =
            PmemIterator::create_and_seek_to_key(lists, 5, target.as_key_slice()).unwrap();
        assert!(iter.is_valid());
        assert_eq!(iter.key().key_ref(), b"c");
    }

    #[test]
    fn test_cleanup_releases_instance_ref() {
        let dir = tempdir().unwrap();
        let lists = build_run(dir.path(), 5, &[("a", 1, "va")]);
        let iter = PmemIterator::create_and_seek_to_first(lists.clone(), 5).unwrap();
        lists.delete_file_with_check_ref(5).unwrap();
        assert!(lists.contains_instance(5));
        drop(iter);
        assert!(!lists.contains_instance(5));
    }
}
