use std::ops::Bound;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::iterators::concat_iterator::ConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::{HotnessIterator, StorageIterator};
use crate::key::{KeySlice, ValueType};
use crate::mem_table::MemTableIterator;
use crate::pmem::iterator::PmemIterator;
use crate::pmem::PmemPtr;
use crate::table::iterator::SsTableIterator;

/// An iterator over one sorted run, whichever tier it lives on.
pub enum RunIterator {
    Sst(SsTableIterator),
    Pmem(PmemIterator),
}

impl StorageIterator for RunIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        match self {
            RunIterator::Sst(iter) => iter.key(),
            RunIterator::Pmem(iter) => iter.key(),
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            RunIterator::Sst(iter) => iter.value(),
            RunIterator::Pmem(iter) => iter.value(),
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            RunIterator::Sst(iter) => iter.is_valid(),
            RunIterator::Pmem(iter) => iter.is_valid(),
        }
    }

    fn next(&mut self) -> Result<()> {
        match self {
            RunIterator::Sst(iter) => iter.next(),
            RunIterator::Pmem(iter) => iter.next(),
        }
    }
}

impl HotnessIterator for RunIterator {
    fn ref_times(&self) -> u16 {
        match self {
            // entries sourced from disk carry no hotness history.
            RunIterator::Sst(_) => 0,
            RunIterator::Pmem(iter) => iter.ref_times(),
        }
    }

    fn buffer_ptr(&self) -> Option<PmemPtr> {
        match self {
            RunIterator::Sst(_) => None,
            RunIterator::Pmem(iter) => iter.buffer_ptr(),
        }
    }
}

/// The full read stack: memtables, then level-0 runs, then the deeper
/// levels concatenated.
pub(crate) type LsmIteratorInner = TwoMergeIterator<
    TwoMergeIterator<MergeIterator<MemTableIterator>, MergeIterator<RunIterator>>,
    MergeIterator<ConcatIterator<RunIterator>>,
>;

/// User-facing iterator: collapses versions to the one visible at
/// `read_seq`, hides tombstones, and honors the range end bound.
pub struct LsmIterator {
    inner: LsmIteratorInner,
    end_bound: Bound<Bytes>,
    read_seq: u64,
    is_valid: bool,
    prev_key: Vec<u8>,
}

impl LsmIterator {
    pub(crate) fn new(
        inner: LsmIteratorInner,
        end_bound: Bound<Bytes>,
        read_seq: u64,
    ) -> Result<Self> {
        let mut iter = Self {
            is_valid: inner.is_valid(),
            inner,
            end_bound,
            read_seq,
            prev_key: Vec::new(),
        };
        if iter.is_valid {
            iter.check_bound();
        }
        iter.move_to_visible()?;
        Ok(iter)
    }

    fn next_inner(&mut self) -> Result<()> {
        self.inner.next()?;
        if !self.inner.is_valid() {
            self.is_valid = false;
            return Ok(());
        }
        self.check_bound();
        Ok(())
    }

    fn check_bound(&mut self) {
        match self.end_bound.as_ref() {
            Bound::Unbounded => {}
            Bound::Included(key) => {
                self.is_valid = self.inner.key().key_ref() <= key.as_ref()
            }
            Bound::Excluded(key) => self.is_valid = self.inner.key().key_ref() < key.as_ref(),
        }
    }

    /// Advance until the cursor rests on the newest visible non-tombstone
    /// version of a user key not yet emitted.
    fn move_to_visible(&mut self) -> Result<()> {
        loop {
            if !self.is_valid {
                return Ok(());
            }
            let seq = self.inner.key().seq();
            // versions above the read sequence are invisible.
            if seq > self.read_seq {
                self.next_inner()?;
                continue;
            }
            // older versions of an already-emitted (or skipped) user key.
            if self.inner.key().key_ref() == &self.prev_key[..] {
                self.next_inner()?;
                continue;
            }
            self.prev_key.clear();
            let key = self.inner.key();
            self.prev_key.extend_from_slice(key.key_ref());
            if key.value_type() == ValueType::Deletion {
                self.next_inner()?;
                continue;
            }
            return Ok(());
        }
    }
}

impl StorageIterator for LsmIterator {
    type KeyType<'a> = &'a [u8];

    fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn key(&self) -> &[u8] {
        self.inner.key().into_user_key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn next(&mut self) -> Result<()> {
        self.next_inner()?;
        self.move_to_visible()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.inner.number_of_iterators()
    }
}

/// Wraps an iterator so that use after an error or past the end is caught
/// instead of producing garbage.
pub struct FusedIterator<I: StorageIterator> {
    iter: I,
    has_error: bool,
}

impl<I: StorageIterator> FusedIterator<I> {
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            has_error: false,
        }
    }
}

impl<I: StorageIterator> StorageIterator for FusedIterator<I> {
    type KeyType<'a> = I::KeyType<'a> where Self: 'a;

    fn is_valid(&self) -> bool {
        !self.has_error && self.iter.is_valid()
    }

    fn key(&self) -> Self::KeyType<'_> {
        assert!(self.is_valid(), "invalid access to the iterator");
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.is_valid(), "invalid access to the iterator");
        self.iter.value()
    }

    fn next(&mut self) -> Result<()> {
        if self.has_error {
            bail!("the iterator is tainted");
        }
        if self.iter.is_valid() {
            if let Err(e) = self.iter.next() {
                self.has_error = true;
                return Err(e);
            }
        }
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.iter.number_of_iterators()
    }
}
