use anyhow::Result;

use super::{HotnessIterator, StorageIterator};
use crate::key::KeySlice;

/// Concatenates iterators over runs whose key ranges are ordered and do not
/// overlap (levels >= 1), advancing run by run without a heap.
pub struct ConcatIterator<I: StorageIterator> {
    current: Option<I>,
    next_idx: usize,
    rest: Vec<Option<I>>,
}

impl<I: 'static + for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>> ConcatIterator<I> {
    pub fn create(iters: Vec<I>) -> Result<Self> {
        let mut iter = Self {
            current: None,
            next_idx: 0,
            rest: iters.into_iter().map(Some).collect(),
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    fn move_until_valid(&mut self) -> Result<()> {
        loop {
            if let Some(current) = self.current.as_ref() {
                if current.is_valid() {
                    break;
                }
            }
            if self.next_idx >= self.rest.len() {
                self.current = None;
                break;
            }
            self.current = self.rest[self.next_idx].take();
            self.next_idx += 1;
        }
        Ok(())
    }
}

impl<I: 'static + for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>> StorageIterator
    for ConcatIterator<I>
{
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.current.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().unwrap().value()
    }

    fn is_valid(&self) -> bool {
        self.current
            .as_ref()
            .map(|iter| iter.is_valid())
            .unwrap_or(false)
    }

    fn next(&mut self) -> Result<()> {
        if let Some(current) = self.current.as_mut() {
            current.next()?;
        }
        self.move_until_valid()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        1
    }
}

impl<I: 'static + for<'a> HotnessIterator<KeyType<'a> = KeySlice<'a>>> HotnessIterator
    for ConcatIterator<I>
{
    fn ref_times(&self) -> u16 {
        self.current.as_ref().map(|i| i.ref_times()).unwrap_or(0)
    }

    fn buffer_ptr(&self) -> Option<crate::pmem::PmemPtr> {
        self.current.as_ref().and_then(|i| i.buffer_ptr())
    }
}
