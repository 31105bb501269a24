use anyhow::Result;

use super::{HotnessIterator, StorageIterator};
use crate::key::KeySlice;

/// Merges two iterators of different types; `a` wins ties (it holds the
/// newer data).
pub struct TwoMergeIterator<A: StorageIterator, B: StorageIterator> {
    a: A,
    b: B,
    choose_a: bool,
}

impl<
        A: 'static + for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
        B: 'static + for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
    > TwoMergeIterator<A, B>
{
    fn choose_a(a: &A, b: &B) -> bool {
        if !a.is_valid() {
            return false;
        }
        if !b.is_valid() {
            return true;
        }
        a.key() < b.key()
    }

    fn skip_b(&mut self) -> Result<()> {
        if self.a.is_valid() && self.b.is_valid() && self.b.key() == self.a.key() {
            self.b.next()?;
        }
        Ok(())
    }

    pub fn create(a: A, b: B) -> Result<Self> {
        let mut iter = Self {
            a,
            b,
            choose_a: false,
        };
        iter.skip_b()?;
        iter.choose_a = Self::choose_a(&iter.a, &iter.b);
        Ok(iter)
    }
}

impl<
        A: 'static + for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
        B: 'static + for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
    > StorageIterator for TwoMergeIterator<A, B>
{
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        if self.choose_a {
            self.a.key()
        } else {
            self.b.key()
        }
    }

    fn value(&self) -> &[u8] {
        if self.choose_a {
            self.a.value()
        } else {
            self.b.value()
        }
    }

    fn is_valid(&self) -> bool {
        if self.choose_a {
            self.a.is_valid()
        } else {
            self.b.is_valid()
        }
    }

    fn next(&mut self) -> Result<()> {
        if self.choose_a {
            self.a.next()?;
        } else {
            self.b.next()?;
        }
        self.skip_b()?;
        self.choose_a = Self::choose_a(&self.a, &self.b);
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        self.a.number_of_iterators() + self.b.number_of_iterators()
    }
}

impl<
        A: 'static + for<'a> HotnessIterator<KeyType<'a> = KeySlice<'a>>,
        B: 'static + for<'a> HotnessIterator<KeyType<'a> = KeySlice<'a>>,
    > HotnessIterator for TwoMergeIterator<A, B>
{
    fn ref_times(&self) -> u16 {
        if self.choose_a {
            self.a.ref_times()
        } else {
            self.b.ref_times()
        }
    }

    fn buffer_ptr(&self) -> Option<crate::pmem::PmemPtr> {
        if self.choose_a {
            self.a.buffer_ptr()
        } else {
            self.b.buffer_ptr()
        }
    }
}
