pub mod concat_iterator;
pub mod merge_iterator;
pub mod two_merge_iterator;

use crate::pmem::PmemPtr;

pub trait StorageIterator {
    // keys may borrow from the iterator itself.
    type KeyType<'a>: PartialEq + Eq + PartialOrd + Ord
    where
        Self: 'a;

    /// get the current value.
    fn value(&self) -> &[u8];
    /// get the current key
    fn key(&self) -> Self::KeyType<'_>;
    /// check if the current iterator is valid.
    fn is_valid(&self) -> bool;
    /// move to the next position
    fn next(&mut self) -> anyhow::Result<()>;
    /// number of underlying active sub-iterators for this iterator
    fn number_of_iterators(&self) -> usize {
        1
    }
}

/// Extra surface exposed by compaction input iterators: the hotness counter
/// of the current entry and, for PMEM-resident sources, its stable buffer
/// pointer (so hot entries can be relinked without re-encoding).
pub trait HotnessIterator: StorageIterator {
    fn ref_times(&self) -> u16 {
        0
    }

    fn buffer_ptr(&self) -> Option<PmemPtr> {
        None
    }
}
