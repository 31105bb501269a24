// a sorted in-memory run, based on crossbeam-skiplist.
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;
use ouroboros::self_referencing;

use crate::iterators::StorageIterator;
use crate::key::{KeyBytes, KeySlice, KeyVec, ValueType, TAG_LEN};

/// Create a bound of `KeyBytes` from a bound of `KeySlice`.
pub(crate) fn map_key_bound(bound: Bound<KeySlice>) -> Bound<KeyBytes> {
    match bound {
        Bound::Included(x) => {
            Bound::Included(KeyBytes::from_bytes(Bytes::copy_from_slice(x.raw_ref())))
        }
        Bound::Excluded(x) => {
            Bound::Excluded(KeyBytes::from_bytes(Bytes::copy_from_slice(x.raw_ref())))
        }
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Upper user-key bound mapped into internal-key space.
pub(crate) fn map_upper_user_bound(bound: Bound<&[u8]>) -> Bound<KeyVec> {
    match bound {
        Bound::Included(x) => Bound::Included(KeyVec::from_parts(x, 0, ValueType::Deletion)),
        // the lookup key sorts before every real version of x.
        Bound::Excluded(x) => Bound::Excluded(KeyVec::for_lookup(x, crate::key::MAX_SEQUENCE)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// The mutable ordered map receiving new writes, keyed by internal key.
pub struct MemTable {
    pub(crate) map: Arc<SkipMap<KeyBytes, Bytes>>,
    id: u64,
    approximate_size: Arc<AtomicUsize>,
}

impl MemTable {
    /// `id` is the WAL file number this memtable's writes land in.
    pub fn create(id: u64) -> Self {
        Self {
            id,
            map: Arc::new(SkipMap::new()),
            approximate_size: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Insert one record under its assigned sequence number.
    pub fn add(&self, seq: u64, ty: ValueType, key: &[u8], value: &[u8]) -> Result<()> {
        let internal = KeyVec::from_parts(key, seq, ty);
        let estimated_size = internal.raw_len() + value.len();
        self.map
            .insert(internal.into_key_bytes(), Bytes::copy_from_slice(value));
        self.approximate_size
            .fetch_add(estimated_size, Ordering::Relaxed);
        Ok(())
    }

    /// Newest record for `key` visible at `seq`.
    ///
    /// `None` means this memtable knows nothing; `Some(None)` means the
    /// newest visible record is a tombstone.
    pub fn get(&self, key: &[u8], seq: u64) -> Option<Option<Bytes>> {
        let lookup = KeyVec::for_lookup(key, seq).into_key_bytes();
        let entry = self.map.range((Bound::Included(lookup), Bound::Unbounded)).next()?;
        if entry.key().key_ref() != key {
            return None;
        }
        match entry.key().value_type() {
            ValueType::Value => Some(Some(entry.value().clone())),
            ValueType::Deletion => Some(None),
        }
    }

    pub fn scan(&self, lower: Bound<KeySlice>, upper: Bound<KeySlice>) -> MemTableIterator {
        let (lower, upper) = (map_key_bound(lower), map_key_bound(upper));
        let mut iter = MemTableIteratorBuilder {
            map: self.map.clone(),
            iter_builder: |map| map.range((lower, upper)),
            item: (KeyBytes::new(), Bytes::new()),
        }
        .build();
        iter.with_mut(|x| *x.item = MemTableIterator::entry_to_item(x.iter.next()));
        iter
    }

    /// Full-range iterator, used when flushing to a level-0 run.
    pub fn iter(&self) -> MemTableIterator {
        self.scan(Bound::Unbounded, Bound::Unbounded)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Largest sequence present; 0 for an empty table.
    pub fn max_seq(&self) -> u64 {
        self.map.iter().map(|e| e.key().seq()).max().unwrap_or(0)
    }
}

type SkipMapRangeIter<'a> = crossbeam_skiplist::map::Range<
    'a,
    KeyBytes,
    (Bound<KeyBytes>, Bound<KeyBytes>),
    KeyBytes,
    Bytes,
>;

// self-referential: the range iterator borrows the map held alongside it.
#[self_referencing]
pub struct MemTableIterator {
    map: Arc<SkipMap<KeyBytes, Bytes>>,

    #[borrows(map)]
    #[not_covariant]
    iter: SkipMapRangeIter<'this>,
    // current key-value pair under the cursor.
    item: (KeyBytes, Bytes),
}

impl MemTableIterator {
    fn entry_to_item(entry: Option<Entry<'_, KeyBytes, Bytes>>) -> (KeyBytes, Bytes) {
        entry
            .map(|x| (x.key().clone(), x.value().clone()))
            .unwrap_or_else(|| (KeyBytes::new(), Bytes::new()))
    }
}

impl StorageIterator for MemTableIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.borrow_item().0.as_key_slice()
    }

    fn value(&self) -> &[u8] {
        &self.borrow_item().1[..]
    }

    fn is_valid(&self) -> bool {
        self.borrow_item().0.raw_len() >= TAG_LEN && !self.borrow_item().0.is_empty()
    }

    fn next(&mut self) -> Result<()> {
        let entry = self.with_iter_mut(|iter| MemTableIterator::entry_to_item(iter.next()));
        self.with_mut(|x| *x.item = entry);
        Ok(())
    }
}
