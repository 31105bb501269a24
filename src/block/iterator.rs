use bytes::Buf;

use crate::key::{KeySlice, KeyVec};
use std::sync::Arc;

use super::{Block, SIZEOF_U16};

pub struct BlockIterator {
    // reference to the block
    block: Arc<Block>,
    // the current key at the iterator position
    key: KeyVec,
    // the first key in the block, needed to undo prefix compression
    first_key: KeyVec,
    // the value range within the block data
    value_range: (usize, usize),
    // the current entry index
    idx: usize,
}

impl Block {
    fn get_first_key(&self) -> KeyVec {
        let mut buf = &self.data[..];
        buf.get_u16();
        let key_len = buf.get_u16();
        let key = &buf[..key_len as usize];
        KeyVec::from_vec(key.to_vec())
    }
}

impl BlockIterator {
    fn new(block: Arc<Block>) -> Self {
        Self {
            first_key: block.get_first_key(),
            key: KeyVec::new(),
            block,
            value_range: (0, 0),
            idx: 0,
        }
    }

    pub fn create_and_seek_to_first(block: Arc<Block>) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_first();
        iter
    }

    pub fn create_and_seek_to_key(block: Arc<Block>, key: KeySlice) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_key(key);
        iter
    }

    pub fn key(&self) -> KeySlice {
        self.key.as_key_slice()
    }

    pub fn value(&self) -> &[u8] {
        &self.block.data[self.value_range.0..self.value_range.1]
    }

    pub fn is_valid(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn seek_to_first(&mut self) {
        self.seek_to(0);
    }

    fn seek_to(&mut self, idx: usize) {
        if idx >= self.block.offsets.len() {
            self.key.clear();
            self.value_range = (0, 0);
            return;
        }
        let offset = self.block.offsets[idx] as usize;
        self.seek_to_offset(offset);
        self.idx = idx;
    }

    fn seek_to_offset(&mut self, offset: usize) {
        let mut entry = &self.block.data[offset..];
        let prefix_len = entry.get_u16() as usize;
        let rest_len = entry.get_u16() as usize;
        self.key.clear();
        let mut raw = Vec::with_capacity(prefix_len + rest_len);
        raw.extend_from_slice(&self.first_key.raw_ref()[..prefix_len]);
        raw.extend_from_slice(&entry[..rest_len]);
        self.key = KeyVec::from_vec(raw);
        entry.advance(rest_len);
        let value_len = entry.get_u16() as usize;
        let value_start = offset + SIZEOF_U16 * 3 + rest_len;
        self.value_range = (value_start, value_start + value_len);
    }

    /// Seek to the first entry >= `key` (internal-key order); invalid when
    /// every entry is smaller.
    pub fn seek_to_key(&mut self, key: KeySlice) {
        let mut low = 0;
        let mut high = self.block.offsets.len();
        while low < high {
            let mid = low + (high - low) / 2;
            self.seek_to(mid);
            debug_assert!(self.is_valid());
            if self.key() < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        self.seek_to(low);
    }

    pub fn next(&mut self) {
        self.seek_to(self.idx + 1);
    }
}
