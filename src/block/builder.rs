use bytes::BufMut;

use super::Block;
use super::SIZEOF_U16;
use crate::key::{KeySlice, KeyVec};

/// Builds a block
pub struct BlockBuilder {
    /// all serialized key-value entries in the block.
    data: Vec<u8>,
    /// offsets of each entry
    offsets: Vec<u16>,
    /// target block size
    block_size: usize,
    /// the first key in the block; entries are prefix-compressed against it
    first_key: KeyVec,
}

fn common_prefix(first_key: KeySlice, key: KeySlice) -> usize {
    let mut i = 0;
    loop {
        if i >= first_key.raw_len() || i >= key.raw_len() {
            break;
        }
        if first_key.raw_ref()[i] != key.raw_ref()[i] {
            break;
        }
        i += 1;
    }
    i
}

impl BlockBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            data: Vec::new(),
            offsets: Vec::new(),
            block_size,
            first_key: KeyVec::new(),
        }
    }

    fn estimated_size(&self) -> usize {
        self.data.len() + self.offsets.len() * SIZEOF_U16 + SIZEOF_U16
    }

    /// Adds an entry to the block; returns false when the block is full.
    #[must_use]
    pub fn add(&mut self, key: KeySlice, value: &[u8]) -> bool {
        assert!(!key.is_empty(), "key must not be empty");
        let add_on = key.raw_len() + value.len() + SIZEOF_U16 * 3;
        let size_expect = self.estimated_size() + add_on;
        if size_expect > self.block_size && !self.is_empty() {
            return false;
        }

        self.offsets.push(self.data.len() as u16);

        // entry: prefix_len | rest_len | rest_of_key | value_len | value
        let prefix = common_prefix(self.first_key.as_key_slice(), key);
        self.data.put_u16(prefix as u16);
        self.data.put_u16((key.raw_len() - prefix) as u16);
        self.data.put(&key.raw_ref()[prefix..]);
        self.data.put_u16(value.len() as u16);
        self.data.put(value);

        if self.first_key.is_empty() {
            self.first_key = key.to_key_vec();
        }

        true
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn build(self) -> Block {
        if self.is_empty() {
            panic!("block should not be empty!")
        }
        Block {
            data: self.data,
            offsets: self.offsets,
        }
    }
}
