use bytes::{Buf, BufMut, Bytes};

pub mod builder;
pub mod iterator;

pub(crate) const SIZEOF_U16: usize = std::mem::size_of::<u16>();

/// One data block: prefix-compressed entries followed by a u16 offset table
/// and the entry count.
pub struct Block {
    pub(crate) data: Vec<u8>,
    pub(crate) offsets: Vec<u16>,
}

impl Block {
    pub fn encode(&self) -> Bytes {
        let mut buf = self.data.clone();
        let offsets_len = self.offsets.len();
        for offset in &self.offsets {
            buf.put_u16(*offset);
        }
        buf.put_u16(offsets_len as u16);
        buf.into()
    }

    pub fn decode(data: &[u8]) -> Self {
        let entry_offsets_len = (&data[data.len() - SIZEOF_U16..]).get_u16() as usize;
        let data_end = data.len() - SIZEOF_U16 - entry_offsets_len * SIZEOF_U16;
        let offsets_raw = &data[data_end..data.len() - SIZEOF_U16];
        let offsets = offsets_raw
            .chunks(SIZEOF_U16)
            .map(|mut x| x.get_u16())
            .collect();
        let data = data[0..data_end].to_vec();
        Self { data, offsets }
    }
}

#[cfg(test)]
mod tests {
    use super::builder::BlockBuilder;
    use super::iterator::BlockIterator;
    use super::*;
    use crate::iterators::StorageIterator;
    use crate::key::{KeyVec, ValueType};
    use std::sync::Arc;

    fn key(user: &[u8], seq: u64) -> KeyVec {
        KeyVec::from_parts(user, seq, ValueType::Value)
    }

    #[test]
    fn test_block_encode_decode() {
        let mut builder = BlockBuilder::new(4096);
        for i in 0..10u32 {
            let k = key(format!("key{:03}", i).as_bytes(), 1);
            assert!(builder.add(k.as_key_slice(), b"value"));
        }
        let block = builder.build();
        let decoded = Block::decode(&block.encode());
        assert_eq!(decoded.offsets, block.offsets);
        assert_eq!(decoded.data, block.data);
    }

    #[test]
    fn test_block_iterator_seek() {
        let mut builder = BlockBuilder::new(4096);
        for i in (0..20u32).step_by(2) {
            let k = key(format!("key{:03}", i).as_bytes(), 1);
            assert!(builder.add(k.as_key_slice(), format!("v{}", i).as_bytes()));
        }
        let block = Arc::new(builder.build());

        let mut iter = BlockIterator::create_and_seek_to_first(block.clone());
        assert!(iter.is_valid());
        assert_eq!(iter.key().key_ref(), b"key000");

        // exact hit
        iter.seek_to_key(key(b"key004", 1).as_key_slice());
        assert_eq!(iter.key().key_ref(), b"key004");
        // between entries lands on the next one
        iter.seek_to_key(key(b"key005", 1).as_key_slice());
        assert_eq!(iter.key().key_ref(), b"key006");
        // past the end invalidates
        iter.seek_to_key(key(b"key099", 1).as_key_slice());
        assert!(!iter.is_valid());
    }
}
