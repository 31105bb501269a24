use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::BufMut;

use super::{bloom::Bloom, BlockMeta, FileObject, SsTable};
use crate::block::builder::BlockBuilder;
use crate::key::{KeySlice, KeyVec};
use crate::table::BlockCache;

/// Builds an SsTable from key-value pairs added in sorted order.
pub struct SsTableBuilder {
    builder: BlockBuilder,
    block_size: usize,
    first_key: KeyVec,
    last_key: KeyVec,
    data: Vec<u8>,
    pub(crate) meta: Vec<BlockMeta>,
    key_hashes: Vec<u32>,
    /// bits per key; `None` disables the bloom filter.
    filter_bits_per_key: Option<f64>,
    max_seq: u64,
    num_entries: usize,
}

impl SsTableBuilder {
    pub fn new(block_size: usize, filter_bits_per_key: Option<f64>) -> Self {
        Self {
            builder: BlockBuilder::new(block_size),
            block_size,
            first_key: KeyVec::new(),
            last_key: KeyVec::new(),
            data: Vec::new(),
            meta: Vec::new(),
            key_hashes: Vec::new(),
            filter_bits_per_key,
            max_seq: 0,
            num_entries: 0,
        }
    }

    pub fn add(&mut self, key: KeySlice, value: &[u8]) {
        if self.first_key.is_empty() {
            self.first_key.set_from_slice(key);
        }
        self.max_seq = self.max_seq.max(key.seq());
        self.num_entries += 1;

        self.key_hashes.push(farmhash::fingerprint32(key.key_ref()));

        if self.builder.add(key, value) {
            self.last_key.set_from_slice(key);
            return;
        }

        self.finish_block();

        assert!(self.builder.add(key, value));
        self.first_key.set_from_slice(key);
        self.last_key.set_from_slice(key);
    }

    pub fn build(
        mut self,
        id: u64,
        block_cache: Option<Arc<BlockCache>>,
        path: impl AsRef<Path>,
    ) -> Result<SsTable> {
        assert!(self.num_entries > 0, "cannot build an empty table");
        self.finish_block();
        let mut buf = self.data;
        let meta_offset = buf.len();
        BlockMeta::encode_block_meta(&self.meta, self.max_seq, &mut buf);
        buf.put_u32(meta_offset as u32);
        let bloom = self.filter_bits_per_key.map(|bits| {
            let bits_per_key =
                Bloom::bloom_bits_per_key(self.key_hashes.len(), 0.01).min(bits as usize);
            Bloom::build_from_key_hashes(&self.key_hashes, bits_per_key)
        });
        let bloom_offset = buf.len();
        if let Some(bloom) = &bloom {
            bloom.encode(&mut buf);
        }
        buf.put_u32(bloom_offset as u32);
        let file = FileObject::create(path.as_ref(), buf)?;
        Ok(SsTable {
            id,
            file,
            first_key: self.meta.first().unwrap().first_key.clone(),
            last_key: self.meta.last().unwrap().last_key.clone(),
            block_meta: self.meta,
            block_meta_offset: meta_offset,
            block_cache,
            bloom,
            max_seq: self.max_seq,
        })
    }

    /// Estimated output size; metadata is small next to the data, so the
    /// data length stands in for the whole file.
    pub fn estimate_size(&self) -> usize {
        self.data.len()
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    fn finish_block(&mut self) {
        if self.builder.is_empty() {
            return;
        }
        let builder = std::mem::replace(
            &mut self.builder,
            BlockBuilder::new(self.block_size),
        );
        let encoded_block = builder.build().encode();
        self.meta.push(BlockMeta {
            offset: self.data.len(),
            first_key: std::mem::take(&mut self.first_key).into_key_bytes(),
            last_key: std::mem::take(&mut self.last_key).into_key_bytes(),
        });
        let checksum = crc32fast::hash(&encoded_block);
        self.data.extend(encoded_block);
        self.data.put_u32(checksum);
    }
}
