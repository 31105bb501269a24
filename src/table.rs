pub(crate) mod bloom;
pub(crate) mod builder;
pub mod iterator;

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::{Buf, BufMut};

use self::bloom::Bloom;
use crate::block::Block;
use crate::error::DbError;
use crate::key::{KeyBytes, KeySlice};

/// Cache of decoded data blocks, keyed by (file number, block index).
pub type BlockCache = moka::sync::Cache<(u64, usize), Arc<Block>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    offset: usize,
    first_key: KeyBytes,
    last_key: KeyBytes,
}

impl BlockMeta {
    /// Layout: count | (offset, first_key, last_key)* | max_seq | crc.
    pub fn encode_block_meta(block_meta: &[BlockMeta], max_seq: u64, buf: &mut Vec<u8>) {
        let mut estimated_size = std::mem::size_of::<u32>();
        for meta in block_meta {
            estimated_size += std::mem::size_of::<u32>();
            estimated_size += std::mem::size_of::<u16>() + meta.first_key.raw_len();
            estimated_size += std::mem::size_of::<u16>() + meta.last_key.raw_len();
        }
        estimated_size += std::mem::size_of::<u64>();
        estimated_size += std::mem::size_of::<u32>();

        buf.reserve(estimated_size);
        let original_len = buf.len();
        buf.put_u32(block_meta.len() as u32);

        for meta in block_meta {
            buf.put_u32(meta.offset as u32);
            buf.put_u16(meta.first_key.raw_len() as u16);
            buf.put_slice(meta.first_key.raw_ref());
            buf.put_u16(meta.last_key.raw_len() as u16);
            buf.put_slice(meta.last_key.raw_ref());
        }
        buf.put_u64(max_seq);
        buf.put_u32(crc32fast::hash(&buf[original_len + 4..]));
        assert_eq!(estimated_size, buf.len() - original_len)
    }

    pub fn decode_block_meta(mut buf: &[u8]) -> Result<(Vec<BlockMeta>, u64)> {
        let mut block_meta = Vec::new();
        let num = buf.get_u32() as usize;
        let checksum = crc32fast::hash(&buf[..buf.remaining() - 4]);
        for _ in 0..num {
            let offset = buf.get_u32() as usize;
            let first_key_len = buf.get_u16() as usize;
            let first_key = KeyBytes::from_bytes(buf.copy_to_bytes(first_key_len));
            let last_key_len = buf.get_u16() as usize;
            let last_key = KeyBytes::from_bytes(buf.copy_to_bytes(last_key_len));
            block_meta.push(BlockMeta {
                offset,
                first_key,
                last_key,
            });
        }
        let max_seq = buf.get_u64();
        if buf.get_u32() != checksum {
            bail!(DbError::Corruption("table meta checksum mismatch".to_string()));
        }
        Ok((block_meta, max_seq))
    }
}

/// A file object
pub struct FileObject(Option<File>, u64);

impl FileObject {
    pub fn create(path: &Path, data: Vec<u8>) -> Result<Self> {
        std::fs::write(path, &data)?;
        File::open(path)?.sync_all()?;
        Ok(FileObject(
            Some(File::options().read(true).write(false).open(path)?),
            data.len() as u64,
        ))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options().read(true).write(false).open(path)?;
        let size = file.metadata()?.len();
        Ok(FileObject(Some(file), size))
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let mut data = vec![0; len as usize];
        self.0
            .as_ref()
            .unwrap()
            .read_exact_at(&mut data[..], offset)?;
        Ok(data)
    }

    pub fn size(&self) -> u64 {
        self.1
    }
}

/// An immutable sorted table of internal-key/value entries on disk.
///
/// Layout: data blocks (each crc-suffixed) | block meta | meta_offset u32 |
/// bloom | bloom_offset u32.
pub struct SsTable {
    pub(crate) file: FileObject,
    pub(crate) block_meta: Vec<BlockMeta>,
    pub(crate) block_meta_offset: usize,
    id: u64,
    block_cache: Option<Arc<BlockCache>>,
    first_key: KeyBytes,
    last_key: KeyBytes,
    pub(crate) bloom: Option<Bloom>,
    max_seq: u64,
}

impl SsTable {
    /// Open an SSTable: reads the footer offsets, the bloom filter, and the
    /// block metadata.
    pub fn open(id: u64, block_cache: Option<Arc<BlockCache>>, file: FileObject) -> Result<Self> {
        let len = file.size();
        let raw_bloom_offset = file.read(len - 4, 4)?;
        let bloom_offset = (&raw_bloom_offset[..]).get_u32() as u64;
        let bloom_filter = if bloom_offset + 4 < len {
            let raw_bloom = file.read(bloom_offset, len - 4 - bloom_offset)?;
            Some(Bloom::decode(&raw_bloom)?)
        } else {
            None
        };
        let raw_meta_offset = file.read(bloom_offset - 4, 4)?;
        let block_meta_offset = (&raw_meta_offset[..]).get_u32() as u64;
        let raw_meta = file.read(block_meta_offset, bloom_offset - 4 - block_meta_offset)?;
        let (block_meta, max_seq) = BlockMeta::decode_block_meta(&raw_meta[..])?;
        if block_meta.is_empty() {
            bail!(DbError::Corruption(format!("table {:06} has no blocks", id)));
        }
        Ok(Self {
            file,
            first_key: block_meta.first().unwrap().first_key.clone(),
            last_key: block_meta.last().unwrap().last_key.clone(),
            block_meta,
            block_meta_offset: block_meta_offset as usize,
            id,
            block_cache,
            bloom: bloom_filter,
            max_seq,
        })
    }

    /// Read and verify one data block from disk.
    pub fn read_block(&self, block_idx: usize) -> Result<Arc<Block>> {
        let offset = self.block_meta[block_idx].offset;
        let offset_end = self
            .block_meta
            .get(block_idx + 1)
            .map_or(self.block_meta_offset, |x| x.offset);
        let block_len = offset_end - offset - 4;
        let block_data_with_chksum = self
            .file
            .read(offset as u64, (offset_end - offset) as u64)?;
        let block_data = &block_data_with_chksum[..block_len];
        let checksum = (&block_data_with_chksum[block_len..]).get_u32();
        if checksum != crc32fast::hash(block_data) {
            bail!(DbError::Corruption(format!(
                "block checksum mismatch in table {:06}",
                self.id
            )));
        }
        Ok(Arc::new(Block::decode(block_data)))
    }

    pub fn read_block_cached(&self, block_idx: usize) -> Result<Arc<Block>> {
        if let Some(ref block_cache) = self.block_cache {
            let blk = block_cache
                .try_get_with((self.id, block_idx), || self.read_block(block_idx))
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            Ok(blk)
        } else {
            self.read_block(block_idx)
        }
    }

    /// Index of the block that may contain `key`.
    pub fn find_block_idx(&self, key: KeySlice) -> usize {
        self.block_meta
            .partition_point(|meta| meta.first_key.as_key_slice() <= key)
            .saturating_sub(1)
    }

    pub fn first_key(&self) -> &KeyBytes {
        &self.first_key
    }

    pub fn last_key(&self) -> &KeyBytes {
        &self.last_key
    }

    pub fn num_of_blocks(&self) -> usize {
        self.block_meta.len()
    }

    pub fn table_size(&self) -> u64 {
        self.file.1
    }

    pub fn sst_id(&self) -> u64 {
        self.id
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }
}
