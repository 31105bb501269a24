use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Buf;
use log::warn;
use parking_lot::Mutex;

use crate::error::DbError;

/// Log block size; records never straddle a block, they fragment instead.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// crc (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 7;

const FULL: u8 = 1;
const FIRST: u8 = 2;
const MIDDLE: u8 = 3;
const LAST: u8 = 4;

struct WalInner {
    file: BufWriter<File>,
    block_offset: usize,
}

/// Append-only record log with 32 KiB block framing and per-fragment CRCs.
pub struct Wal {
    inner: Arc<Mutex<WalInner>>,
}

impl Wal {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .context("fail to create WAL")?;
        Ok(Self {
            inner: Arc::new(Mutex::new(WalInner {
                file: BufWriter::new(file),
                block_offset: 0,
            })),
        })
    }

    /// Reopen an existing log for appending (`reuse_logs` recovery).
    pub fn reopen_for_append(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .context("fail to reopen WAL")?;
        let len = file.metadata()?.len() as usize;
        Ok(Self {
            inner: Arc::new(Mutex::new(WalInner {
                file: BufWriter::new(file),
                block_offset: len % BLOCK_SIZE,
            })),
        })
    }

    pub fn add_record(&self, mut payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut begin = true;
        // Fragment across blocks; an empty payload still emits one record.
        loop {
            let leftover = BLOCK_SIZE - inner.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    inner.file.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                inner.block_offset = 0;
            }
            let avail = BLOCK_SIZE - inner.block_offset - HEADER_SIZE;
            let fragment_len = payload.len().min(avail);
            let end = fragment_len == payload.len();
            let ty = match (begin, end) {
                (true, true) => FULL,
                (true, false) => FIRST,
                (false, true) => LAST,
                (false, false) => MIDDLE,
            };
            let (fragment, rest) = payload.split_at(fragment_len);
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&[ty]);
            hasher.update(fragment);
            let crc = hasher.finalize();

            inner.file.write_all(&crc.to_le_bytes())?;
            inner.file.write_all(&(fragment_len as u16).to_le_bytes())?;
            inner.file.write_all(&[ty])?;
            inner.file.write_all(fragment)?;
            inner.block_offset += HEADER_SIZE + fragment_len;

            payload = rest;
            begin = false;
            if end {
                break;
            }
        }
        inner.file.flush()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        Ok(())
    }
}

/// Replays the records of a closed log file.
///
/// With `paranoid == false`, torn tails and checksum mismatches end the
/// replay with a warning instead of an error, matching the behavior of a
/// crash mid-append.
pub struct WalReader {
    data: Vec<u8>,
    pos: usize,
    paranoid: bool,
    partial: Vec<u8>,
    in_fragmented: bool,
}

impl WalReader {
    pub fn open(path: impl AsRef<Path>, paranoid: bool) -> Result<Self> {
        let mut data = Vec::new();
        File::open(&path)
            .context("fail to open WAL for replay")?
            .read_to_end(&mut data)?;
        Ok(Self {
            data,
            pos: 0,
            paranoid,
            partial: Vec::new(),
            in_fragmented: false,
        })
    }

    /// Next complete record, or `None` at end of log.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let block_left = BLOCK_SIZE - self.pos % BLOCK_SIZE;
            if block_left < HEADER_SIZE {
                self.pos += block_left;
            }
            if self.pos + HEADER_SIZE > self.data.len() {
                return self.end_of_log("truncated record header");
            }
            let mut header = &self.data[self.pos..self.pos + HEADER_SIZE];
            let crc = header.get_u32_le();
            let len = header.get_u16_le() as usize;
            let ty = header.get_u8();
            if ty == 0 && len == 0 && crc == 0 {
                // Zero-filled padding or preallocated tail.
                return self.end_of_log("zero padding");
            }
            let body_start = self.pos + HEADER_SIZE;
            if body_start + len > self.data.len() {
                return self.end_of_log("truncated record body");
            }
            let fragment = &self.data[body_start..body_start + len];
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&[ty]);
            hasher.update(fragment);
            if hasher.finalize() != crc {
                if self.paranoid {
                    bail!(DbError::Corruption("WAL record checksum mismatch".to_string()));
                }
                warn!("dropping {} bytes of WAL: checksum mismatch", len);
                self.pos = self.data.len();
                return Ok(None);
            }
            self.pos = body_start + len;

            match ty {
                FULL => {
                    self.in_fragmented = false;
                    return Ok(Some(fragment.to_vec()));
                }
                FIRST => {
                    self.partial.clear();
                    self.partial.extend_from_slice(fragment);
                    self.in_fragmented = true;
                }
                MIDDLE if self.in_fragmented => {
                    self.partial.extend_from_slice(fragment);
                }
                LAST if self.in_fragmented => {
                    self.in_fragmented = false;
                    self.partial.extend_from_slice(fragment);
                    return Ok(Some(std::mem::take(&mut self.partial)));
                }
                _ => {
                    if self.paranoid {
                        bail!(DbError::Corruption(format!(
                            "unexpected WAL fragment type {}",
                            ty
                        )));
                    }
                    warn!("dropping stray WAL fragment of type {}", ty);
                    self.in_fragmented = false;
                }
            }
        }
    }

    fn end_of_log(&mut self, reason: &str) -> Result<Option<Vec<u8>>> {
        if self.in_fragmented && self.paranoid {
            bail!(DbError::Corruption(format!(
                "WAL ended mid-record: {}",
                reason
            )));
        }
        self.pos = self.data.len();
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn replay_all(path: &std::path::Path) -> Vec<Vec<u8>> {
        let mut reader = WalReader::open(path, true).unwrap();
        let mut out = Vec::new();
        while let Some(rec) = reader.read_record().unwrap() {
            out.push(rec);
        }
        out
    }

    #[test]
    fn test_wal_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let wal = Wal::create(&path).unwrap();
        wal.add_record(b"first").unwrap();
        wal.add_record(b"").unwrap();
        wal.add_record(&vec![7u8; 100_000]).unwrap();
        wal.sync().unwrap();

        let records = replay_all(&path);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], b"first");
        assert_eq!(records[1], b"");
        assert_eq!(records[2], vec![7u8; 100_000]);
    }

    #[test]
    fn test_wal_torn_tail_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let wal = Wal::create(&path).unwrap();
        wal.add_record(b"kept").unwrap();
        wal.add_record(b"torn").unwrap();
        wal.sync().unwrap();
        drop(wal);

        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 2]).unwrap();

        let mut reader = WalReader::open(&path, false).unwrap();
        assert_eq!(reader.read_record().unwrap().unwrap(), b"kept");
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn test_wal_checksum_flip_is_corruption_when_paranoid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let wal = Wal::create(&path).unwrap();
        wal.add_record(b"payload").unwrap();
        wal.sync().unwrap();
        drop(wal);

        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let mut reader = WalReader::open(&path, true).unwrap();
        assert!(reader.read_record().is_err());
    }
}
