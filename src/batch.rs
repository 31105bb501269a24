use anyhow::{bail, Result};
use bytes::{Buf, BufMut};
use integer_encoding::VarInt;

use crate::error::DbError;
use crate::key::ValueType;
use crate::mem_table::MemTable;

/// Byte offset where records start: 8-byte sequence + 4-byte count.
pub const BATCH_HEADER_LEN: usize = 12;

/// An ordered group of puts and deletes applied atomically.
///
/// Wire layout: `sequence: u64 LE | count: u32 LE | records`, each record
/// being `tag: u8 | varint(klen) | key [| varint(vlen) | value]`. The same
/// bytes are framed into the WAL, so the encoding is the durable format.
#[derive(Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER_LEN],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Value as u8);
        self.rep.extend_from_slice(&(key.len() as u32).encode_var_vec());
        self.rep.put_slice(key);
        self.rep.extend_from_slice(&(value.len() as u32).encode_var_vec());
        self.rep.put_slice(value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Deletion as u8);
        self.rep.extend_from_slice(&(key.len() as u32).encode_var_vec());
        self.rep.put_slice(key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_LEN, 0);
    }

    pub fn count(&self) -> u32 {
        (&self.rep[8..12]).get_u32_le()
    }

    fn set_count(&mut self, n: u32) {
        self.rep[8..12].copy_from_slice(&n.to_le_bytes());
    }

    pub fn sequence(&self) -> u64 {
        (&self.rep[..8]).get_u64_le()
    }

    pub fn set_sequence(&mut self, seq: u64) {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
    }

    pub fn byte_size(&self) -> usize {
        self.rep.len()
    }

    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    pub fn from_contents(data: &[u8]) -> Result<Self> {
        if data.len() < BATCH_HEADER_LEN {
            bail!(DbError::Corruption("batch header truncated".to_string()));
        }
        Ok(Self { rep: data.to_vec() })
    }

    /// Splice `other`'s records onto `self` (batch-group coalescing).
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_LEN..]);
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            rest: &self.rep[BATCH_HEADER_LEN..],
            seq: self.sequence(),
        }
    }

    /// Apply every record to the memtable with its per-record sequence.
    pub fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut applied = 0u32;
        for rec in self.iter() {
            let (seq, ty, key, value) = rec?;
            mem.add(seq, ty, key, value)?;
            applied += 1;
        }
        if applied != self.count() {
            bail!(DbError::Corruption(format!(
                "batch count {} does not match records {}",
                self.count(),
                applied
            )));
        }
        Ok(())
    }
}

pub struct BatchIter<'a> {
    rest: &'a [u8],
    seq: u64,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<(u64, ValueType, &'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let ty = ValueType::from_u8(self.rest[0]);
        self.rest = &self.rest[1..];
        let key = match take_length_prefixed(&mut self.rest) {
            Ok(k) => k,
            Err(e) => return Some(Err(e)),
        };
        let value = if ty == ValueType::Value {
            match take_length_prefixed(&mut self.rest) {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            }
        } else {
            &[][..]
        };
        let seq = self.seq;
        self.seq += 1;
        Some(Ok((seq, ty, key, value)))
    }
}

fn take_length_prefixed<'a>(rest: &mut &'a [u8]) -> Result<&'a [u8]> {
    let Some((len, n)) = u32::decode_var(rest) else {
        bail!(DbError::Corruption("bad varint in batch record".to_string()));
    };
    let len = len as usize;
    if rest.len() < n + len {
        bail!(DbError::Corruption("batch record truncated".to_string()));
    }
    let out = &rest[n..n + len];
    *rest = &rest[n + len..];
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_round_trip() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"33");
        batch.set_sequence(100);
        assert_eq!(batch.count(), 3);

        let records: Vec<_> = batch.iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], (100, ValueType::Value, &b"a"[..], &b"1"[..]));
        assert_eq!(records[1], (101, ValueType::Deletion, &b"b"[..], &b""[..]));
        assert_eq!(records[2], (102, ValueType::Value, &b"c"[..], &b"33"[..]));
    }

    #[test]
    fn test_batch_append() {
        let mut a = WriteBatch::new();
        a.put(b"x", b"1");
        let mut b = WriteBatch::new();
        b.put(b"y", b"2");
        b.delete(b"z");
        a.append(&b);
        assert_eq!(a.count(), 3);
        let keys: Vec<_> = a.iter().map(|r| r.unwrap().2.to_vec()).collect();
        assert_eq!(keys, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn test_corrupt_batch_reports() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        let mut data = batch.contents().to_vec();
        data.truncate(data.len() - 1);
        let broken = WriteBatch::from_contents(&data).unwrap();
        assert!(broken.iter().any(|r| r.is_err()));
    }
}
