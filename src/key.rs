use std::cmp::Ordering;
use std::fmt;

use bytes::{BufMut, Bytes};

/// Length of the tag trailer packed onto every internal key.
pub const TAG_LEN: usize = 8;

/// Sequence numbers occupy 56 bits; the low byte of the tag is the type.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Record type stored in the internal-key tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

impl ValueType {
    pub fn from_u8(v: u8) -> ValueType {
        if v == 0 {
            ValueType::Deletion
        } else {
            ValueType::Value
        }
    }
}

/// Tag byte used when building a lookup key: sorts before any real record
/// with the same sequence, so a seek lands on the newest visible entry.
pub const TYPE_FOR_SEEK: u8 = 0xff;

pub fn pack_tag(seq: u64, ty: u8) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    (seq << 8) | ty as u64
}

/// An internal key: `user_key ++ 8-byte big-endian tag`, tag = (seq << 8) | type.
///
/// Ordered by user key ascending, then sequence descending, then type
/// descending, so the newest record for a user key sorts first.
pub struct Key<T: AsRef<[u8]>>(T);

// set alias for KeySlice(borrowing) and KeyVec(ownership).
pub type KeySlice<'a> = Key<&'a [u8]>;
pub type KeyVec = Key<Vec<u8>>;
pub type KeyBytes = Key<Bytes>;

impl<T: AsRef<[u8]>> Key<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    /// Full encoded length, tag included.
    pub fn raw_len(&self) -> usize {
        self.0.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_ref().is_empty()
    }

    /// The whole encoded internal key.
    pub fn raw_ref(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// The user-key prefix (tag bytes stripped).
    pub fn key_ref(&self) -> &[u8] {
        let raw = self.0.as_ref();
        debug_assert!(raw.len() >= TAG_LEN);
        &raw[..raw.len() - TAG_LEN]
    }

    fn tag(&self) -> u64 {
        let raw = self.0.as_ref();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw[raw.len() - TAG_LEN..]);
        u64::from_be_bytes(buf)
    }

    pub fn seq(&self) -> u64 {
        self.tag() >> 8
    }

    pub fn value_type(&self) -> ValueType {
        ValueType::from_u8((self.tag() & 0xff) as u8)
    }

    pub fn to_key_vec(&self) -> KeyVec {
        Key(self.0.as_ref().to_vec())
    }
}

impl<'a> KeySlice<'a> {
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Key(slice)
    }

    /// Like `key_ref`, but the returned slice keeps the borrow's original
    /// lifetime instead of being tied to `&self` — needed when the
    /// `KeySlice` itself is a short-lived temporary (e.g. returned by value
    /// from a `StorageIterator::key()` call) but the bytes it points to
    /// outlive that temporary.
    pub fn into_user_key(self) -> &'a [u8] {
        let raw = self.0;
        debug_assert!(raw.len() >= TAG_LEN);
        &raw[..raw.len() - TAG_LEN]
    }
}

impl KeyVec {
    pub fn new() -> Self {
        Key(Vec::new())
    }

    /// Build an internal key from its parts.
    pub fn from_parts(user_key: &[u8], seq: u64, ty: ValueType) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TAG_LEN);
        buf.put_slice(user_key);
        buf.put_u64(pack_tag(seq, ty as u8));
        Key(buf)
    }

    /// A key that seeks to the newest entry visible at `seq` for `user_key`.
    pub fn for_lookup(user_key: &[u8], seq: u64) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TAG_LEN);
        buf.put_slice(user_key);
        buf.put_u64(pack_tag(seq, TYPE_FOR_SEEK));
        Key(buf)
    }

    pub fn from_vec(v: Vec<u8>) -> Self {
        Key(v)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn set_from_slice(&mut self, key: KeySlice) {
        self.0.clear();
        self.0.extend_from_slice(key.raw_ref());
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key(&self.0)
    }

    pub fn into_key_bytes(self) -> KeyBytes {
        Key(self.0.into())
    }
}

impl Default for KeyVec {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyBytes {
    pub fn new() -> Self {
        Key(Bytes::new())
    }

    pub fn from_bytes(b: Bytes) -> Self {
        Key(b)
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key(&self.0)
    }
}

impl Default for KeyBytes {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: AsRef<[u8]> + Clone> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: AsRef<[u8]> + Copy> Copy for Key<T> {}

impl<T: AsRef<[u8]>> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: AsRef<[u8]>> Eq for Key<T> {}

impl<T: AsRef<[u8]>> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: AsRef<[u8]>> Ord for Key<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_ref()
            .cmp(other.key_ref())
            .then_with(|| other.tag().cmp(&self.tag()))
    }
}

impl<T: AsRef<[u8]>> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw_len() < TAG_LEN {
            return write!(f, "<untagged {:?}>", self.0.as_ref());
        }
        write!(
            f,
            "{:?}@{}:{:?}",
            Bytes::copy_from_slice(self.key_ref()),
            self.seq(),
            self.value_type()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_ordering() {
        let a1 = KeyVec::from_parts(b"a", 1, ValueType::Value);
        let a5 = KeyVec::from_parts(b"a", 5, ValueType::Value);
        let b1 = KeyVec::from_parts(b"b", 1, ValueType::Value);
        // same user key: higher sequence sorts first
        assert!(a5 < a1);
        // user keys ascending
        assert!(a1 < b1);
        assert!(a5 < b1);
    }

    #[test]
    fn test_lookup_key_lands_before_records() {
        let lookup = KeyVec::for_lookup(b"k", 7);
        let newest_visible = KeyVec::from_parts(b"k", 7, ValueType::Value);
        let newer = KeyVec::from_parts(b"k", 8, ValueType::Value);
        assert!(lookup <= newest_visible);
        assert!(newer < lookup);
    }

    #[test]
    fn test_tag_round_trip() {
        let k = KeyVec::from_parts(b"user", 123456, ValueType::Deletion);
        assert_eq!(k.key_ref(), b"user");
        assert_eq!(k.seq(), 123456);
        assert_eq!(k.value_type(), ValueType::Deletion);
    }
}
