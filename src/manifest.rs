use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use crate::error::DbError;
use crate::version::VersionEdit;

/// The manifest: a log of `VersionEdit` records reconstructing the live set
/// of sorted runs on recovery. Records are length-prefixed JSON with a
/// trailing crc32.
pub struct Manifest {
    file: Arc<Mutex<File>>,
}

impl Manifest {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: Arc::new(Mutex::new(
                OpenOptions::new()
                    .read(true)
                    .create_new(true)
                    .write(true)
                    .open(path)
                    .context("fail to create manifest")?,
            )),
        })
    }

    /// Replay every edit in an existing manifest file.
    pub fn recover(path: impl AsRef<Path>) -> Result<Vec<VersionEdit>> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(path)
            .context("fail to open manifest")?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let mut buf = &buf[..];
        let mut records = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 8 {
                bail!(DbError::Corruption("manifest length truncated".to_string()));
            }
            let len = buf.get_u64() as usize;
            if buf.remaining() < len + 4 {
                bail!(DbError::Corruption("manifest record truncated".to_string()));
            }
            let payload = &buf[..len];
            let checksum = (&buf[len..len + 4]).get_u32();
            if crc32fast::hash(payload) != checksum {
                bail!(DbError::Corruption("manifest checksum mismatch".to_string()));
            }
            records.push(serde_json::from_slice::<VersionEdit>(payload)?);
            buf.advance(len + 4);
        }
        Ok(records)
    }

    pub fn add_record(&self, edit: &VersionEdit) -> Result<()> {
        let mut file = self.file.lock();
        let mut buf = serde_json::to_vec(edit)?;
        let hash = crc32fast::hash(&buf);
        file.write_all(&(buf.len() as u64).to_be_bytes())?;
        buf.put_u32(hash);
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST-000001");
        let manifest = Manifest::create(&path).unwrap();

        let mut edit = VersionEdit::new();
        edit.log_number = Some(3);
        edit.next_file_number = Some(8);
        edit.last_sequence = Some(42);
        edit.delete_file(1, 5);
        manifest.add_record(&edit).unwrap();

        let mut edit2 = VersionEdit::new();
        edit2.last_sequence = Some(99);
        manifest.add_record(&edit2).unwrap();

        let records = Manifest::recover(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].log_number, Some(3));
        assert_eq!(records[0].deleted_files, vec![(1, 5)]);
        assert_eq!(records[1].last_sequence, Some(99));
    }

    #[test]
    fn test_manifest_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST-000001");
        let manifest = Manifest::create(&path).unwrap();
        manifest.add_record(&VersionEdit::new()).unwrap();
        drop(manifest);

        let mut data = std::fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xff;
        std::fs::write(&path, &data).unwrap();
        assert!(Manifest::recover(&path).is_err());
    }
}
