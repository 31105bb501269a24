use std::path::{Path, PathBuf};

/// File kinds living in a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Table,
    Manifest,
    Current,
    Lock,
}

pub fn log_file_name(db: &Path, num: u64) -> PathBuf {
    db.join(format!("{:06}.log", num))
}

pub fn table_file_name(db: &Path, num: u64) -> PathBuf {
    db.join(format!("{:06}.sst", num))
}

pub fn manifest_file_name(db: &Path, num: u64) -> PathBuf {
    db.join(format!("MANIFEST-{:06}", num))
}

pub fn current_file_name(db: &Path) -> PathBuf {
    db.join("CURRENT")
}

pub fn lock_file_name(db: &Path) -> PathBuf {
    db.join("LOCK")
}

pub fn pmem_dir(db: &Path) -> PathBuf {
    db.join("pmem")
}

/// Parse a directory entry back into (file number, type).
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    if name == "CURRENT" {
        return Some((0, FileType::Current));
    }
    if name == "LOCK" {
        return Some((0, FileType::Lock));
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse().ok().map(|n| (n, FileType::Manifest));
    }
    if let Some(num) = name.strip_suffix(".log") {
        return num.parse().ok().map(|n| (n, FileType::Log));
    }
    if let Some(num) = name.strip_suffix(".sst") {
        return num.parse().ok().map(|n| (n, FileType::Table));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let db = Path::new("/db");
        for (path, ty, num) in [
            (log_file_name(db, 7), FileType::Log, 7),
            (table_file_name(db, 12), FileType::Table, 12),
            (manifest_file_name(db, 3), FileType::Manifest, 3),
        ] {
            let name = path.file_name().unwrap().to_str().unwrap().to_string();
            assert_eq!(parse_file_name(&name), Some((num, ty)));
        }
        assert_eq!(parse_file_name("CURRENT"), Some((0, FileType::Current)));
        assert_eq!(parse_file_name("junk.tmp"), None);
    }
}
