use bytes::Bytes;
use tempfile::tempdir;

use crate::db::Db;
use crate::options::{Options, ReadOptions};

#[test]
fn test_wal_replay_restores_memtable() {
    let dir = tempdir().unwrap();
    {
        let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        db.delete(b"a").unwrap();
        // no flush: everything lives in the WAL.
    }
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    let read = ReadOptions::default();
    assert_eq!(db.get(&read, b"a").unwrap(), None);
    assert_eq!(db.get(&read, b"b").unwrap(), Some(Bytes::from_static(b"2")));
}

#[test]
fn test_manifest_recovery_restores_runs() {
    let dir = tempdir().unwrap();
    {
        let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
        for i in 0..100u32 {
            db.put(format!("key{:04}", i).as_bytes(), b"value").unwrap();
        }
        db.flush_memtable().unwrap();
        db.compact_range(None, None).unwrap();
        db.put(b"late", b"wal-only").unwrap();
    }
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    let read = ReadOptions::default();
    for i in 0..100u32 {
        assert_eq!(
            db.get(&read, format!("key{:04}", i).as_bytes()).unwrap(),
            Some(Bytes::from_static(b"value"))
        );
    }
    assert_eq!(
        db.get(&read, b"late").unwrap(),
        Some(Bytes::from_static(b"wal-only"))
    );
}

#[test]
fn test_last_sequence_is_monotone_across_restart() {
    let dir = tempdir().unwrap();
    let seq_before;
    {
        let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
        for i in 0..10u32 {
            db.put(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        seq_before = db.get_snapshot().sequence();
    }
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    let seq_after = db.get_snapshot().sequence();
    assert!(
        seq_after >= seq_before,
        "sequence went backwards: {} -> {}",
        seq_before,
        seq_after
    );

    // new writes keep ascending past the recovered point.
    db.put(b"next", b"v").unwrap();
    assert!(db.get_snapshot().sequence() > seq_after);
}

#[test]
fn test_create_if_missing_and_error_if_exists() {
    let dir = tempdir().unwrap();
    let mut options = Options::small_for_test();
    options.create_if_missing = false;
    assert!(Db::open(options, dir.path().join("nope")).is_err());

    let options = Options::small_for_test();
    drop(Db::open(options.clone(), dir.path().join("db")).unwrap());
    let mut strict = options;
    strict.error_if_exists = true;
    assert!(Db::open(strict, dir.path().join("db")).is_err());
}

#[test]
fn test_reuse_logs_keeps_last_wal() {
    let dir = tempdir().unwrap();
    let mut options = Options::small_for_test();
    options.reuse_logs = true;
    {
        let db = Db::open(options.clone(), dir.path()).unwrap();
        db.put(b"a", b"1").unwrap();
    }
    {
        let db = Db::open(options.clone(), dir.path()).unwrap();
        // the replayed memtable stays live instead of being flushed.
        assert!(crate::tests::harness::dump_version_entries(&db).is_empty());
        db.put(b"b", b"2").unwrap();
    }
    let db = Db::open(options, dir.path()).unwrap();
    let read = ReadOptions::default();
    assert_eq!(db.get(&read, b"a").unwrap(), Some(Bytes::from_static(b"1")));
    assert_eq!(db.get(&read, b"b").unwrap(), Some(Bytes::from_static(b"2")));
}
