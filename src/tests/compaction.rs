use bytes::Bytes;
use tempfile::tempdir;

use crate::db::Db;
use crate::key::ValueType;
use crate::options::{Options, ReadOptions};
use crate::tests::harness::{assert_levels_are_ordered, dump_version_entries};

#[test]
fn test_flush_then_get_from_runs() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    let read = ReadOptions::default();

    for i in 0..100u32 {
        db.put(format!("key{:04}", i).as_bytes(), b"value").unwrap();
    }
    db.flush_memtable().unwrap();
    assert!(!dump_version_entries(&db).is_empty());
    for i in 0..100u32 {
        assert_eq!(
            db.get(&read, format!("key{:04}", i).as_bytes()).unwrap(),
            Some(Bytes::from_static(b"value"))
        );
    }
}

#[test]
fn test_full_compaction_drops_shadowed_versions() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    let read = ReadOptions::default();

    db.put(b"k", b"v1").unwrap();
    db.flush_memtable().unwrap();
    db.put(b"k", b"v2").unwrap();
    db.flush_memtable().unwrap();

    db.compact_range(None, None).unwrap();
    db.compact_range(None, None).unwrap();

    assert_eq!(db.get(&read, b"k").unwrap(), Some(Bytes::from_static(b"v2")));
    let versions_of_k: Vec<_> = dump_version_entries(&db)
        .into_iter()
        .filter(|(k, _, _, _)| k == b"k")
        .collect();
    // only the newest version survives below the snapshot floor.
    assert_eq!(versions_of_k.len(), 1, "stale versions: {:?}", versions_of_k);
    assert_eq!(versions_of_k[0].2, ValueType::Value);
}

#[test]
fn test_tombstone_dropped_at_base_level() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    let read = ReadOptions::default();

    db.put(b"k", b"v").unwrap();
    db.flush_memtable().unwrap();
    db.delete(b"k").unwrap();
    db.flush_memtable().unwrap();

    // no snapshot is live, so compaction to the base level erases both the
    // value and the tombstone.
    db.compact_range(None, None).unwrap();
    db.compact_range(None, None).unwrap();

    assert_eq!(db.get(&read, b"k").unwrap(), None);
    let entries = dump_version_entries(&db);
    assert!(
        entries.iter().all(|(k, _, _, _)| k != b"k"),
        "records for k remain: {:?}",
        entries
    );
}

#[test]
fn test_compaction_preserves_snapshot_versions() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();

    db.put(b"k", b"v1").unwrap();
    db.flush_memtable().unwrap();
    let snapshot = db.get_snapshot();
    db.put(b"k", b"v2").unwrap();
    db.flush_memtable().unwrap();
    db.compact_range(None, None).unwrap();

    // the merge kept the version the snapshot still needs.
    let versions_of_k = dump_version_entries(&db)
        .into_iter()
        .filter(|(k, _, _, _)| k == b"k")
        .count();
    assert_eq!(versions_of_k, 2);

    let at_snapshot = ReadOptions {
        snapshot: Some(snapshot.sequence()),
        ..Default::default()
    };
    assert_eq!(
        db.get(&at_snapshot, b"k").unwrap(),
        Some(Bytes::from_static(b"v1"))
    );
    assert_eq!(
        db.get(&ReadOptions::default(), b"k").unwrap(),
        Some(Bytes::from_static(b"v2"))
    );
    db.release_snapshot(snapshot);
}

#[test]
fn test_compact_range_is_idempotent() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();

    for i in 0..200u32 {
        db.put(format!("key{:04}", i).as_bytes(), &[b'x'; 100]).unwrap();
    }
    db.flush_memtable().unwrap();
    for i in 0..200u32 {
        db.put(format!("key{:04}", i).as_bytes(), &[b'y'; 100]).unwrap();
    }
    db.flush_memtable().unwrap();

    db.compact_range(None, None).unwrap();
    assert_levels_are_ordered(&db);
    let after_first = dump_version_entries(&db);
    db.compact_range(None, None).unwrap();
    let after_second = dump_version_entries(&db);
    assert_eq!(after_first, after_second);
}

#[test]
fn test_l0_pileup_triggers_size_compaction() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    let read = ReadOptions::default();

    // repeated overlapping flushes pile runs into level 0 until the size
    // score trips and the background thread merges them down.
    for round in 0..8u32 {
        for i in 0..50u32 {
            db.put(
                format!("key{:04}", i).as_bytes(),
                format!("v{}", round).as_bytes(),
            )
            .unwrap();
        }
        db.flush_memtable().unwrap();
    }
    db.wait_for_background_work();
    assert_levels_are_ordered(&db);

    let l0: usize = db
        .get_property("num-files-at-level0")
        .unwrap()
        .parse()
        .unwrap();
    assert!(l0 < 8, "level 0 never compacted: {} files", l0);
    for i in 0..50u32 {
        assert_eq!(
            db.get(&read, format!("key{:04}", i).as_bytes()).unwrap(),
            Some(Bytes::from_static(b"v7"))
        );
    }
}
