use std::ops::Bound;

use bytes::Bytes;
use tempfile::tempdir;

use crate::batch::WriteBatch;
use crate::db::Db;
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::tests::harness::check_lsm_iter_result_by_key;

#[test]
fn test_basic_put_get() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();
    let read = ReadOptions::default();
    assert_eq!(db.get(&read, b"a").unwrap(), Some(Bytes::from_static(b"1")));
    assert_eq!(db.get(&read, b"b").unwrap(), Some(Bytes::from_static(b"2")));
    assert_eq!(db.get(&read, b"c").unwrap(), None);
}

#[test]
fn test_overwrite_and_delete() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    let read = ReadOptions::default();

    db.put(b"k", b"v1").unwrap();
    db.put(b"k", b"v2").unwrap();
    assert_eq!(db.get(&read, b"k").unwrap(), Some(Bytes::from_static(b"v2")));

    db.delete(b"k").unwrap();
    assert_eq!(db.get(&read, b"k").unwrap(), None);

    db.put(b"k", b"v3").unwrap();
    assert_eq!(db.get(&read, b"k").unwrap(), Some(Bytes::from_static(b"v3")));
}

#[test]
fn test_batch_is_atomic_and_ordered() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    let read = ReadOptions::default();

    db.put(b"gone", b"old").unwrap();
    let mut batch = WriteBatch::new();
    batch.put(b"x", b"1");
    batch.delete(b"gone");
    batch.put(b"x", b"2");
    db.write(&WriteOptions::default(), batch).unwrap();

    // the last record for a key within a batch wins.
    assert_eq!(db.get(&read, b"x").unwrap(), Some(Bytes::from_static(b"2")));
    assert_eq!(db.get(&read, b"gone").unwrap(), None);
}

#[test]
fn test_scan_ranges() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
        db.put(k.as_bytes(), v.as_bytes()).unwrap();
    }
    db.delete(b"c").unwrap();

    let mut iter = db.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    check_lsm_iter_result_by_key(
        &mut iter,
        vec![
            (Bytes::from("a"), Bytes::from("1")),
            (Bytes::from("b"), Bytes::from("2")),
            (Bytes::from("d"), Bytes::from("4")),
        ],
    );

    let mut iter = db
        .scan(Bound::Excluded(b"a".as_ref()), Bound::Included(b"c".as_ref()))
        .unwrap();
    check_lsm_iter_result_by_key(&mut iter, vec![(Bytes::from("b"), Bytes::from("2"))]);
}

#[test]
fn test_snapshot_pins_history() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();

    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"1").unwrap();
    let snapshot = db.get_snapshot();
    db.put(b"a", b"2").unwrap();
    db.delete(b"b").unwrap();

    let at_snapshot = ReadOptions {
        snapshot: Some(snapshot.sequence()),
        ..Default::default()
    };
    let latest = ReadOptions::default();
    assert_eq!(
        db.get(&at_snapshot, b"a").unwrap(),
        Some(Bytes::from_static(b"1"))
    );
    assert_eq!(
        db.get(&at_snapshot, b"b").unwrap(),
        Some(Bytes::from_static(b"1"))
    );
    assert_eq!(db.get(&latest, b"a").unwrap(), Some(Bytes::from_static(b"2")));
    assert_eq!(db.get(&latest, b"b").unwrap(), None);

    db.release_snapshot(snapshot);
}

#[test]
fn test_concurrent_writers_group_commit() {
    let dir = tempdir().unwrap();
    let db = std::sync::Arc::new(Db::open(Options::small_for_test(), dir.path()).unwrap());

    let mut handles = Vec::new();
    for t in 0..4 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..50 {
                let key = format!("t{}-k{}", t, i);
                db.put(key.as_bytes(), b"v").unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let read = ReadOptions::default();
    for t in 0..4 {
        for i in 0..50 {
            let key = format!("t{}-k{}", t, i);
            assert_eq!(
                db.get(&read, key.as_bytes()).unwrap(),
                Some(Bytes::from_static(b"v")),
                "missing {}",
                key
            );
        }
    }
}

#[test]
fn test_properties_exist() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::small_for_test(), dir.path()).unwrap();
    db.put(b"a", b"1").unwrap();
    assert_eq!(db.get_property("num-files-at-level0").unwrap(), "0");
    assert!(db.get_property("stats").is_some());
    assert!(db.get_property("sstables").is_some());
    let usage: usize = db
        .get_property("approximate-memory-usage")
        .unwrap()
        .parse()
        .unwrap();
    assert!(usage > 0);
    assert!(db.get_property("no-such-property").is_none());
}
