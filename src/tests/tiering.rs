use std::collections::HashSet;

use bytes::Bytes;
use tempfile::tempdir;

use crate::db::Db;
use crate::filename::table_file_name;
use crate::key::ValueType;
use crate::mem_table::MemTable;
use crate::options::{ReadOptions, TieringOption};
use crate::tests::harness::{
    assert_levels_are_ordered, dump_version_entries, levels_holding_key, pmem_options,
};

#[test]
fn test_leveled_tiering_places_shallow_levels_in_pmem() {
    let dir = tempdir().unwrap();
    let mut options = pmem_options(TieringOption::LeveledTiering);
    options.pmem_skiplist_level_threshold = 2;
    let db = Db::open(options, dir.path()).unwrap();

    for i in 0..50u32 {
        db.put(format!("key{:04}", i).as_bytes(), b"v").unwrap();
    }
    db.flush_memtable().unwrap();

    let state = db.inner.state.lock();
    let version = state.versions.current();
    let runs: Vec<_> = version.levels.iter().flatten().collect();
    assert_eq!(runs.len(), 1);
    let number = runs[0].number;
    assert!(state.tiering.is_in_skiplist_set(number));
    drop(state);
    assert!(db.inner.skiplists.contains_instance(number));
    // the run is served from the skiplist tier.
    assert_eq!(
        db.get(&ReadOptions::default(), b"key0000").unwrap(),
        Some(Bytes::from_static(b"v"))
    );
}

#[test]
fn test_leveled_tiering_threshold_zero_goes_to_disk() {
    let dir = tempdir().unwrap();
    let mut options = pmem_options(TieringOption::LeveledTiering);
    options.pmem_skiplist_level_threshold = 0;
    let db = Db::open(options, dir.path()).unwrap();

    for i in 0..50u32 {
        db.put(format!("key{:04}", i).as_bytes(), b"v").unwrap();
    }
    db.flush_memtable().unwrap();

    let state = db.inner.state.lock();
    let version = state.versions.current();
    let number = version.levels.iter().flatten().next().unwrap().number;
    // flushes land at level 2 here, above the PMEM threshold.
    assert!(state.tiering.is_in_file_set(number));
    drop(state);
    assert!(!db.inner.skiplists.contains_instance(number));
    assert!(table_file_name(dir.path(), number).exists());
}

#[test]
fn test_cold_data_tiering_always_prefers_pmem() {
    let dir = tempdir().unwrap();
    let db = Db::open(pmem_options(TieringOption::ColdDataTiering), dir.path()).unwrap();
    for i in 0..50u32 {
        db.put(format!("key{:04}", i).as_bytes(), b"v").unwrap();
    }
    db.flush_memtable().unwrap();

    let state = db.inner.state.lock();
    assert_eq!(state.tiering.skiplist_set_size(), 1);
    assert_eq!(state.tiering.file_set_size(), 0);
}

#[test]
fn test_residency_sets_stay_disjoint() {
    let dir = tempdir().unwrap();
    let db = Db::open(pmem_options(TieringOption::LeveledTiering), dir.path()).unwrap();
    for round in 0..4u32 {
        for i in 0..50u32 {
            db.put(
                format!("key{:04}", i).as_bytes(),
                format!("v{}", round).as_bytes(),
            )
            .unwrap();
        }
        db.flush_memtable().unwrap();
    }
    db.compact_range(None, None).unwrap();
    assert_levels_are_ordered(&db);

    let state = db.inner.state.lock();
    let version = state.versions.current();
    for f in version.levels.iter().flatten() {
        let in_files = state.tiering.is_in_file_set(f.number);
        let in_lists = state.tiering.is_in_skiplist_set(f.number);
        assert!(
            in_files ^ in_lists,
            "run {:06} is in {} residency sets",
            f.number,
            in_files as u8 + in_lists as u8
        );
    }
}

#[test]
fn test_hot_keys_route_back_to_level_0() {
    let dir = tempdir().unwrap();
    let mut options = pmem_options(TieringOption::LeveledTiering);
    options.pmem_skiplist_level_threshold = 2;
    options.hot_threshold = 3;
    let db = Db::open(options, dir.path()).unwrap();
    let read = ReadOptions::default();

    // first flush settles at L2, the overlapping second one at L1.
    for i in 0..100u32 {
        db.put(format!("key{:04}", i).as_bytes(), b"cold").unwrap();
    }
    db.flush_memtable().unwrap();
    for i in 0..100u32 {
        db.put(format!("key{:04}", i).as_bytes(), b"warm").unwrap();
    }
    db.flush_memtable().unwrap();

    // heat up one key past the routing threshold.
    for _ in 0..5 {
        assert_eq!(
            db.get(&read, b"key0050").unwrap(),
            Some(Bytes::from_static(b"warm"))
        );
    }

    db.compact_range(None, None).unwrap();

    // the hot key was split into a fresh level-0 run; its neighbours
    // went to the warm output one level down.
    assert_eq!(levels_holding_key(&db, b"key0050"), vec![0]);
    assert_eq!(levels_holding_key(&db, b"key0049"), vec![2]);
    assert_eq!(levels_holding_key(&db, b"key0051"), vec![2]);
    assert_eq!(
        db.get(&read, b"key0050").unwrap(),
        Some(Bytes::from_static(b"warm"))
    );

    // the hot run is PMEM-resident.
    let state = db.inner.state.lock();
    let version = state.versions.current();
    assert_eq!(version.levels[0].len(), 1);
    assert!(state
        .tiering
        .is_in_skiplist_set(version.levels[0][0].number));
}

#[test]
fn test_lru_tiering_inline_eviction() {
    let dir = tempdir().unwrap();
    let mut options = pmem_options(TieringOption::LruTiering);
    // three 20-entry runs (22 nodes each with sentinel and terminator)
    // nearly fill one 70-node manager.
    options.pmem_node_capacity = 70;
    options.max_skiplist_entries = 20;
    let db = Db::open(options, dir.path()).unwrap();

    // craft three runs on the same manager shard, oldest first.
    for (round, number) in [12u64, 22, 32].into_iter().enumerate() {
        let mem = MemTable::create(0);
        for i in 0..20u32 {
            mem.add(
                (round * 100 + i as usize + 1) as u64,
                ValueType::Value,
                format!("r{}-key{:02}", round, i).as_bytes(),
                b"value",
            )
            .unwrap();
        }
        db.inner.build_pmem_run(number, mem.iter()).unwrap();
        let mut state = db.inner.state.lock();
        state.versions.mark_file_number_used(number);
        state.tiering.insert_into_skiplist_set(number);
        state.tiering.push_to_number_list(1, number);
    }

    // a fourth run on the same shard does not fit: the LRU resident is
    // demoted to an SST with its own file number, then the pick succeeds.
    let mut state = db.inner.state.lock();
    let use_pmem = db
        .inner
        .pick_warm_residency(&mut state, 1, 22, Some(&HashSet::new()), 42)
        .unwrap();
    assert!(use_pmem);
    assert!(state.tiering.is_in_file_set(12));
    assert!(!state.tiering.is_in_skiplist_set(12));
    assert!(state.tiering.is_in_skiplist_set(22));
    assert!(state.tiering.is_in_skiplist_set(32));
    drop(state);

    assert!(!db.inner.skiplists.contains_instance(12));
    assert!(table_file_name(dir.path(), 12).exists());
    // the demoted run kept its contents.
    let table = db.inner.table_cache.get_table(12).unwrap();
    assert_eq!(table.max_seq(), 20);
}

#[test]
fn test_lru_tiering_keeps_compaction_inputs_resident() {
    let dir = tempdir().unwrap();
    let mut options = pmem_options(TieringOption::LruTiering);
    options.pmem_node_capacity = 70;
    options.max_skiplist_entries = 20;
    let db = Db::open(options, dir.path()).unwrap();

    for (round, number) in [12u64, 22, 32].into_iter().enumerate() {
        let mem = MemTable::create(0);
        for i in 0..20u32 {
            mem.add(
                (round * 100 + i as usize + 1) as u64,
                ValueType::Value,
                format!("r{}-key{:02}", round, i).as_bytes(),
                b"value",
            )
            .unwrap();
        }
        db.inner.build_pmem_run(number, mem.iter()).unwrap();
        let mut state = db.inner.state.lock();
        state.versions.mark_file_number_used(number);
        state.tiering.insert_into_skiplist_set(number);
        state.tiering.push_to_number_list(1, number);
    }

    // the oldest resident is shielded when it is a compaction input; the
    // next-oldest is evicted instead.
    let exclude: HashSet<u64> = [12u64].into_iter().collect();
    let mut state = db.inner.state.lock();
    let use_pmem = db
        .inner
        .pick_warm_residency(&mut state, 1, 22, Some(&exclude), 42)
        .unwrap();
    assert!(use_pmem);
    assert!(state.tiering.is_in_skiplist_set(12));
    assert!(state.tiering.is_in_file_set(22));
}

#[test]
fn test_lru_tiering_never_promotes_sst_inputs() {
    let dir = tempdir().unwrap();
    let db = Db::open(pmem_options(TieringOption::LruTiering), dir.path()).unwrap();

    let mut state = db.inner.state.lock();
    state.tiering.insert_into_file_set(7);
    let inputs: HashSet<u64> = [7u64].into_iter().collect();
    // one input already on disk: the output must not move back to PMEM.
    let use_pmem = db
        .inner
        .pick_warm_residency(&mut state, 1, 22, Some(&inputs), 42)
        .unwrap();
    assert!(!use_pmem);
}

#[test]
fn test_no_tiering_never_touches_pmem() {
    let dir = tempdir().unwrap();
    let db = Db::open(pmem_options(TieringOption::NoTiering), dir.path()).unwrap();
    for round in 0..3u32 {
        for i in 0..50u32 {
            db.put(
                format!("key{:04}", i).as_bytes(),
                format!("v{}", round).as_bytes(),
            )
            .unwrap();
        }
        db.flush_memtable().unwrap();
    }
    db.compact_range(None, None).unwrap();

    {
        let state = db.inner.state.lock();
        assert_eq!(state.tiering.skiplist_set_size(), 0);
        assert!(state.tiering.file_set_size() > 0);
    }
    assert!(!dump_version_entries(&db).is_empty());
}
