//! Tree integration tests.
//!
//! Exercises the full path from block manager to in-memory pages:
//! - Bulk load, search and update for row and column stores
//! - Run-length expansions read back through the tree
//! - Generation bookkeeping across updates and checkpoints
//! - Checkpoint and reopen of a file-backed tree
//! - Corruption reporting for leaf and root pages

use bytes::Bytes;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

use cambium_cache::{Btree, BulkInput, EvictOutcome, Position, Update};
use cambium_common::{
    AllocationUnit, BtreeConfig, CacheConfig, CambiumError, Collaborators, StoreKind,
};
use cambium_storage::{BlockManager, FileBlockManager, FileBlockManagerConfig, MemBlockManager};

// =============================================================================
// Helpers
// =============================================================================

fn small_config() -> BtreeConfig {
    BtreeConfig {
        leaf_page_min: 512,
        leaf_page_max: 1024,
        internal_page_min: 512,
        internal_page_max: 512,
        overflow_threshold: 200,
        ..Default::default()
    }
}

fn key(i: u32) -> Bytes {
    Bytes::from(format!("key{:05}", i))
}

fn value(i: u32) -> Bytes {
    Bytes::from(format!("value-{}", i))
}

fn rows(n: u32) -> Vec<(Bytes, Bytes)> {
    (0..n).map(|i| (key(i), value(i))).collect()
}

fn row_tree(n: u32) -> (Btree, Arc<MemBlockManager>) {
    let blocks = Arc::new(MemBlockManager::new(AllocationUnit::default()));
    let tree = Btree::bulk_load(
        small_config(),
        CacheConfig::default(),
        blocks.clone(),
        Collaborators::default(),
        BulkInput::Rows(rows(n)),
    )
    .unwrap();
    (tree, blocks)
}

// =============================================================================
// Row store
// =============================================================================

#[test]
fn test_row_store_reads_every_key() {
    let (tree, _) = row_tree(3000);
    let session = tree.session().unwrap();
    for i in 0..3000 {
        assert_eq!(tree.get(&session, &key(i)).unwrap(), Some(value(i)), "key {}", i);
    }
    assert_eq!(tree.get(&session, b"key99999").unwrap(), None);
    assert_eq!(tree.get(&session, b"").unwrap(), None);
    assert_eq!(session.held(), 0);
}

#[test]
fn test_write_generation_is_monotonic() {
    let (tree, _) = row_tree(100);
    let session = tree.session().unwrap();

    let initial = tree.search_row(&session, &key(10)).unwrap().write_gen;
    let mut last = initial;
    for n in 1..=5u32 {
        let gen = tree
            .update(&session, &key(10 + n), Update::Put(Bytes::from(format!("v{}", n))))
            .unwrap();
        assert_eq!(gen, last + 1);
        last = gen;
    }
    assert_eq!(last, initial + 5);

    tree.checkpoint().unwrap();
    let found = tree.search_row(&session, &key(10)).unwrap();
    assert_eq!(found.guard.disk_gen(), found.guard.write_gen());
    assert_eq!(found.guard.write_gen(), last);
}

#[test]
fn test_stale_update_is_rejected() {
    let (tree, _) = row_tree(100);
    let session = tree.session().unwrap();

    let stale = tree.search_row(&session, &key(20)).unwrap();
    tree.update(&session, &key(21), Update::Put(Bytes::from_static(b"winner")))
        .unwrap();

    let before = tree.get(&session, &key(20)).unwrap();
    let ticket = tree.write_path().enter();
    let err = stale
        .guard
        .apply_update(
            &ticket,
            stale.position,
            Update::Put(Bytes::from_static(b"loser")),
            stale.write_gen,
        )
        .unwrap_err();
    drop(ticket);
    assert!(matches!(err, CambiumError::StaleVersion { expected: 0, current: 1 }));
    assert!(err.is_retryable());
    assert_eq!(tree.get(&session, &key(20)).unwrap(), before);
    assert_eq!(stale.guard.write_gen(), 1);
}

#[test]
fn test_duplicates_and_overflow_values() {
    let blocks = Arc::new(MemBlockManager::new(AllocationUnit::default()));
    let big = Bytes::from(vec![b'z'; 1500]);
    let mut input = rows(50);
    input.push((Bytes::from_static(b"big"), big.clone()));
    for i in 0..400u32 {
        input.push((Bytes::from_static(b"many"), Bytes::from(format!("dup{:04}", i))));
    }
    input.push((Bytes::from_static(b"pair"), Bytes::from_static(b"first")));
    input.push((Bytes::from_static(b"pair"), Bytes::from_static(b"second")));

    let tree = Btree::bulk_load(
        small_config(),
        CacheConfig::default(),
        blocks,
        Collaborators::default(),
        BulkInput::Rows(input),
    )
    .unwrap();
    let session = tree.session().unwrap();

    assert_eq!(tree.get(&session, b"big").unwrap(), Some(big));
    assert_eq!(
        tree.get_duplicates(&session, b"pair").unwrap(),
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );
    let many = tree.get_duplicates(&session, b"many").unwrap();
    assert_eq!(many.len(), 400);
    assert_eq!(many[0], Bytes::from_static(b"dup0000"));
    assert_eq!(many[399], Bytes::from_static(b"dup0399"));
    assert_eq!(
        tree.get(&session, b"many").unwrap(),
        Some(Bytes::from_static(b"dup0000"))
    );

    // The first duplicate of a pair can be deleted; the next one shows through.
    tree.update(&session, b"pair", Update::Delete).unwrap();
    assert_eq!(
        tree.get(&session, b"pair").unwrap(),
        Some(Bytes::from_static(b"second"))
    );
    // Duplicate trees are not updated in place.
    assert!(tree.update(&session, b"many", Update::Delete).is_err());
}

#[test]
fn test_overflow_value_survives_update_and_checkpoint() {
    let (tree, blocks) = row_tree(200);
    let session = tree.session().unwrap();
    let big = Bytes::from(vec![7u8; 4000]);

    tree.update(&session, &key(5), Update::Put(big.clone())).unwrap();
    tree.checkpoint().unwrap();
    let live = blocks.block_count();

    tree.update(&session, &key(5), Update::Put(Bytes::from_static(b"small")))
        .unwrap();
    tree.checkpoint().unwrap();
    // The overflow page is freed once the value no longer needs it.
    assert!(blocks.block_count() < live);
    assert_eq!(
        tree.get(&session, &key(5)).unwrap(),
        Some(Bytes::from_static(b"small"))
    );
}

// =============================================================================
// Column stores
// =============================================================================

#[test]
fn test_variable_column_store() {
    let blocks = Arc::new(MemBlockManager::new(AllocationUnit::default()));
    let config = BtreeConfig {
        store: StoreKind::ColumnVariable,
        ..small_config()
    };
    let records = (0..1500u32)
        .map(|i| (i % 10 != 3).then(|| Bytes::from(format!("record {}", i))))
        .collect();
    let tree = Btree::bulk_load(
        config,
        CacheConfig::default(),
        blocks,
        Collaborators::default(),
        BulkInput::Records(records),
    )
    .unwrap();
    let session = tree.session().unwrap();

    assert_eq!(
        tree.get_col(&session, 1).unwrap(),
        Some(Bytes::from_static(b"record 0"))
    );
    assert_eq!(tree.get_col(&session, 4).unwrap(), None);
    assert_eq!(
        tree.get_col(&session, 1500).unwrap(),
        Some(Bytes::from_static(b"record 1499"))
    );
    assert_eq!(tree.get_col(&session, 1501).unwrap(), None);
    assert_eq!(tree.get_col(&session, 0).unwrap(), None);

    tree.update_col(&session, 4, Update::Put(Bytes::from_static(b"restored")))
        .unwrap();
    tree.update_col(&session, 700, Update::Delete).unwrap();
    assert!(matches!(
        tree.update_col(&session, 1501, Update::Delete),
        Err(CambiumError::KeyNotFound)
    ));
    tree.checkpoint().unwrap();
    assert_eq!(tree.descriptor().records, 1500);
    assert_eq!(
        tree.get_col(&session, 4).unwrap(),
        Some(Bytes::from_static(b"restored"))
    );
    assert_eq!(tree.get_col(&session, 700).unwrap(), None);
}

#[test]
fn test_rle_expansion_through_the_tree() {
    let blocks = Arc::new(MemBlockManager::new(AllocationUnit::default()));
    let config = BtreeConfig {
        store: StoreKind::ColumnFixed,
        fixed_len: 1,
        run_length_encoding: true,
        recno_offset: 100,
        ..small_config()
    };
    let records = vec![Some(Bytes::from_static(b"V")); 10];
    let tree = Btree::bulk_load(
        config.clone(),
        CacheConfig::default(),
        blocks.clone(),
        Collaborators::default(),
        BulkInput::Records(records),
    )
    .unwrap();
    let session = tree.session().unwrap();

    tree.update_col(&session, 104, Update::Put(Bytes::from_static(b"W")))
        .unwrap();
    for recno in 100..110 {
        let expected: &[u8] = if recno == 104 { b"W" } else { b"V" };
        assert_eq!(
            tree.get_col(&session, recno).unwrap().as_deref(),
            Some(expected),
            "record {}",
            recno
        );
    }

    let found = tree.search_col(&session, 104).unwrap();
    assert_eq!(found.position, Position::Record(104));
    assert_eq!(found.guard.entries(), 1);
    drop(found);

    tree.update_col(&session, 109, Update::Delete).unwrap();
    assert_eq!(tree.get_col(&session, 109).unwrap(), None);
    assert!(matches!(
        tree.update_col(&session, 100, Update::Put(Bytes::from_static(b"too long"))),
        Err(CambiumError::Size { .. })
    ));

    tree.checkpoint().unwrap();
    drop(session);
    drop(tree);

    let tree = Btree::open(config, CacheConfig::default(), blocks, Collaborators::default())
        .unwrap();
    let session = tree.session().unwrap();
    let found = tree.search_col(&session, 104).unwrap();
    // V x4, W, V x4, deleted
    assert_eq!(found.guard.entries(), 4);
    drop(found);
    assert_eq!(tree.get_col(&session, 103).unwrap().as_deref(), Some(&b"V"[..]));
    assert_eq!(tree.get_col(&session, 104).unwrap().as_deref(), Some(&b"W"[..]));
    assert_eq!(tree.get_col(&session, 109).unwrap(), None);
}

// =============================================================================
// Page-in race
// =============================================================================

#[test]
fn test_concurrent_page_in_publishes_one_copy() {
    let (tree, _) = row_tree(3000);
    let tree = Arc::new(tree);
    let readers = 8;
    let barrier = Arc::new(Barrier::new(readers));

    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let session = tree.session().unwrap();
                barrier.wait();
                tree.get(&session, &key(1234)).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some(value(1234)));
    }

    let stats = tree.stats();
    let below_root = (tree.resident_pages() - 1) as u64;
    assert_eq!(stats.page_ins, below_root);
    assert_eq!(stats.active_hazards, 0);
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_checkpoint_and_reopen_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.cam");
    let file_config = || FileBlockManagerConfig {
        fsync_enabled: false,
        ..FileBlockManagerConfig::new(&path, AllocationUnit::default())
    };

    let free_before;
    {
        let blocks = Arc::new(FileBlockManager::open(file_config()).unwrap());
        let tree = Btree::bulk_load(
            small_config(),
            CacheConfig::default(),
            blocks.clone(),
            Collaborators::default(),
            BulkInput::Rows(rows(1000)),
        )
        .unwrap();
        let session = tree.session().unwrap();
        for i in (0..1000).step_by(7) {
            tree.update(&session, &key(i), Update::Put(Bytes::from(format!("updated-{}", i))))
                .unwrap();
        }
        tree.update(&session, &key(500), Update::Delete).unwrap();
        assert!(tree.checkpoint().unwrap() > 0);
        free_before = blocks.free_extents();
        assert!(!free_before.is_empty());
    }

    let blocks = Arc::new(FileBlockManager::open(file_config()).unwrap());
    assert!(!blocks.is_new());
    let tree = Btree::open(
        BtreeConfig::default(),
        CacheConfig::default(),
        blocks.clone(),
        Collaborators::default(),
    )
    .unwrap();
    assert_eq!(tree.config().leaf_page_max, 1024);
    assert_eq!(blocks.free_extents(), free_before);

    let session = tree.session().unwrap();
    for i in 0..1000 {
        let expected = if i == 500 {
            None
        } else if i % 7 == 0 {
            Some(Bytes::from(format!("updated-{}", i)))
        } else {
            Some(value(i))
        };
        assert_eq!(tree.get(&session, &key(i)).unwrap(), expected, "key {}", i);
    }
}

#[test]
fn test_open_rejects_wrong_store_kind() {
    let blocks = Arc::new(MemBlockManager::new(AllocationUnit::default()));
    drop(
        Btree::create(
            small_config(),
            CacheConfig::default(),
            blocks.clone(),
            Collaborators::default(),
        )
        .unwrap(),
    );
    let config = BtreeConfig {
        store: StoreKind::ColumnVariable,
        ..small_config()
    };
    let err = Btree::open(config, CacheConfig::default(), blocks, Collaborators::default())
        .unwrap_err();
    assert!(matches!(err, CambiumError::Format(_)));
}

// =============================================================================
// Corruption
// =============================================================================

#[test]
fn test_corrupt_leaf_fails_locally() {
    let (tree, blocks) = row_tree(3000);
    let session = tree.session().unwrap();

    let found = tree.search_row(&session, &key(42)).unwrap();
    let parent = found.guard.parent().unwrap();
    let slot = found.guard.parent_slot();
    drop(found);
    let r = parent.child(slot).unwrap();
    assert_eq!(tree.evict(r).unwrap(), EvictOutcome::Evicted);

    blocks.corrupt(r.location().addr, 40, 0xff).unwrap();
    let err = tree.get(&session, &key(42)).unwrap_err();
    assert!(matches!(err, CambiumError::Corruption { .. }));
    assert!(!err.is_fatal_to_file());
    assert!(!r.is_resident());

    assert_eq!(tree.get(&session, &key(2999)).unwrap(), Some(value(2999)));
}

#[test]
fn test_corrupt_root_is_fatal() {
    let (tree, blocks) = row_tree(3000);
    let root = tree.descriptor().root_addr;
    drop(tree);

    blocks.corrupt(root, 30, 0x01).unwrap();
    let err = Btree::open(
        small_config(),
        CacheConfig::default(),
        blocks,
        Collaborators::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CambiumError::Format(_)));
    assert!(err.is_fatal_to_file());
}
