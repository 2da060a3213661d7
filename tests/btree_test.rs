use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::thread;

use karstdb::common::types::Rid;
use karstdb::index::btree::BPlusTree;
use karstdb::storage::page::PageKind;

mod common;
use common::create_test_buffer_pool;

#[test]
fn test_duplicate_insert_is_rejected() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(16)?;
    let btree = BPlusTree::<i64>::new("dup_test", buffer_pool)?;

    assert!(btree.insert(5, Rid::new(5, 0), None)?);
    assert!(!btree.insert(5, Rid::new(5, 1), None)?);
    assert_eq!(btree.get_value(&5)?, Some(Rid::new(5, 0)));
    Ok(())
}

#[test]
fn test_sequential_fill_and_split() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(64)?;
    let btree = BPlusTree::<i64>::new("seq_test", buffer_pool.clone())?;

    // enough keys to overflow a single leaf several times over
    let n: i64 = 1000;
    for key in 1..=n {
        assert!(btree.insert(key, Rid::new(0, key as u32), None)?);
    }

    // the root must have become an internal page
    let root_id = btree.root_page_id();
    let root = buffer_pool.fetch_page(root_id)?;
    let kind = PageKind::from_u8(root.read().data[0]);
    buffer_pool.unpin_page(root_id, false)?;
    assert_eq!(kind, PageKind::BTreeInternal);

    // the sibling chain yields 1..=n in ascending order
    let keys: Vec<i64> = btree.iter()?.map(|(key, _)| key).collect();
    let expected: Vec<i64> = (1..=n).collect();
    assert_eq!(keys, expected);

    btree.verify_integrity()?;
    Ok(())
}

#[test]
fn test_point_lookups_after_shuffled_inserts() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(64)?;
    let btree = BPlusTree::<i64>::new("shuffle_test", buffer_pool)?;

    let mut rng = rand::rngs::StdRng::seed_from_u64(0xB17E);
    let mut keys: Vec<i64> = (0..2000).collect();
    keys.shuffle(&mut rng);

    for &key in &keys {
        btree.insert(key, Rid::new((key / 100) as u32, (key % 100) as u32), None)?;
    }
    btree.verify_integrity()?;

    for &key in &keys {
        assert_eq!(
            btree.get_value(&key)?,
            Some(Rid::new((key / 100) as u32, (key % 100) as u32)),
            "key {} lost",
            key
        );
    }
    assert_eq!(btree.get_value(&-1)?, None);
    assert_eq!(btree.get_value(&2000)?, None);
    Ok(())
}

#[test]
fn test_delete_with_merges_down_to_empty() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(64)?;
    let btree = BPlusTree::<i64>::new("delete_test", buffer_pool)?;

    let n: i64 = 1500;
    for key in 0..n {
        btree.insert(key, Rid::new(0, key as u32), None)?;
    }

    // removing a missing key is a silent no-op
    btree.remove(&(n + 10), None)?;
    btree.verify_integrity()?;

    let mut rng = rand::rngs::StdRng::seed_from_u64(0xDE1E7E);
    let mut keys: Vec<i64> = (0..n).collect();
    keys.shuffle(&mut rng);

    for (i, &key) in keys.iter().enumerate() {
        btree.remove(&key, None)?;
        // spot-check structure a few times along the way
        if i % 500 == 0 {
            btree.verify_integrity()?;
        }
        assert_eq!(btree.get_value(&key)?, None);
    }

    assert!(btree.is_empty());
    assert_eq!(btree.iter()?.count(), 0);

    // the tree is usable again after emptying
    assert!(btree.insert(42, Rid::new(0, 42), None)?);
    assert_eq!(btree.get_value(&42)?, Some(Rid::new(0, 42)));
    Ok(())
}

#[test]
fn test_root_collapse_and_regrowth() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(64)?;
    let btree = BPlusTree::<i64>::new("collapse_test", buffer_pool)?;

    // grow to two levels, then shrink back to a single leaf root
    let n: i64 = 600;
    for key in 0..n {
        btree.insert(key, Rid::new(0, key as u32), None)?;
    }
    for key in 10..n {
        btree.remove(&key, None)?;
    }
    btree.verify_integrity()?;

    let keys: Vec<i64> = btree.iter()?.map(|(key, _)| key).collect();
    let expected: Vec<i64> = (0..10).collect();
    assert_eq!(keys, expected);
    Ok(())
}

#[test]
fn test_iter_from_starts_at_bound() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(64)?;
    let btree = BPlusTree::<i64>::new("range_test", buffer_pool)?;

    for key in (0..1000i64).step_by(2) {
        btree.insert(key, Rid::new(0, key as u32), None)?;
    }

    // exact hit
    let from_100: Vec<i64> = btree.iter_from(&100)?.take(3).map(|(key, _)| key).collect();
    assert_eq!(from_100, vec![100, 102, 104]);

    // between keys: starts at the next larger
    let from_101: Vec<i64> = btree.iter_from(&101)?.take(3).map(|(key, _)| key).collect();
    assert_eq!(from_101, vec![102, 104, 106]);

    // past the end
    assert_eq!(btree.iter_from(&9999)?.count(), 0);
    Ok(())
}

#[test]
fn test_reopen_finds_root_via_header_page() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(64)?;
    {
        let btree = BPlusTree::<i64>::new("persistent_index", buffer_pool.clone())?;
        for key in 0..400i64 {
            btree.insert(key, Rid::new(0, key as u32), None)?;
        }
    }

    // a second handle on the same pool resolves the root by name
    let reopened = BPlusTree::<i64>::new("persistent_index", buffer_pool)?;
    assert!(!reopened.is_empty());
    assert_eq!(reopened.get_value(&123)?, Some(Rid::new(0, 123)));
    reopened.verify_integrity()?;
    Ok(())
}

#[test]
fn test_concurrent_disjoint_inserts() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(128)?;
    let btree = Arc::new(BPlusTree::<i64>::new("concurrent_test", buffer_pool)?);

    let threads = 4;
    let per_thread: i64 = 500;
    let mut handles = Vec::new();
    for t in 0..threads {
        let btree = btree.clone();
        handles.push(thread::spawn(move || {
            for i in 0..per_thread {
                let key = t as i64 * per_thread + i;
                btree
                    .insert(key, Rid::new(0, key as u32), None)
                    .expect("insert failed");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    btree.verify_integrity()?;
    let total = threads as i64 * per_thread;
    let keys: Vec<i64> = btree.iter()?.map(|(key, _)| key).collect();
    let expected: Vec<i64> = (0..total).collect();
    assert_eq!(keys, expected);
    Ok(())
}
