use std::sync::Arc;

use anyhow::Result;

use karstdb::storage::buffer::BufferPoolManager;
use karstdb::storage::disk::DiskManager;
use karstdb::storage::page::TablePage;
use karstdb::storage::table::TableHeap;
use karstdb::transaction::concurrency::{LockManager, TransactionManager};
use karstdb::transaction::wal::LogRecovery;

mod common;
use common::create_wal_engine;

#[test]
fn test_commit_is_durable_before_return() -> Result<()> {
    let (_disk, log_manager, buffer_pool, _file) = create_wal_engine(16)?;
    let lock_manager = Arc::new(LockManager::new(true));
    let manager = TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()));

    let setup = manager.begin();
    let table = TableHeap::new(
        buffer_pool,
        Some(lock_manager),
        Some(log_manager.clone()),
        &setup,
    )?;
    manager.commit(&setup)?;

    let txn = manager.begin();
    table.insert_tuple(&txn, b"durable")?;
    manager.commit(&txn)?;

    // the COMMIT record must be on stable storage before commit returns
    assert!(log_manager.persistent_lsn() >= txn.prev_lsn());

    log_manager.stop_flush_thread();
    Ok(())
}

/// Crash after one committed and one in-flight transaction: redo restores
/// both inserts, undo then erases the uncommitted one.
#[test]
fn test_crash_recovery_keeps_committed_loses_inflight() -> Result<()> {
    let file;
    let rid_committed;
    let rid_inflight;
    let inflight_id;
    {
        let (_disk, log_manager, buffer_pool, db_file) = create_wal_engine(16)?;
        let lock_manager = Arc::new(LockManager::new(true));
        let manager = TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()));

        let setup = manager.begin();
        let table = TableHeap::new(
            buffer_pool,
            Some(lock_manager),
            Some(log_manager.clone()),
            &setup,
        )?;
        manager.commit(&setup)?;

        let t1 = manager.begin();
        rid_committed = table.insert_tuple(&t1, b"alpha")?;
        manager.commit(&t1)?;

        let t2 = manager.begin();
        inflight_id = t2.id();
        rid_inflight = table.insert_tuple(&t2, b"beta")?;
        // the INSERT record reaches the log, the COMMIT never does
        log_manager.force_flush();
        log_manager.stop_flush_thread();

        // crash: drop everything without flushing any data page
        file = db_file;
    }

    // restart over the same files
    let disk_manager = Arc::new(DiskManager::new(file.path())?);
    let buffer_pool = Arc::new(BufferPoolManager::new(8, disk_manager.clone()));
    let mut recovery = LogRecovery::new(disk_manager.clone(), buffer_pool.clone());

    recovery.redo()?;
    assert_eq!(recovery.active_transactions(), vec![inflight_id]);
    recovery.undo()?;

    let page_ref = buffer_pool.fetch_page(rid_committed.page_id)?;
    {
        let page = page_ref.read();
        assert_eq!(
            TablePage::get_tuple(&page, rid_committed.slot),
            Some(b"alpha".to_vec())
        );
        assert_eq!(TablePage::get_tuple(&page, rid_inflight.slot), None);
    }
    buffer_pool.unpin_page(rid_committed.page_id, false)?;

    // recovery is idempotent: a second run reaches the same state
    let buffer_pool2 = Arc::new(BufferPoolManager::new(8, disk_manager.clone()));
    let mut recovery2 = LogRecovery::new(disk_manager, buffer_pool2.clone());
    recovery2.recover()?;

    let page_ref = buffer_pool2.fetch_page(rid_committed.page_id)?;
    {
        let page = page_ref.read();
        assert_eq!(
            TablePage::get_tuple(&page, rid_committed.slot),
            Some(b"alpha".to_vec())
        );
        assert_eq!(TablePage::get_tuple(&page, rid_inflight.slot), None);
    }
    buffer_pool2.unpin_page(rid_committed.page_id, false)?;
    Ok(())
}

#[test]
fn test_crash_recovery_rolls_back_mark_delete_and_update() -> Result<()> {
    let file;
    let rid_marked;
    let rid_updated;
    {
        let (_disk, log_manager, buffer_pool, db_file) = create_wal_engine(16)?;
        let lock_manager = Arc::new(LockManager::new(true));
        let manager = TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()));

        let setup = manager.begin();
        let table = TableHeap::new(
            buffer_pool,
            Some(lock_manager),
            Some(log_manager.clone()),
            &setup,
        )?;
        rid_marked = table.insert_tuple(&setup, b"survives")?;
        rid_updated = table.insert_tuple(&setup, b"original")?;
        manager.commit(&setup)?;

        // an in-flight transaction tombstones one tuple and rewrites the
        // other, then the process dies
        let t = manager.begin();
        table.mark_delete(&t, rid_marked)?;
        table.update_tuple(&t, rid_updated, b"scribble")?;
        log_manager.force_flush();
        log_manager.stop_flush_thread();
        file = db_file;
    }

    let disk_manager = Arc::new(DiskManager::new(file.path())?);
    let buffer_pool = Arc::new(BufferPoolManager::new(8, disk_manager.clone()));
    let mut recovery = LogRecovery::new(disk_manager, buffer_pool.clone());
    recovery.recover()?;

    let page_ref = buffer_pool.fetch_page(rid_marked.page_id)?;
    {
        let page = page_ref.read();
        // the tombstone was rolled back, the update undone
        assert_eq!(
            TablePage::get_tuple(&page, rid_marked.slot),
            Some(b"survives".to_vec())
        );
        assert_eq!(
            TablePage::get_tuple(&page, rid_updated.slot),
            Some(b"original".to_vec())
        );
    }
    buffer_pool.unpin_page(rid_marked.page_id, false)?;
    Ok(())
}

#[test]
fn test_runtime_abort_rolls_back_write_set() -> Result<()> {
    let (_disk, log_manager, buffer_pool, _file) = create_wal_engine(16)?;
    let lock_manager = Arc::new(LockManager::new(true));
    let manager = TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()));

    let setup = manager.begin();
    let table = TableHeap::new(
        buffer_pool.clone(),
        Some(lock_manager),
        Some(log_manager),
        &setup,
    )?;
    let rid_kept = table.insert_tuple(&setup, b"kept")?;
    manager.commit(&setup)?;

    let txn = manager.begin();
    let rid_new = table.insert_tuple(&txn, b"inserted")?;
    table.mark_delete(&txn, rid_kept)?;
    manager.abort(&txn)?;

    // the insert is gone, the delete rolled back
    let reader = manager.begin();
    assert_eq!(table.get_tuple(&reader, rid_new)?, None);
    assert_eq!(table.get_tuple(&reader, rid_kept)?, Some(b"kept".to_vec()));
    manager.commit(&reader)?;
    Ok(())
}

#[test]
fn test_recovery_on_empty_log_is_a_no_op() -> Result<()> {
    let file = tempfile::NamedTempFile::new()?;
    let disk_manager = Arc::new(DiskManager::new(file.path())?);
    let buffer_pool = Arc::new(BufferPoolManager::new(4, disk_manager.clone()));

    let mut recovery = LogRecovery::new(disk_manager, buffer_pool);
    recovery.recover()?;
    assert!(recovery.active_transactions().is_empty());
    Ok(())
}

#[test]
fn test_commit_applies_deferred_deletes() -> Result<()> {
    let (_disk, log_manager, buffer_pool, _file) = create_wal_engine(16)?;
    let lock_manager = Arc::new(LockManager::new(true));
    let manager = TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()));

    let setup = manager.begin();
    let table = TableHeap::new(
        buffer_pool.clone(),
        Some(lock_manager),
        Some(log_manager),
        &setup,
    )?;
    let rid = table.insert_tuple(&setup, b"doomed")?;
    manager.commit(&setup)?;

    let txn = manager.begin();
    table.mark_delete(&txn, rid)?;
    manager.commit(&txn)?;

    // after commit the page holds a real gap, not a tombstone
    let page_ref = buffer_pool.fetch_page(rid.page_id)?;
    {
        let page = page_ref.read();
        assert_eq!(TablePage::get_tuple(&page, rid.slot), None);
    }
    buffer_pool.unpin_page(rid.page_id, false)?;
    Ok(())
}

#[test]
fn test_aborted_insert_leaves_no_trace_after_crash() -> Result<()> {
    let file;
    let rid_aborted;
    {
        let (_disk, log_manager, buffer_pool, db_file) = create_wal_engine(16)?;
        let lock_manager = Arc::new(LockManager::new(true));
        let manager = TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()));

        let setup = manager.begin();
        let table = TableHeap::new(
            buffer_pool,
            Some(lock_manager),
            Some(log_manager.clone()),
            &setup,
        )?;
        manager.commit(&setup)?;

        // aborted before the crash: INSERT then ABORT are both in the log
        let txn = manager.begin();
        rid_aborted = table.insert_tuple(&txn, b"ghost")?;
        manager.abort(&txn)?;

        log_manager.stop_flush_thread();
        file = db_file;
    }

    let disk_manager = Arc::new(DiskManager::new(file.path())?);
    let buffer_pool = Arc::new(BufferPoolManager::new(8, disk_manager.clone()));
    let mut recovery = LogRecovery::new(disk_manager, buffer_pool.clone());
    recovery.recover()?;

    // the ABORT record keeps the transaction out of the undo set, and the
    // logged compensations erase the tuple during redo
    assert!(recovery.active_transactions().is_empty());
    let page_ref = buffer_pool.fetch_page(rid_aborted.page_id)?;
    {
        let page = page_ref.read();
        assert_eq!(TablePage::get_tuple(&page, rid_aborted.slot), None);
    }
    buffer_pool.unpin_page(rid_aborted.page_id, false)?;
    Ok(())
}
