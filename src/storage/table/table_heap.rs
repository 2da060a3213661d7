use std::sync::Arc;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{PageError, TablePage};
use crate::transaction::concurrency::{
    LockManager, Transaction, TransactionError, WriteOp, WriteRecord,
};
use crate::transaction::wal::{LogManager, LogPayload, LogRecord};

/// Tuple storage over a chain of slotted table pages.
///
/// Data operations take tuple locks through the lock manager before
/// touching a page, append the matching log record while the page latch is
/// held, stamp the page LSN, and push an undo entry onto the transaction's
/// write set. The rollback helpers (`apply_delete`, `rollback_delete`,
/// `rollback_update`) assume the caller already holds the exclusive lock;
/// they run during commit/abort when new acquisition is no longer legal.
pub struct TableHeap {
    buffer_pool: Arc<BufferPoolManager>,
    lock_manager: Option<Arc<LockManager>>,
    log_manager: Option<Arc<LogManager>>,
    first_page_id: PageId,
    /// Serializes page-chain extension.
    extend_latch: Mutex<()>,
}

impl TableHeap {
    /// Create a heap with its first, empty table page. The page allocation
    /// is logged as NEWPAGE under the creating transaction.
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        lock_manager: Option<Arc<LockManager>>,
        log_manager: Option<Arc<LogManager>>,
        txn: &Transaction,
    ) -> Result<Arc<Self>, TransactionError> {
        let (page_ref, first_page_id) = buffer_pool.new_page()?;

        let heap = Self {
            buffer_pool: buffer_pool.clone(),
            lock_manager,
            log_manager,
            first_page_id,
            extend_latch: Mutex::new(()),
        };

        {
            let mut page = page_ref.write();
            TablePage::init(&mut page, INVALID_PAGE_ID);
            if let Some(log_manager) = heap.logging() {
                let mut record = LogRecord::new(
                    txn.id(),
                    txn.prev_lsn(),
                    LogPayload::NewPage {
                        prev_page_id: INVALID_PAGE_ID,
                    },
                );
                let lsn = log_manager.append_log_record(&mut record);
                txn.set_prev_lsn(lsn);
                page.lsn = lsn;
            }
        }
        buffer_pool.unpin_page(first_page_id, true)?;

        Ok(Arc::new(heap))
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    fn logging(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref().filter(|lm| lm.is_enabled())
    }

    /// Take (or upgrade to) the exclusive tuple lock.
    fn lock_exclusive_for(&self, txn: &Transaction, rid: Rid) -> Result<(), TransactionError> {
        let Some(lock_manager) = &self.lock_manager else {
            return Ok(());
        };
        if txn.holds_exclusive(rid) {
            return Ok(());
        }
        let granted = if txn.holds_shared(rid) {
            lock_manager.lock_upgrade(txn, rid)
        } else {
            lock_manager.lock_exclusive(txn, rid)
        };
        if granted {
            Ok(())
        } else {
            Err(TransactionError::Aborted(txn.id()))
        }
    }

    /// Insert a tuple, extending the page chain when the tail fills up.
    /// The new tuple is exclusively locked by `txn`.
    pub fn insert_tuple(
        self: &Arc<Self>,
        txn: &Transaction,
        tuple: &[u8],
    ) -> Result<Rid, TransactionError> {
        let mut page_id = self.first_page_id;

        let rid = loop {
            let page_ref = self.buffer_pool.fetch_page(page_id)?;
            let mut page = page_ref.write();

            if let Some(slot) = TablePage::insert_tuple(&mut page, tuple) {
                let rid = Rid::new(page_id, slot);
                if let Some(log_manager) = self.logging() {
                    let mut record = LogRecord::new(
                        txn.id(),
                        txn.prev_lsn(),
                        LogPayload::Insert {
                            rid,
                            tuple: tuple.to_vec(),
                        },
                    );
                    let lsn = log_manager.append_log_record(&mut record);
                    txn.set_prev_lsn(lsn);
                    page.lsn = lsn;
                }
                drop(page);
                self.buffer_pool.unpin_page(page_id, true)?;
                break rid;
            }

            let next = TablePage::next_page_id(&page);
            drop(page);
            self.buffer_pool.unpin_page(page_id, false)?;

            if next != INVALID_PAGE_ID {
                page_id = next;
                continue;
            }
            page_id = self.extend_chain(txn, page_id)?;
        };

        // the write record goes in before the lock attempt, so a wait-die
        // abort still rolls the physical insert back
        txn.push_write(WriteRecord {
            rid,
            op: WriteOp::Insert,
            table: Arc::clone(self),
        });
        self.lock_exclusive_for(txn, rid)?;
        Ok(rid)
    }

    /// Append a fresh page after `tail`, returning the page to retry the
    /// insert on (the existing successor if another thread extended first).
    fn extend_chain(&self, txn: &Transaction, tail: PageId) -> Result<PageId, TransactionError> {
        let _guard = self.extend_latch.lock();

        let tail_ref = self.buffer_pool.fetch_page(tail)?;
        {
            let page = tail_ref.read();
            let next = TablePage::next_page_id(&page);
            if next != INVALID_PAGE_ID {
                drop(page);
                self.buffer_pool.unpin_page(tail, false)?;
                return Ok(next);
            }
        }

        let (new_ref, new_page_id) = match self.buffer_pool.new_page() {
            Ok(ok) => ok,
            Err(e) => {
                self.buffer_pool.unpin_page(tail, false)?;
                return Err(e.into());
            }
        };

        {
            let mut new_page = new_ref.write();
            TablePage::init(&mut new_page, tail);
            if let Some(log_manager) = self.logging() {
                let mut record = LogRecord::new(
                    txn.id(),
                    txn.prev_lsn(),
                    LogPayload::NewPage { prev_page_id: tail },
                );
                let lsn = log_manager.append_log_record(&mut record);
                txn.set_prev_lsn(lsn);
                new_page.lsn = lsn;
            }
        }
        {
            let mut tail_page = tail_ref.write();
            TablePage::set_next_page_id(&mut tail_page, new_page_id);
        }

        self.buffer_pool.unpin_page(tail, true)?;
        self.buffer_pool.unpin_page(new_page_id, true)?;
        Ok(new_page_id)
    }

    /// Read a tuple under a shared lock.
    pub fn get_tuple(
        &self,
        txn: &Transaction,
        rid: Rid,
    ) -> Result<Option<Vec<u8>>, TransactionError> {
        if let Some(lock_manager) = &self.lock_manager {
            if !txn.holds_shared(rid)
                && !txn.holds_exclusive(rid)
                && !lock_manager.lock_shared(txn, rid)
            {
                return Err(TransactionError::Aborted(txn.id()));
            }
        }

        let page_ref = self.buffer_pool.fetch_page(rid.page_id)?;
        let tuple = {
            let page = page_ref.read();
            TablePage::get_tuple(&page, rid.slot)
        };
        self.buffer_pool.unpin_page(rid.page_id, false)?;
        Ok(tuple)
    }

    /// Tombstone a tuple. The physical gap is only created at commit, when
    /// the deferred delete is applied.
    pub fn mark_delete(self: &Arc<Self>, txn: &Transaction, rid: Rid) -> Result<(), TransactionError> {
        self.lock_exclusive_for(txn, rid)?;

        let page_ref = self.buffer_pool.fetch_page(rid.page_id)?;
        let old_tuple;
        {
            let mut page = page_ref.write();
            let Some(tuple) = TablePage::get_tuple(&page, rid.slot) else {
                drop(page);
                self.buffer_pool.unpin_page(rid.page_id, false)?;
                return Err(TransactionError::PageError(PageError::TupleNotFound));
            };
            old_tuple = tuple;
            TablePage::mark_delete(&mut page, rid.slot);
            if let Some(log_manager) = self.logging() {
                let mut record =
                    LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::MarkDelete { rid });
                let lsn = log_manager.append_log_record(&mut record);
                txn.set_prev_lsn(lsn);
                page.lsn = lsn;
            }
        }
        self.buffer_pool.unpin_page(rid.page_id, true)?;

        txn.push_write(WriteRecord {
            rid,
            op: WriteOp::Delete { old_tuple },
            table: Arc::clone(self),
        });
        Ok(())
    }

    /// Overwrite a tuple in place, keeping its before-image in the write set.
    pub fn update_tuple(
        self: &Arc<Self>,
        txn: &Transaction,
        rid: Rid,
        tuple: &[u8],
    ) -> Result<(), TransactionError> {
        self.lock_exclusive_for(txn, rid)?;

        let page_ref = self.buffer_pool.fetch_page(rid.page_id)?;
        let old_tuple;
        {
            let mut page = page_ref.write();
            old_tuple = match TablePage::update_tuple(&mut page, rid.slot, tuple) {
                Ok(old) => old,
                Err(e) => {
                    drop(page);
                    self.buffer_pool.unpin_page(rid.page_id, false)?;
                    return Err(e.into());
                }
            };
            if let Some(log_manager) = self.logging() {
                let mut record = LogRecord::new(
                    txn.id(),
                    txn.prev_lsn(),
                    LogPayload::Update {
                        rid,
                        old_tuple: old_tuple.clone(),
                        new_tuple: tuple.to_vec(),
                    },
                );
                let lsn = log_manager.append_log_record(&mut record);
                txn.set_prev_lsn(lsn);
                page.lsn = lsn;
            }
        }
        self.buffer_pool.unpin_page(rid.page_id, true)?;

        txn.push_write(WriteRecord {
            rid,
            op: WriteOp::Update { old_tuple },
            table: Arc::clone(self),
        });
        Ok(())
    }

    /// Physically vacate a slot: commit-time finalization of a mark-delete,
    /// or abort-time reversal of an insert. Lock already held.
    pub fn apply_delete(&self, txn: &Transaction, rid: Rid) -> Result<(), TransactionError> {
        let page_ref = self.buffer_pool.fetch_page(rid.page_id)?;
        {
            let mut page = page_ref.write();
            let Some(old) = TablePage::apply_delete(&mut page, rid.slot) else {
                warn!("apply_delete: nothing at {}", rid);
                drop(page);
                self.buffer_pool.unpin_page(rid.page_id, false)?;
                return Ok(());
            };
            if let Some(log_manager) = self.logging() {
                let mut record = LogRecord::new(
                    txn.id(),
                    txn.prev_lsn(),
                    LogPayload::ApplyDelete { rid, tuple: old },
                );
                let lsn = log_manager.append_log_record(&mut record);
                txn.set_prev_lsn(lsn);
                page.lsn = lsn;
            }
        }
        self.buffer_pool.unpin_page(rid.page_id, true)?;
        Ok(())
    }

    /// Clear a tombstone during abort. Lock already held.
    pub fn rollback_delete(&self, txn: &Transaction, rid: Rid) -> Result<(), TransactionError> {
        debug!("rollback delete at {}", rid);
        let page_ref = self.buffer_pool.fetch_page(rid.page_id)?;
        {
            let mut page = page_ref.write();
            TablePage::rollback_delete(&mut page, rid.slot);
            if let Some(log_manager) = self.logging() {
                let mut record =
                    LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::RollbackDelete { rid });
                let lsn = log_manager.append_log_record(&mut record);
                txn.set_prev_lsn(lsn);
                page.lsn = lsn;
            }
        }
        self.buffer_pool.unpin_page(rid.page_id, true)?;
        Ok(())
    }

    /// Write a before-image back during abort. Lock already held; the
    /// compensation is logged as a regular update with the images swapped.
    pub fn rollback_update(
        &self,
        txn: &Transaction,
        rid: Rid,
        old_tuple: &[u8],
    ) -> Result<(), TransactionError> {
        debug!("rollback update at {}", rid);
        let page_ref = self.buffer_pool.fetch_page(rid.page_id)?;
        {
            let mut page = page_ref.write();
            let current = match TablePage::update_tuple(&mut page, rid.slot, old_tuple) {
                Ok(current) => current,
                Err(e) => {
                    warn!("rollback update at {} skipped: {}", rid, e);
                    drop(page);
                    self.buffer_pool.unpin_page(rid.page_id, false)?;
                    return Ok(());
                }
            };
            if let Some(log_manager) = self.logging() {
                let mut record = LogRecord::new(
                    txn.id(),
                    txn.prev_lsn(),
                    LogPayload::Update {
                        rid,
                        old_tuple: current,
                        new_tuple: old_tuple.to_vec(),
                    },
                );
                let lsn = log_manager.append_log_record(&mut record);
                txn.set_prev_lsn(lsn);
                page.lsn = lsn;
            }
        }
        self.buffer_pool.unpin_page(rid.page_id, true)?;
        Ok(())
    }
}
