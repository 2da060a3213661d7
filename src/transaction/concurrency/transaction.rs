use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, PageId, Rid, TxnId, INVALID_LSN};
use crate::storage::buffer::BufferPoolError;
use crate::storage::page::PageError;
use crate::storage::table::TableHeap;

/// Two-phase locking lifecycle. GROWING until the first (non-upgrading,
/// non-strict) unlock, then SHRINKING; COMMITTED and ABORTED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} was aborted")]
    Aborted(TxnId),

    #[error("Page error: {0}")]
    PageError(#[from] PageError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),
}

/// What a transaction did to one tuple, with enough state to undo it.
pub enum WriteOp {
    Insert,
    Update { old_tuple: Vec<u8> },
    Delete { old_tuple: Vec<u8> },
}

/// One write-set entry: undone (abort) or finalized (commit) in LIFO order.
pub struct WriteRecord {
    pub rid: Rid,
    pub op: WriteOp,
    pub table: Arc<TableHeap>,
}

/// An active transaction handle, shared between the caller, the lock
/// manager (which may abort it) and the table heap (which feeds its write
/// set).
pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    prev_lsn: AtomicU32,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    write_set: Mutex<Vec<WriteRecord>>,
    deleted_page_set: Mutex<HashSet<PageId>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Growing),
            prev_lsn: AtomicU32::new(INVALID_LSN),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
            deleted_page_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn.load(Ordering::Acquire)
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.prev_lsn.store(lsn, Ordering::Release);
    }

    pub fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub fn holds_shared(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn holds_exclusive(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    /// Union of both lock sets, for release at commit/abort.
    pub fn locked_rids(&self) -> Vec<Rid> {
        let mut rids: HashSet<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids.into_iter().collect()
    }

    pub fn push_write(&self, record: WriteRecord) {
        self.write_set.lock().push(record);
    }

    /// Pop the most recent write (LIFO).
    pub fn pop_write(&self) -> Option<WriteRecord> {
        self.write_set.lock().pop()
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().len()
    }

    /// B+ tree pages emptied during this operation, freed once all latches
    /// are released.
    pub fn add_deleted_page(&self, page_id: PageId) {
        self.deleted_page_set.lock().insert(page_id);
    }

    pub fn take_deleted_pages(&self) -> Vec<PageId> {
        self.deleted_page_set.lock().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.prev_lsn(), INVALID_LSN);
        assert_eq!(txn.write_set_len(), 0);
    }

    #[test]
    fn test_lock_set_union() {
        let txn = Transaction::new(2);
        txn.add_shared_lock(Rid::new(0, 0));
        txn.add_shared_lock(Rid::new(0, 1));
        txn.add_exclusive_lock(Rid::new(0, 1));
        txn.add_exclusive_lock(Rid::new(1, 0));

        let mut rids = txn.locked_rids();
        rids.sort();
        assert_eq!(rids, vec![Rid::new(0, 0), Rid::new(0, 1), Rid::new(1, 0)]);
    }

    #[test]
    fn test_deleted_pages_drain() {
        let txn = Transaction::new(3);
        txn.add_deleted_page(5);
        txn.add_deleted_page(5);
        txn.add_deleted_page(9);

        let mut pages = txn.take_deleted_pages();
        pages.sort();
        assert_eq!(pages, vec![5, 9]);
        assert!(txn.take_deleted_pages().is_empty());
    }
}
