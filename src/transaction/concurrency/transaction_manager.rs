use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use log::debug;

use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    Transaction, TransactionError, TransactionState, WriteOp,
};
use crate::transaction::wal::{LogManager, LogPayload, LogRecord};

/// Owns the transaction lifecycle: id assignment, BEGIN/COMMIT/ABORT
/// records, write-set finalization or rollback, and lock release.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, log_manager: Option<Arc<LogManager>>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            log_manager,
        }
    }

    fn logging(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref().filter(|lm| lm.is_enabled())
    }

    /// Start a new transaction in GROWING state.
    pub fn begin(&self) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id));

        if let Some(log_manager) = self.logging() {
            let mut record = LogRecord::new(txn_id, txn.prev_lsn(), LogPayload::Begin);
            let lsn = log_manager.append_log_record(&mut record);
            txn.set_prev_lsn(lsn);
        }
        txn
    }

    /// Commit: finalize deferred deletes so pages hold real gaps, make the
    /// COMMIT record durable, then release every lock.
    pub fn commit(&self, txn: &Transaction) -> Result<(), TransactionError> {
        txn.set_state(TransactionState::Committed);

        while let Some(record) = txn.pop_write() {
            if let WriteOp::Delete { .. } = record.op {
                record.table.apply_delete(txn, record.rid)?;
            }
        }

        if let Some(log_manager) = self.logging() {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Commit);
            let lsn = log_manager.append_log_record(&mut record);
            txn.set_prev_lsn(lsn);
            // durability: commit may not return before the log reaches disk
            log_manager.flush_until(lsn);
        }

        self.release_locks(txn);
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Abort: undo the write set in LIFO order, force the ABORT record,
    /// then release every lock.
    pub fn abort(&self, txn: &Transaction) -> Result<(), TransactionError> {
        txn.set_state(TransactionState::Aborted);

        while let Some(record) = txn.pop_write() {
            match record.op {
                WriteOp::Insert => {
                    debug!("rollback insert at {}", record.rid);
                    record.table.apply_delete(txn, record.rid)?;
                }
                WriteOp::Delete { .. } => {
                    record.table.rollback_delete(txn, record.rid)?;
                }
                WriteOp::Update { old_tuple } => {
                    record.table.rollback_update(txn, record.rid, &old_tuple)?;
                }
            }
        }

        if let Some(log_manager) = self.logging() {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Abort);
            let lsn = log_manager.append_log_record(&mut record);
            txn.set_prev_lsn(lsn);
            log_manager.flush_until(lsn);
        }

        self.release_locks(txn);
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    fn release_locks(&self, txn: &Transaction) {
        for rid in txn.locked_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_ids_are_monotonic() {
        let lock_manager = Arc::new(LockManager::new(false));
        let manager = TransactionManager::new(lock_manager, None);

        let t1 = manager.begin();
        let t2 = manager.begin();
        assert_eq!(t1.id(), 1);
        assert_eq!(t2.id(), 2);
        assert_eq!(t1.state(), TransactionState::Growing);
    }

    #[test]
    fn test_commit_releases_locks_under_strict_2pl() {
        let lock_manager = Arc::new(LockManager::new(true));
        let manager = TransactionManager::new(lock_manager.clone(), None);

        let txn = manager.begin();
        let rid = crate::common::types::Rid::new(0, 0);
        assert!(lock_manager.lock_shared(&txn, rid));

        // unlock is denied while the transaction is still running
        assert!(!lock_manager.unlock(&txn, rid));

        manager.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);

        // the lock is gone: a new transaction takes it exclusively at once
        let other = manager.begin();
        assert!(lock_manager.lock_exclusive(&other, rid));
    }
}
