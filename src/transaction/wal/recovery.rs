use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::common::config::LOG_BUFFER_SIZE;
use crate::common::types::{Lsn, TxnId, INVALID_LSN};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::storage::page::TablePage;
use crate::transaction::wal::log_record::{DecodeOutcome, LogPayload, LogRecord};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),
}

/// ARIES-style crash recovery over the physical log: a redo pass from
/// offset 0 rebuilds page state and the active-transaction table, then an
/// undo pass rolls back every transaction without a COMMIT or ABORT record.
///
/// Runs before normal operation resumes; the log is physical, so no
/// analysis pass is needed. Recovery is idempotent: undo applications are
/// tolerant no-ops when the page already reflects them.
pub struct LogRecovery {
    disk_manager: Arc<DiskManager>,
    buffer_pool: Arc<BufferPoolManager>,
    /// txn id -> LSN of its most recent log record
    active_txn: HashMap<TxnId, Lsn>,
    /// LSN -> absolute byte offset of that record in the log file
    lsn_mapping: HashMap<Lsn, u64>,
}

impl LogRecovery {
    pub fn new(disk_manager: Arc<DiskManager>, buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            disk_manager,
            buffer_pool,
            active_txn: HashMap::new(),
            lsn_mapping: HashMap::new(),
        }
    }

    /// Run both passes.
    pub fn recover(&mut self) -> Result<(), RecoveryError> {
        info!("recovery: starting redo pass");
        self.redo()?;
        info!(
            "recovery: redo complete, {} transaction(s) to undo",
            self.active_txn.len()
        );
        self.undo()?;
        info!("recovery: undo complete");
        Ok(())
    }

    /// Transactions that were alive at the end of the redo pass.
    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.active_txn.keys().copied().collect()
    }

    /// Redo pass: scan the log a buffer-window at a time, re-applying every
    /// data record whose LSN is newer than its page. The scan offset
    /// advances by the bytes actually consumed, so a record straddling a
    /// window boundary is re-read at the top of the next window.
    pub fn redo(&mut self) -> Result<(), RecoveryError> {
        self.active_txn.clear();
        self.lsn_mapping.clear();

        let mut buf = vec![0u8; LOG_BUFFER_SIZE];
        let mut offset: u64 = 0;

        'scan: loop {
            let available = self.disk_manager.read_log(&mut buf, offset)?;
            if available == 0 {
                break;
            }

            let mut pos = 0usize;
            loop {
                match LogRecord::decode(&buf[pos..available]) {
                    DecodeOutcome::Record(record, consumed) => {
                        self.lsn_mapping.insert(record.lsn, offset + pos as u64);
                        self.apply_redo(&record)?;
                        pos += consumed;
                    }
                    DecodeOutcome::Incomplete => break,
                    DecodeOutcome::End => break 'scan,
                }
            }

            if pos == 0 {
                // a partial record with nothing before it: end of usable log
                break;
            }
            offset += pos as u64;
        }
        Ok(())
    }

    fn apply_redo(&mut self, record: &LogRecord) -> Result<(), RecoveryError> {
        match &record.payload {
            LogPayload::Begin => {
                self.active_txn.insert(record.txn_id, record.lsn);
                return Ok(());
            }
            LogPayload::Commit | LogPayload::Abort => {
                self.active_txn.remove(&record.txn_id);
                return Ok(());
            }
            LogPayload::NewPage { prev_page_id } => {
                // the record names only the predecessor; the new page
                // rebuilds itself when its first tuple record is redone
                debug!(
                    "redo: NEWPAGE after page {} (txn {})",
                    prev_page_id, record.txn_id
                );
                self.active_txn.insert(record.txn_id, record.lsn);
                return Ok(());
            }
            _ => {}
        }

        self.active_txn.insert(record.txn_id, record.lsn);

        let rid = match &record.payload {
            LogPayload::Insert { rid, .. }
            | LogPayload::MarkDelete { rid }
            | LogPayload::RollbackDelete { rid }
            | LogPayload::ApplyDelete { rid, .. }
            | LogPayload::Update { rid, .. } => *rid,
            _ => unreachable!(),
        };

        let page_ref = self.buffer_pool.fetch_page(rid.page_id)?;
        let mut dirty = false;
        {
            let mut page = page_ref.write();
            if page.lsn < record.lsn {
                match &record.payload {
                    LogPayload::Insert { tuple, .. } => {
                        if let Err(e) = TablePage::insert_tuple_at(&mut page, rid.slot, tuple) {
                            warn!("redo: insert at {} skipped: {}", rid, e);
                        }
                    }
                    LogPayload::MarkDelete { .. } => {
                        TablePage::mark_delete(&mut page, rid.slot);
                    }
                    LogPayload::RollbackDelete { .. } => {
                        TablePage::rollback_delete(&mut page, rid.slot);
                    }
                    LogPayload::ApplyDelete { .. } => {
                        TablePage::apply_delete(&mut page, rid.slot);
                    }
                    LogPayload::Update { new_tuple, .. } => {
                        if let Err(e) = TablePage::update_tuple(&mut page, rid.slot, new_tuple) {
                            warn!("redo: update at {} skipped: {}", rid, e);
                        }
                    }
                    _ => unreachable!(),
                }
                page.lsn = record.lsn;
                dirty = true;
            }
        }
        self.buffer_pool.unpin_page(rid.page_id, dirty)?;
        Ok(())
    }

    /// Undo pass: for every transaction still in `active_txn`, walk its
    /// prev-LSN chain backwards and apply the inverse of each record.
    pub fn undo(&mut self) -> Result<(), RecoveryError> {
        let victims: Vec<(TxnId, Lsn)> = self
            .active_txn
            .iter()
            .map(|(&txn_id, &lsn)| (txn_id, lsn))
            .collect();

        let mut buf = vec![0u8; LOG_BUFFER_SIZE];
        for (txn_id, mut lsn) in victims {
            debug!("undo: rolling back txn {} from lsn {}", txn_id, lsn);
            while lsn != INVALID_LSN {
                let Some(&offset) = self.lsn_mapping.get(&lsn) else {
                    break;
                };
                let available = self.disk_manager.read_log(&mut buf, offset)?;
                let DecodeOutcome::Record(record, _) = LogRecord::decode(&buf[..available]) else {
                    break;
                };

                self.apply_undo(&record)?;
                lsn = record.prev_lsn;
            }
        }
        Ok(())
    }

    fn apply_undo(&mut self, record: &LogRecord) -> Result<(), RecoveryError> {
        // BEGIN carries no change; APPLYDELETE/ROLLBACKDELETE only occur
        // after a terminal record and never reach undo
        let rid = match &record.payload {
            LogPayload::Insert { rid, .. }
            | LogPayload::MarkDelete { rid }
            | LogPayload::Update { rid, .. } => *rid,
            _ => return Ok(()),
        };

        let page_ref = self.buffer_pool.fetch_page(rid.page_id)?;
        {
            let mut page = page_ref.write();
            match &record.payload {
                LogPayload::Insert { .. } => {
                    TablePage::apply_delete(&mut page, rid.slot);
                }
                LogPayload::MarkDelete { .. } => {
                    TablePage::rollback_delete(&mut page, rid.slot);
                }
                LogPayload::Update { old_tuple, .. } => {
                    if let Err(e) = TablePage::update_tuple(&mut page, rid.slot, old_tuple) {
                        warn!("undo: restore at {} skipped: {}", rid, e);
                    }
                }
                _ => unreachable!(),
            }
        }
        self.buffer_pool.unpin_page(rid.page_id, true)?;
        Ok(())
    }
}
