use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{sync_channel, SyncSender};
use parking_lot::Mutex;

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{Transaction, TransactionState};

/// Current mode of a wait list's granted group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueMode {
    Init,
    Shared,
    Exclusive,
}

struct Waiter {
    txn_id: TxnId,
    target: QueueMode,
    /// One-shot completion signal, fulfilled by the unlocker.
    grant_tx: SyncSender<()>,
}

struct WaitList {
    granted: HashSet<TxnId>,
    mode: QueueMode,
    /// Wait-die reference id among the granted group; None stands for the
    /// source's -1. While sharing this tracks the max of the joiners' ids.
    oldest: Option<TxnId>,
    waiters: VecDeque<Waiter>,
}

impl WaitList {
    fn new(txn_id: TxnId, mode: QueueMode) -> Self {
        let mut granted = HashSet::new();
        granted.insert(txn_id);
        Self {
            granted,
            mode,
            oldest: Some(txn_id),
            waiters: VecDeque::new(),
        }
    }
}

/// Tuple-granularity lock manager with wait-die deadlock avoidance.
///
/// A lower txn id is an older transaction; older transactions may wait,
/// younger ones requesting a conflicting lock are aborted on the spot.
/// Waiter queues are FIFO per RID. In strict 2PL mode locks are only
/// released by a committed or aborted transaction.
pub struct LockManager {
    strict_2pl: bool,
    lock_map: Mutex<HashMap<Rid, WaitList>>,
}

impl LockManager {
    pub fn new(strict_2pl: bool) -> Self {
        Self {
            strict_2pl,
            lock_map: Mutex::new(HashMap::new()),
        }
    }

    pub fn strict_2pl(&self) -> bool {
        self.strict_2pl
    }

    /// A transaction may only acquire locks while GROWING. Requesting in
    /// SHRINKING aborts it (2PL violation).
    fn valid_txn_state(txn: &Transaction) -> bool {
        match txn.state() {
            TransactionState::Aborted | TransactionState::Committed => false,
            TransactionState::Shrinking => {
                txn.set_state(TransactionState::Aborted);
                false
            }
            TransactionState::Growing => true,
        }
    }

    /// Wait-die: abort the requester if it is younger than the reference id.
    fn dies(txn_id: TxnId, oldest: Option<TxnId>) -> bool {
        matches!(oldest, Some(o) if txn_id > o)
    }

    /// Acquire a shared lock. Blocks while an exclusive holder drains;
    /// returns false (with the transaction ABORTED) on a wait-die kill.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        if !Self::valid_txn_state(txn) {
            return false;
        }
        let txn_id = txn.id();

        let mut map = self.lock_map.lock();
        let wait_list = match map.entry(rid) {
            Entry::Vacant(entry) => {
                entry.insert(WaitList::new(txn_id, QueueMode::Shared));
                txn.add_shared_lock(rid);
                return true;
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        if wait_list.mode == QueueMode::Exclusive {
            if Self::dies(txn_id, wait_list.oldest) {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
            let (grant_tx, grant_rx) = sync_channel(1);
            wait_list.waiters.push_back(Waiter {
                txn_id,
                target: QueueMode::Shared,
                grant_tx,
            });
            drop(map);
            // fulfilled by the unlocker when this waiter is promoted
            if grant_rx.recv().is_err() {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
            txn.add_shared_lock(rid);
            return true;
        }

        wait_list.granted.insert(txn_id);
        wait_list.oldest = Some(wait_list.oldest.map_or(txn_id, |o| o.max(txn_id)));
        wait_list.mode = QueueMode::Shared;
        txn.add_shared_lock(rid);
        true
    }

    /// Acquire an exclusive lock.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        if !Self::valid_txn_state(txn) {
            return false;
        }
        let txn_id = txn.id();

        let mut map = self.lock_map.lock();
        let wait_list = match map.entry(rid) {
            Entry::Vacant(entry) => {
                entry.insert(WaitList::new(txn_id, QueueMode::Exclusive));
                txn.add_exclusive_lock(rid);
                return true;
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        if Self::dies(txn_id, wait_list.oldest) {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        let (grant_tx, grant_rx) = sync_channel(1);
        wait_list.waiters.push_back(Waiter {
            txn_id,
            target: QueueMode::Exclusive,
            grant_tx,
        });
        drop(map);
        if grant_rx.recv().is_err() {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        txn.add_exclusive_lock(rid);
        true
    }

    /// Upgrade a held shared lock to exclusive: release the shared lock
    /// with the upgrading flag (no SHRINKING transition, allowed under
    /// strict 2PL) and re-acquire exclusively.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        if !Self::valid_txn_state(txn) {
            return false;
        }

        {
            let map = self.lock_map.lock();
            let Some(wait_list) = map.get(&rid) else {
                return false;
            };
            if !wait_list.granted.contains(&txn.id()) {
                return false;
            }
        }

        if !self.unlock_internal(txn, rid, true) {
            return false;
        }
        self.lock_exclusive(txn, rid)
    }

    /// Release a held lock. Under strict 2PL this is only legal once the
    /// transaction is COMMITTED or ABORTED.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        self.unlock_internal(txn, rid, false)
    }

    fn unlock_internal(&self, txn: &Transaction, rid: Rid, upgrading: bool) -> bool {
        let mut map = self.lock_map.lock();

        let state = txn.state();
        if self.strict_2pl && !upgrading {
            if !(state == TransactionState::Committed || state == TransactionState::Aborted) {
                return false;
            }
        } else if state == TransactionState::Growing && !upgrading {
            txn.set_state(TransactionState::Shrinking);
        }

        let Some(wait_list) = map.get_mut(&rid) else {
            return false;
        };
        if !wait_list.granted.remove(&txn.id()) {
            return false;
        }

        if wait_list.waiters.is_empty() {
            map.remove(&rid);
            return true;
        }

        wait_list.mode = QueueMode::Init;
        wait_list.oldest = None;

        // promote the head waiter; the queue takes its mode and id
        let waiter = wait_list.waiters.pop_front().expect("waiter queue non-empty");
        wait_list.granted.insert(waiter.txn_id);
        wait_list.mode = waiter.target;
        wait_list.oldest = Some(waiter.txn_id);
        let _ = waiter.grant_tx.send(());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_shared_locks_are_compatible() {
        let lock_manager = LockManager::new(false);
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        let rid = Rid::new(0, 0);

        assert!(lock_manager.lock_shared(&t1, rid));
        assert!(lock_manager.lock_shared(&t2, rid));
        assert!(t1.holds_shared(rid));
        assert!(t2.holds_shared(rid));
    }

    #[test]
    fn test_wait_die_victim_is_aborted() {
        let lock_manager = LockManager::new(false);
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        let rid = Rid::new(0, 0);

        assert!(lock_manager.lock_exclusive(&t1, rid));

        // younger shared request against an older exclusive holder dies
        assert!(!lock_manager.lock_shared(&t2, rid));
        assert_eq!(t2.state(), TransactionState::Aborted);
        assert!(t1.holds_exclusive(rid));
        assert_eq!(t1.state(), TransactionState::Growing);
    }

    #[test]
    fn test_older_transaction_waits_for_younger() {
        let lock_manager = Arc::new(LockManager::new(false));
        let t2 = Arc::new(Transaction::new(2));
        let rid = Rid::new(0, 0);

        assert!(lock_manager.lock_exclusive(&t2, rid));

        let waiter_lm = lock_manager.clone();
        let handle = thread::spawn(move || {
            let t1 = Transaction::new(1);
            // older requester blocks instead of dying
            assert!(waiter_lm.lock_shared(&t1, rid));
            assert!(t1.holds_shared(rid));
        });

        thread::sleep(Duration::from_millis(50));
        assert!(lock_manager.unlock(&t2, rid));
        handle.join().unwrap();
    }

    #[test]
    fn test_unlock_transitions_to_shrinking_and_blocks_new_locks() {
        let lock_manager = LockManager::new(false);
        let txn = Transaction::new(1);
        let rid_a = Rid::new(0, 0);
        let rid_b = Rid::new(0, 1);

        assert!(lock_manager.lock_shared(&txn, rid_a));
        assert!(lock_manager.unlock(&txn, rid_a));
        assert_eq!(txn.state(), TransactionState::Shrinking);

        // acquiring after shrinking aborts the transaction
        assert!(!lock_manager.lock_shared(&txn, rid_b));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_strict_2pl_denies_unlock_before_commit() {
        let lock_manager = LockManager::new(true);
        let txn = Transaction::new(1);
        let rid = Rid::new(0, 0);

        assert!(lock_manager.lock_shared(&txn, rid));
        assert!(!lock_manager.unlock(&txn, rid));
        assert_eq!(txn.state(), TransactionState::Growing);

        txn.set_state(TransactionState::Committed);
        assert!(lock_manager.unlock(&txn, rid));
    }

    #[test]
    fn test_lock_upgrade_sole_holder() {
        for strict in [false, true] {
            let lock_manager = LockManager::new(strict);
            let txn = Transaction::new(1);
            let rid = Rid::new(0, 0);

            assert!(lock_manager.lock_shared(&txn, rid));
            assert!(lock_manager.lock_upgrade(&txn, rid));
            assert!(txn.holds_exclusive(rid));
            // upgrade must not have moved the transaction out of GROWING
            assert_eq!(txn.state(), TransactionState::Growing);
        }
    }

    #[test]
    fn test_upgrade_without_shared_lock_fails() {
        let lock_manager = LockManager::new(false);
        let txn = Transaction::new(1);
        let rid = Rid::new(0, 0);

        assert!(!lock_manager.lock_upgrade(&txn, rid));
        assert_eq!(txn.state(), TransactionState::Growing);
    }

    #[test]
    fn test_fifo_promotion_of_waiters() {
        let lock_manager = Arc::new(LockManager::new(false));
        let rid = Rid::new(0, 0);

        let t5 = Arc::new(Transaction::new(5));
        assert!(lock_manager.lock_exclusive(&t5, rid));

        // two older waiters queue up in order
        let lm1 = lock_manager.clone();
        let first = thread::spawn(move || {
            let t1 = Transaction::new(1);
            assert!(lm1.lock_exclusive(&t1, rid));
            // holds until dropped below
            thread::sleep(Duration::from_millis(50));
            t1.set_state(TransactionState::Shrinking);
            assert!(lm1.unlock(&t1, rid));
        });
        thread::sleep(Duration::from_millis(30));

        let lm2 = lock_manager.clone();
        let second = thread::spawn(move || {
            let t2 = Transaction::new(2);
            assert!(lm2.lock_exclusive(&t2, rid));
            t2.set_state(TransactionState::Shrinking);
            assert!(lm2.unlock(&t2, rid));
        });
        thread::sleep(Duration::from_millis(30));

        assert!(lock_manager.unlock(&t5, rid));
        first.join().unwrap();
        second.join().unwrap();
    }
}
