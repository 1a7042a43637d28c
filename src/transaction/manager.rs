//! Transaction handles and their lifecycle.

use super::id::{TransactionId, TransactionIdGenerator};
use super::state::TransactionState;
use crate::access::rid::Rid;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {0} already finished")]
    AlreadyFinished(TransactionId),
}

/// A cheaply clonable handle to one transaction's state: its 2PL phase and
/// the row locks it currently holds. The lock manager mutates both.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

struct TransactionInner {
    id: TransactionId,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
}

impl Transaction {
    fn new(id: TransactionId) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id,
                state: Mutex::new(TransactionState::Growing),
                shared_lock_set: Mutex::new(HashSet::new()),
                exclusive_lock_set: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.inner.state.lock().unwrap() = state;
    }

    /// Snapshot of the rows this transaction holds shared locks on.
    pub fn shared_lock_set(&self) -> HashSet<Rid> {
        self.inner.shared_lock_set.lock().unwrap().clone()
    }

    /// Snapshot of the rows this transaction holds exclusive locks on.
    pub fn exclusive_lock_set(&self) -> HashSet<Rid> {
        self.inner.exclusive_lock_set.lock().unwrap().clone()
    }

    pub fn is_shared_locked(&self, rid: Rid) -> bool {
        self.inner.shared_lock_set.lock().unwrap().contains(&rid)
    }

    pub fn is_exclusive_locked(&self, rid: Rid) -> bool {
        self.inner.exclusive_lock_set.lock().unwrap().contains(&rid)
    }

    pub(crate) fn add_shared(&self, rid: Rid) {
        self.inner.shared_lock_set.lock().unwrap().insert(rid);
    }

    pub(crate) fn add_exclusive(&self, rid: Rid) {
        self.inner.exclusive_lock_set.lock().unwrap().insert(rid);
    }

    pub(crate) fn remove_shared(&self, rid: Rid) {
        self.inner.shared_lock_set.lock().unwrap().remove(&rid);
    }

    pub(crate) fn remove_exclusive(&self, rid: Rid) {
        self.inner.exclusive_lock_set.lock().unwrap().remove(&rid);
    }
}

/// Hands out transaction ids and tracks which transactions are live, so the
/// deadlock detector can find a victim by id.
pub struct TransactionManager {
    generator: TransactionIdGenerator,
    active: Mutex<HashMap<TransactionId, Transaction>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            generator: TransactionIdGenerator::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a new transaction in the growing phase.
    pub fn begin(&self) -> Transaction {
        let txn = Transaction::new(self.generator.next());
        self.active
            .lock()
            .unwrap()
            .insert(txn.id(), txn.clone());
        debug!("begin {}", txn.id());
        txn
    }

    /// Looks up a live transaction by id.
    pub fn get(&self, id: TransactionId) -> Option<Transaction> {
        self.active.lock().unwrap().get(&id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Marks the transaction committed and drops it from the registry.
    /// Lock release is the caller's business, through the lock manager.
    pub fn commit(&self, txn: &Transaction) -> Result<(), TransactionError> {
        if txn.state().is_finished() {
            return Err(TransactionError::AlreadyFinished(txn.id()));
        }
        txn.set_state(TransactionState::Committed);
        self.active.lock().unwrap().remove(&txn.id());
        debug!("commit {}", txn.id());
        Ok(())
    }

    /// Marks the transaction aborted and drops it from the registry.
    pub fn abort(&self, txn: &Transaction) -> Result<(), TransactionError> {
        if txn.state().is_committed() {
            return Err(TransactionError::AlreadyFinished(txn.id()));
        }
        txn.set_state(TransactionState::Aborted);
        self.active.lock().unwrap().remove(&txn.id());
        debug!("abort {}", txn.id());
        Ok(())
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
