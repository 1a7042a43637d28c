//! Row-granularity lock manager implementing strict two-phase locking.
//!
//! Each row id owns a FIFO queue of granted requests plus a condition
//! variable; one global mutex guards the row map and every queue. Acquiring
//! a lock after the first release aborts the transaction. A background task
//! sweeps the lock table at a fixed interval, builds the waits-for graph,
//! and aborts the youngest transaction on any cycle.

use crate::access::rid::Rid;
use crate::transaction::id::TransactionId;
use crate::transaction::manager::{Transaction, TransactionManager};
use crate::transaction::state::TransactionState;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Lock modes supported by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// Why a transaction was aborted by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A lock was requested after the transaction started releasing locks.
    LockOnShrinking,
    /// An upgrade was requested on an entry that is already exclusive.
    UpgradeConflict,
    /// The deadlock detector chose this transaction as the victim.
    Deadlock,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockOnShrinking => write!(f, "lock acquired while shrinking"),
            Self::UpgradeConflict => write!(f, "conflicting lock upgrade"),
            Self::Deadlock => write!(f, "deadlock victim"),
        }
    }
}

/// Structured abort surfaced to the caller, which is expected to unwind.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbortError {
    pub txn_id: TransactionId,
    pub reason: AbortReason,
}

/// A granted lock in a row's FIFO queue.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub txn_id: TransactionId,
    pub mode: LockMode,
    pub granted: bool,
}

#[derive(Default)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    cv: Arc<Condvar>,
}

#[derive(Default)]
struct LockTable {
    queues: HashMap<Rid, LockRequestQueue>,
    /// Who is currently blocked, and on which row; feeds the detector.
    waiting: HashMap<TransactionId, (Rid, LockMode)>,
    /// Explicitly installed waits-for edges.
    edges: HashMap<TransactionId, BTreeSet<TransactionId>>,
}

pub struct LockManager {
    table: Arc<Mutex<LockTable>>,
    txn_manager: Arc<TransactionManager>,
    detector_enabled: Arc<AtomicBool>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    /// Creates a lock manager and starts its cycle-detection task.
    pub fn new(txn_manager: Arc<TransactionManager>, cycle_detection_interval: Duration) -> Self {
        let table = Arc::new(Mutex::new(LockTable::default()));
        let detector_enabled = Arc::new(AtomicBool::new(true));

        let detector = {
            let table = Arc::clone(&table);
            let txn_manager = Arc::clone(&txn_manager);
            let enabled = Arc::clone(&detector_enabled);
            std::thread::spawn(move || {
                while enabled.load(Ordering::SeqCst) {
                    std::thread::sleep(cycle_detection_interval);
                    if !enabled.load(Ordering::SeqCst) {
                        break;
                    }
                    Self::detect_once(&table, &txn_manager);
                }
            })
        };

        Self {
            table,
            txn_manager,
            detector_enabled,
            detector: Mutex::new(Some(detector)),
        }
    }

    /// Takes a shared lock on `rid`, blocking while an exclusive holder is
    /// ahead in the queue. Returns `Ok(false)` if the transaction is (or
    /// becomes) aborted.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> Result<bool, TransactionAbortError> {
        self.lock(txn, rid, LockMode::Shared)
    }

    /// Takes an exclusive lock on `rid`, blocking until the queue drains.
    pub fn lock_exclusive(
        &self,
        txn: &Transaction,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        self.lock(txn, rid, LockMode::Exclusive)
    }

    fn lock(
        &self,
        txn: &Transaction,
        rid: Rid,
        mode: LockMode,
    ) -> Result<bool, TransactionAbortError> {
        if txn.state().is_aborted() {
            return Ok(false);
        }
        if txn.state().is_shrinking() {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionAbortError {
                txn_id: txn.id(),
                reason: AbortReason::LockOnShrinking,
            });
        }
        txn.set_state(TransactionState::Growing);

        let mut table = self.table.lock().unwrap();
        let cv = Arc::clone(&table.queues.entry(rid).or_default().cv);

        loop {
            if txn.state().is_aborted() {
                // Killed by the deadlock detector while waiting.
                table.waiting.remove(&txn.id());
                return Ok(false);
            }
            let queue = table.queues.get(&rid).expect("queue exists");
            let admissible = match mode {
                LockMode::Shared => queue
                    .requests
                    .back()
                    .map_or(true, |tail| tail.mode == LockMode::Shared && tail.granted),
                LockMode::Exclusive => queue.requests.is_empty(),
            };
            if admissible {
                break;
            }
            debug!("{} waits for {:?} on {}", txn.id(), mode, rid);
            table.waiting.insert(txn.id(), (rid, mode));
            table = cv.wait(table).unwrap();
        }

        table.waiting.remove(&txn.id());
        let queue = table.queues.get_mut(&rid).expect("queue exists");
        queue.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            granted: true,
        });
        match mode {
            LockMode::Shared => txn.add_shared(rid),
            LockMode::Exclusive => txn.add_exclusive(rid),
        }
        Ok(true)
    }

    /// Upgrades this transaction's shared lock on `rid` to exclusive. The
    /// shared entry is removed first; finding an exclusive entry instead is
    /// an upgrade conflict and aborts the transaction.
    pub fn lock_upgrade(
        &self,
        txn: &Transaction,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        {
            let mut table = self.table.lock().unwrap();
            let queue = table.queues.get_mut(&rid).expect("upgrade on unlocked row");
            let position = queue
                .requests
                .iter()
                .position(|r| r.txn_id == txn.id())
                .expect("upgrade without a held lock");
            if queue.requests[position].mode != LockMode::Shared {
                txn.set_state(TransactionState::Aborted);
                return Err(TransactionAbortError {
                    txn_id: txn.id(),
                    reason: AbortReason::UpgradeConflict,
                });
            }
            queue.requests.remove(position);
            txn.remove_shared(rid);
            queue.cv.notify_all();
        }
        self.lock_exclusive(txn, rid)
    }

    /// Releases this transaction's lock on `rid` and moves it to the
    /// shrinking phase. Wakes one waiter.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        let cv = {
            let mut table = self.table.lock().unwrap();
            let Some(queue) = table.queues.get_mut(&rid) else {
                return false;
            };
            let Some(position) = queue.requests.iter().position(|r| r.txn_id == txn.id())
            else {
                return false;
            };
            queue.requests.remove(position);
            Arc::clone(&queue.cv)
        };

        if txn.state().is_growing() {
            txn.set_state(TransactionState::Shrinking);
        }
        txn.remove_shared(rid);
        txn.remove_exclusive(rid);
        cv.notify_one();
        true
    }

    /// Releases every lock the transaction still holds, waking waiters.
    /// Used at commit/abort; the 2PL phase still moves to shrinking.
    pub fn unlock_all(&self, txn: &Transaction) {
        let rids: Vec<Rid> = txn
            .shared_lock_set()
            .into_iter()
            .chain(txn.exclusive_lock_set())
            .collect();
        for rid in rids {
            self.unlock(txn, rid);
        }
    }

    /// Installs a waits-for edge `waiter -> holder`.
    pub fn add_edge(&self, waiter: TransactionId, holder: TransactionId) {
        let mut table = self.table.lock().unwrap();
        table.edges.entry(waiter).or_default().insert(holder);
    }

    /// Removes a previously installed edge.
    pub fn remove_edge(&self, waiter: TransactionId, holder: TransactionId) {
        let mut table = self.table.lock().unwrap();
        if let Some(holders) = table.edges.get_mut(&waiter) {
            holders.remove(&holder);
            if holders.is_empty() {
                table.edges.remove(&waiter);
            }
        }
    }

    /// Every edge in the current waits-for graph (explicit and derived from
    /// blocked requests), sorted for determinism.
    pub fn edge_list(&self) -> Vec<(TransactionId, TransactionId)> {
        let table = self.table.lock().unwrap();
        let graph = Self::build_graph(&table);
        let mut edges: Vec<(TransactionId, TransactionId)> = graph
            .iter()
            .flat_map(|(&from, tos)| tos.iter().map(move |&to| (from, to)))
            .collect();
        edges.sort();
        edges
    }

    /// Searches the waits-for graph for a cycle. On a hit, returns the
    /// youngest (largest-id) transaction on that cycle.
    pub fn has_cycle(&self) -> Option<TransactionId> {
        let table = self.table.lock().unwrap();
        Self::find_victim(&Self::build_graph(&table))
    }

    fn build_graph(table: &LockTable) -> HashMap<TransactionId, BTreeSet<TransactionId>> {
        let mut graph = table.edges.clone();
        for (&waiter, &(rid, mode)) in &table.waiting {
            if let Some(queue) = table.queues.get(&rid) {
                for request in &queue.requests {
                    if request.granted
                        && request.txn_id != waiter
                        && !mode.is_compatible_with(&request.mode)
                    {
                        graph.entry(waiter).or_default().insert(request.txn_id);
                    }
                }
            }
        }
        graph
    }

    fn find_victim(
        graph: &HashMap<TransactionId, BTreeSet<TransactionId>>,
    ) -> Option<TransactionId> {
        let mut starts: Vec<TransactionId> = graph.keys().copied().collect();
        starts.sort();

        let mut visited = HashSet::new();
        for start in starts {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            if let Some(victim) = Self::dfs(graph, start, &mut visited, &mut path, &mut on_path) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        graph: &HashMap<TransactionId, BTreeSet<TransactionId>>,
        node: TransactionId,
        visited: &mut HashSet<TransactionId>,
        path: &mut Vec<TransactionId>,
        on_path: &mut HashSet<TransactionId>,
    ) -> Option<TransactionId> {
        visited.insert(node);
        path.push(node);
        on_path.insert(node);

        if let Some(nexts) = graph.get(&node) {
            for &next in nexts {
                if on_path.contains(&next) {
                    // Found a cycle: everything from `next` onward is on it.
                    let cycle_start = path.iter().position(|&n| n == next).unwrap();
                    return path[cycle_start..].iter().copied().max();
                }
                if !visited.contains(&next) {
                    if let Some(victim) = Self::dfs(graph, next, visited, path, on_path) {
                        return Some(victim);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        None
    }

    /// One detector sweep: abort victims until the graph is acyclic.
    fn detect_once(table: &Arc<Mutex<LockTable>>, txn_manager: &Arc<TransactionManager>) {
        let mut table = table.lock().unwrap();
        while let Some(victim) = Self::find_victim(&Self::build_graph(&table)) {
            warn!("deadlock detected, aborting {}", victim);
            if let Some(txn) = txn_manager.get(victim) {
                txn.set_state(TransactionState::Aborted);
            }
            table.waiting.remove(&victim);
            for queue in table.queues.values_mut() {
                queue.requests.retain(|r| r.txn_id != victim);
            }
            table.edges.remove(&victim);
            for holders in table.edges.values_mut() {
                holders.remove(&victim);
            }
            for queue in table.queues.values() {
                queue.cv.notify_all();
            }
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.detector_enabled.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageId;
    use std::thread;

    fn setup() -> (Arc<TransactionManager>, LockManager) {
        let txn_manager = Arc::new(TransactionManager::new());
        let lock_manager = LockManager::new(Arc::clone(&txn_manager), Duration::from_millis(10));
        (txn_manager, lock_manager)
    }

    fn rid(n: u32) -> Rid {
        Rid::new(PageId(n), 0)
    }

    #[test]
    fn test_shared_locks_coexist() {
        let (txns, locks) = setup();
        let t1 = txns.begin();
        let t2 = txns.begin();

        assert!(locks.lock_shared(&t1, rid(1)).unwrap());
        assert!(locks.lock_shared(&t2, rid(1)).unwrap());
        assert!(t1.is_shared_locked(rid(1)));
        assert!(t2.is_shared_locked(rid(1)));
    }

    #[test]
    fn test_lock_on_shrinking_aborts() {
        let (txns, locks) = setup();
        let t = txns.begin();

        assert!(locks.lock_shared(&t, rid(1)).unwrap());
        assert!(locks.unlock(&t, rid(1)));
        assert_eq!(t.state(), TransactionState::Shrinking);

        let err = locks.lock_shared(&t, rid(2)).unwrap_err();
        assert_eq!(err.reason, AbortReason::LockOnShrinking);
        assert_eq!(t.state(), TransactionState::Aborted);

        // Further acquisitions on an aborted transaction just fail.
        assert!(!locks.lock_shared(&t, rid(3)).unwrap());
    }

    #[test]
    fn test_exclusive_blocks_until_release() {
        let (txns, locks) = setup();
        let locks = Arc::new(locks);
        let t1 = txns.begin();
        let t2 = txns.begin();

        assert!(locks.lock_exclusive(&t1, rid(1)).unwrap());

        let locks2 = Arc::clone(&locks);
        let t2_clone = t2.clone();
        let handle = thread::spawn(move || locks2.lock_shared(&t2_clone, rid(1)).unwrap());

        thread::sleep(Duration::from_millis(30));
        assert!(!t2.is_shared_locked(rid(1)));

        assert!(locks.unlock(&t1, rid(1)));
        assert!(handle.join().unwrap());
        assert!(t2.is_shared_locked(rid(1)));
    }

    #[test]
    fn test_upgrade() {
        let (txns, locks) = setup();
        let t = txns.begin();

        assert!(locks.lock_shared(&t, rid(1)).unwrap());
        assert!(locks.lock_upgrade(&t, rid(1)).unwrap());
        assert!(!t.is_shared_locked(rid(1)));
        assert!(t.is_exclusive_locked(rid(1)));
    }

    #[test]
    fn test_upgrade_on_exclusive_entry_aborts() {
        let (txns, locks) = setup();
        let t = txns.begin();

        assert!(locks.lock_exclusive(&t, rid(1)).unwrap());
        let err = locks.lock_upgrade(&t, rid(1)).unwrap_err();
        assert_eq!(err.reason, AbortReason::UpgradeConflict);
        assert_eq!(t.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_unlock_unknown_row() {
        let (txns, locks) = setup();
        let t = txns.begin();
        assert!(!locks.unlock(&t, rid(42)));
        // A failed unlock is not a release; the transaction keeps growing.
        assert_eq!(t.state(), TransactionState::Growing);
    }

    #[test]
    fn test_unlock_all() {
        let (txns, locks) = setup();
        let t = txns.begin();

        assert!(locks.lock_shared(&t, rid(1)).unwrap());
        assert!(locks.lock_exclusive(&t, rid(2)).unwrap());
        locks.unlock_all(&t);

        assert!(t.shared_lock_set().is_empty());
        assert!(t.exclusive_lock_set().is_empty());
        assert_eq!(t.state(), TransactionState::Shrinking);
    }

    #[test]
    fn test_explicit_edges_and_cycle() {
        let (txns, locks) = setup();
        let t1 = txns.begin();
        let t2 = txns.begin();

        locks.add_edge(t1.id(), t2.id());
        assert_eq!(locks.has_cycle(), None);
        assert_eq!(locks.edge_list(), vec![(t1.id(), t2.id())]);

        locks.add_edge(t2.id(), t1.id());
        // The youngest participant is the victim.
        assert_eq!(locks.has_cycle(), Some(t2.id()));

        locks.remove_edge(t2.id(), t1.id());
        assert_eq!(locks.has_cycle(), None);
    }

    #[test]
    fn test_deadlock_detection_aborts_youngest() {
        let (txns, locks) = setup();
        let locks = Arc::new(locks);
        let t1 = txns.begin();
        let t2 = txns.begin();

        assert!(locks.lock_exclusive(&t1, rid(1)).unwrap());
        assert!(locks.lock_exclusive(&t2, rid(2)).unwrap());

        // t1 waits for row 2, t2 waits for row 1: a cycle the detector
        // must break by aborting t2 (the younger transaction).
        let locks1 = Arc::clone(&locks);
        let t1_clone = t1.clone();
        let h1 = thread::spawn(move || locks1.lock_exclusive(&t1_clone, rid(2)).unwrap());

        let locks2 = Arc::clone(&locks);
        let t2_clone = t2.clone();
        let h2 = thread::spawn(move || locks2.lock_exclusive(&t2_clone, rid(1)).unwrap());

        let t1_got_lock = h1.join().unwrap();
        let t2_got_lock = h2.join().unwrap();

        assert!(t1_got_lock);
        assert!(!t2_got_lock);
        assert_eq!(t2.state(), TransactionState::Aborted);
    }
}
