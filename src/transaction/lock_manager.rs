use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex},
};

use log::debug;

use crate::{
    error::SmallError,
    transaction::wait_for_graph::WaitForGraph,
    types::{HierarchyId, SmallResult, XactId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

impl LockType {
    /// Whether holding `self` already satisfies a request for `other`.
    pub fn covers(self, other: LockType) -> bool {
        match self {
            LockType::Exclusive => true,
            LockType::Shared => other == LockType::Shared,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum LockAcquireResult {
    Acquired,
    NeedsWait,
    Deadlock,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LockState {
    Waiting,
    Granted,
    Aborted,
}

/// One granted or queued request. Waiters block on `cond`; a wakeup means
/// either the lock was granted or its owner was aborted, and the state
/// tells which.
pub struct Lock {
    xid: XactId,
    lock_type: LockType,
    hid: HierarchyId,

    state: Mutex<LockState>,
    cond: Condvar,
}

impl Lock {
    fn new(xid: XactId, lock_type: LockType, hid: HierarchyId, state: LockState) -> Arc<Self> {
        Arc::new(Self {
            xid,
            lock_type,
            hid,
            state: Mutex::new(state),
            cond: Condvar::new(),
        })
    }

    pub fn xid(&self) -> XactId {
        self.xid
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn hid(&self) -> HierarchyId {
        self.hid
    }

    /// Block until granted or aborted. Returns true on grant.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while *state == LockState::Waiting {
            state = self.cond.wait(state).unwrap();
        }
        *state == LockState::Granted
    }

    fn grant(&self) {
        *self.state.lock().unwrap() = LockState::Granted;
        self.cond.notify_all();
    }

    fn abort(&self) {
        *self.state.lock().unwrap() = LockState::Aborted;
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct LockEntry {
    /// Strongest type among the running locks.
    status: Option<LockType>,
    running: Vec<Arc<Lock>>,
    waiting: VecDeque<Arc<Lock>>,
}

/// Record-level two-phase lock table keyed by `(table, page, slot)`.
///
/// One mutex guards all entries; it is held across wait-for-graph
/// traversal but released while a waiter blocks on its condition.
pub struct LockManager {
    entries: Mutex<HashMap<HierarchyId, LockEntry>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take `lock_type` on `hid` for `xid`.
    ///
    /// Grant paths, in order:
    /// 1. nobody runs or waits on the entry;
    /// 2. the requester owns every running lock (covers the S->X
    ///    upgrade; queueing behind oneself would never wake up);
    /// 3. a shared request joins shared runners when no exclusive
    ///    request is already waiting (no overtaking writers).
    ///
    /// Otherwise the request queues FIFO. If queueing closes a cycle in
    /// the waits-for graph the request is withdrawn on the spot and
    /// `Deadlock` comes back; the caller aborts the transaction.
    pub fn acquire(
        &self,
        hid: HierarchyId,
        xid: XactId,
        lock_type: LockType,
    ) -> (Option<Arc<Lock>>, LockAcquireResult) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(hid).or_insert_with(LockEntry::default);

        let grant = if entry.running.is_empty() && entry.waiting.is_empty() {
            true
        } else if !entry.running.is_empty() && entry.running.iter().all(|l| l.xid() == xid) {
            true
        } else {
            lock_type == LockType::Shared
                && entry.status == Some(LockType::Shared)
                && !entry
                    .waiting
                    .iter()
                    .any(|l| l.lock_type() == LockType::Exclusive)
        };

        if grant {
            let lock = Lock::new(xid, lock_type, hid, LockState::Granted);
            if entry.status != Some(LockType::Exclusive) {
                entry.status = Some(lock_type);
            }
            entry.running.push(Arc::clone(&lock));

            debug!("xact {} acquired {:?} on {}", xid, lock_type, hid);
            return (Some(lock), LockAcquireResult::Acquired);
        }

        let lock = Lock::new(xid, lock_type, hid, LockState::Waiting);
        entry.waiting.push_back(Arc::clone(&lock));

        let graph = build_wait_for_graph(&entries);
        if graph.cycle_through(xid) {
            let entry = entries.get_mut(&hid).unwrap();
            entry
                .waiting
                .retain(|queued| !Arc::ptr_eq(queued, &lock));
            if entry.running.is_empty() && entry.waiting.is_empty() {
                entries.remove(&hid);
            }

            debug!("xact {} deadlocks requesting {:?} on {}", xid, lock_type, hid);
            return (None, LockAcquireResult::Deadlock);
        }

        debug!("xact {} waits for {:?} on {}", xid, lock_type, hid);
        (Some(lock), LockAcquireResult::NeedsWait)
    }

    /// Drop a lock. Running locks leave the running list and may promote
    /// waiters; a still-waiting lock (its owner is aborting) leaves the
    /// queue and is woken so the blocked thread observes the abort.
    pub fn release(&self, lock: &Arc<Lock>) -> SmallResult {
        let mut entries = self.entries.lock().unwrap();
        let hid = lock.hid();

        let entry = entries
            .get_mut(&hid)
            .ok_or_else(|| SmallError::invariant("released a lock with no entry"))?;

        if let Some(pos) = entry.running.iter().position(|l| Arc::ptr_eq(l, lock)) {
            entry.running.remove(pos);
        } else {
            entry.waiting.retain(|queued| !Arc::ptr_eq(queued, lock));
            lock.abort();
        }

        if !entry.running.is_empty() {
            return Ok(());
        }

        if entry.waiting.is_empty() {
            entries.remove(&hid);
            return Ok(());
        }

        // wake the longest-waiting compatible prefix: one writer, or
        // every reader up to the first writer
        if entry.waiting.front().unwrap().lock_type() == LockType::Exclusive {
            let next = entry.waiting.pop_front().unwrap();
            entry.status = Some(LockType::Exclusive);
            entry.running.push(Arc::clone(&next));
            next.grant();
            return Ok(());
        }

        entry.status = Some(LockType::Shared);
        while let Some(front) = entry.waiting.front() {
            if front.lock_type() == LockType::Exclusive {
                break;
            }
            let next = entry.waiting.pop_front().unwrap();
            entry.running.push(Arc::clone(&next));
            next.grant();
        }

        Ok(())
    }
}

/// Edge `waiter -> runner` for every entry where the waiter queues behind
/// the runner.
fn build_wait_for_graph(entries: &HashMap<HierarchyId, LockEntry>) -> WaitForGraph {
    let mut graph = WaitForGraph::new();

    for entry in entries.values() {
        for waiter in entry.waiting.iter() {
            for runner in entry.running.iter() {
                if runner.xid() != waiter.xid() {
                    graph.add_edge(waiter.xid(), runner.xid());
                }
            }
        }
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hid(slot: usize) -> HierarchyId {
        HierarchyId::new(1, 2, slot)
    }

    #[test]
    fn test_shared_locks_coexist() {
        let manager = LockManager::new();

        let (a, r1) = manager.acquire(hid(0), 1, LockType::Shared);
        let (b, r2) = manager.acquire(hid(0), 2, LockType::Shared);
        assert_eq!(r1, LockAcquireResult::Acquired);
        assert_eq!(r2, LockAcquireResult::Acquired);

        manager.release(&a.unwrap()).unwrap();
        manager.release(&b.unwrap()).unwrap();
    }

    #[test]
    fn test_exclusive_conflicts_and_fifo_wakeup() {
        let manager = LockManager::new();

        let (a, _) = manager.acquire(hid(0), 1, LockType::Exclusive);
        let (b, r2) = manager.acquire(hid(0), 2, LockType::Exclusive);
        assert_eq!(r2, LockAcquireResult::NeedsWait);

        let b = b.unwrap();
        manager.release(&a.unwrap()).unwrap();
        // the waiter was promoted synchronously
        assert!(b.wait());
        manager.release(&b).unwrap();
    }

    #[test]
    fn test_upgrade_when_sole_runner() {
        let manager = LockManager::new();

        let (s, _) = manager.acquire(hid(0), 1, LockType::Shared);
        let (x, result) = manager.acquire(hid(0), 1, LockType::Exclusive);
        assert_eq!(result, LockAcquireResult::Acquired);

        manager.release(&s.unwrap()).unwrap();
        manager.release(&x.unwrap()).unwrap();
    }

    #[test]
    fn test_shared_barge_blocked_by_exclusive_waiter() {
        let manager = LockManager::new();

        let (_s1, _) = manager.acquire(hid(0), 1, LockType::Shared);
        let (_x, r_x) = manager.acquire(hid(0), 2, LockType::Exclusive);
        assert_eq!(r_x, LockAcquireResult::NeedsWait);

        // a third reader may not overtake the queued writer
        let (_s2, r_s) = manager.acquire(hid(0), 3, LockType::Shared);
        assert_eq!(r_s, LockAcquireResult::NeedsWait);
    }

    #[test]
    fn test_two_party_deadlock_detected() {
        let manager = LockManager::new();

        let (_a0, _) = manager.acquire(hid(0), 1, LockType::Exclusive);
        let (_b1, _) = manager.acquire(hid(1), 2, LockType::Exclusive);

        let (_a1, r1) = manager.acquire(hid(1), 1, LockType::Exclusive);
        assert_eq!(r1, LockAcquireResult::NeedsWait);

        let (lock, r2) = manager.acquire(hid(0), 2, LockType::Exclusive);
        assert_eq!(r2, LockAcquireResult::Deadlock);
        assert!(lock.is_none());
    }

    #[test]
    fn test_release_of_waiting_lock_is_an_abort_wakeup() {
        let manager = LockManager::new();

        let (a, _) = manager.acquire(hid(0), 1, LockType::Exclusive);
        let (b, result) = manager.acquire(hid(0), 2, LockType::Exclusive);
        assert_eq!(result, LockAcquireResult::NeedsWait);

        let b = b.unwrap();
        manager.release(&b).unwrap();
        assert!(!b.wait());

        manager.release(&a.unwrap()).unwrap();
    }

    #[test]
    fn test_reader_batch_promoted_together() {
        let manager = LockManager::new();

        let (w, _) = manager.acquire(hid(0), 1, LockType::Exclusive);
        let (r1, _) = manager.acquire(hid(0), 2, LockType::Shared);
        let (r2, _) = manager.acquire(hid(0), 3, LockType::Shared);
        let (w2, _) = manager.acquire(hid(0), 4, LockType::Exclusive);

        manager.release(&w.unwrap()).unwrap();

        let r1 = r1.unwrap();
        let r2 = r2.unwrap();
        assert!(r1.wait());
        assert!(r2.wait());

        // the writer behind them still waits
        let w2 = w2.unwrap();
        manager.release(&r1).unwrap();
        manager.release(&r2).unwrap();
        assert!(w2.wait());
        manager.release(&w2).unwrap();
    }
}
