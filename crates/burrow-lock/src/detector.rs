//! Deadlock detection.
//!
//! Runs only after a lock wait expires its full (non-zero) timeout, never on
//! a fail-fast attempt. The walk follows `waiting_for → owner / shared
//! owners` edges over per-lock snapshots; it takes one shard latch at a time
//! to read a snapshot and never blocks behind a waiter, so it cannot itself
//! deadlock. Results are best-effort: the graph may shift underfoot, which
//! is acceptable because a detected cycle is only used to pick a victim.
//!
//! A "self deadlock" between two lockers on the same thread goes undetected;
//! the detector relies on multiple blocked threads.

use std::sync::Arc;

use tracing::debug;

use burrow_error::DeadlockSet;
use burrow_types::IndexId;

use crate::table::{LockId, LockManager, ScopeId};

/// Walk the wait graph from `origin`. Returns the deadlock set and whether
/// guilt attaches to the origin (an edge flows back into it).
pub(crate) fn detect(mgr: &LockManager, origin: ScopeId) -> Option<(DeadlockSet, bool)> {
    let mut detector = Detector {
        mgr,
        origin,
        lockers: Vec::new(),
        locks: Vec::new(),
        guilty: false,
    };
    if detector.scan(origin) {
        let set = detector.into_set();
        debug!(?origin, cycle_len = set.len(), "deadlock detected");
        Some((set, detector.guilty))
    } else {
        None
    }
}

struct Detector<'a> {
    mgr: &'a LockManager,
    origin: ScopeId,
    lockers: Vec<ScopeId>,
    locks: Vec<(LockId, IndexId, Option<Arc<[u8]>>)>,
    guilty: bool,
}

impl Detector<'_> {
    /// Returns true if a cycle was found.
    fn scan(&mut self, mut scope: ScopeId) -> bool {
        let mut found = false;

        'outer: loop {
            let Some(lock_id) = self.mgr.scope_waiting_for(scope) else {
                return found;
            };
            let Some(snap) = self.mgr.lock_snapshot(lock_id) else {
                return found;
            };

            self.add_lock(lock_id, snap.index_id, snap.key.clone());

            if self.lockers.is_empty() {
                self.lockers.push(scope);
            } else {
                // Any graph edge flowing into the original scope indicates
                // guilt.
                self.guilty |= scope == self.origin;
                if !self.add_locker(scope) {
                    return true;
                }
            }

            // If the owner is the scope itself, it is waiting to upgrade:
            // the blocking edges run to the shared owners instead.
            let owner = snap.owner.filter(|o| *o != scope);

            if let Some(owner) = owner {
                if snap.shared.is_empty() {
                    scope = owner;
                    continue 'outer;
                }
                found |= self.scan(owner);
            }

            if let Some((&last, rest)) = snap.shared.split_last() {
                for &s in rest {
                    found |= self.scan(s);
                }
                scope = last;
                continue 'outer;
            }

            return found;
        }
    }

    /// Returns false if the scope was already visited (a cycle).
    fn add_locker(&mut self, scope: ScopeId) -> bool {
        if self.lockers.contains(&scope) {
            return false;
        }
        self.lockers.push(scope);
        true
    }

    fn add_lock(&mut self, id: LockId, index_id: IndexId, key: Option<Arc<[u8]>>) {
        if !self.locks.iter().any(|(existing, _, _)| *existing == id) {
            self.locks.push((id, index_id, key));
        }
    }

    fn into_set(&self) -> DeadlockSet {
        DeadlockSet::new(
            self.locks
                .iter()
                .map(|(_, index_id, key)| (*index_id, key.as_ref().map(|k| k.to_vec())))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{LockResult, LockType, LockUpgradeRule};

    const IX: IndexId = IndexId::new(1);

    #[test]
    fn no_cycle_when_nothing_waits() {
        let mgr = LockManager::new(16, LockUpgradeRule::Strict);
        let a = mgr.register_scope();
        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        assert!(detect(&mgr, a).is_none());
    }

    #[test]
    fn two_party_cycle_is_reported_with_both_locks() {
        let mgr = LockManager::new(16, LockUpgradeRule::Strict);
        let a = mgr.register_scope();
        let b = mgr.register_scope();

        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"k1", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, _) = mgr.try_lock(LockType::Exclusive, b, IX, b"k2", -1);
        assert_eq!(r, LockResult::Acquired);

        // B parks on k1 from another thread; A then times out on k2.
        let mgr2 = Arc::clone(&mgr);
        let waiter = std::thread::spawn(move || {
            let (r, _) = mgr2.try_lock(LockType::Exclusive, b, IX, b"k1", 2_000_000_000);
            r
        });
        std::thread::sleep(std::time::Duration::from_millis(100));

        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"k2", 50_000_000);
        assert_eq!(r, LockResult::TimedOutLock);

        let (set, guilty) = detect(&mgr, a).expect("cycle exists");
        assert!(guilty);
        assert!(set.contains(IX, b"k1"));
        assert!(set.contains(IX, b"k2"));

        // Break the cycle: release A's hold on k1 so the parked thread
        // finishes. B's wait pointer identifies the k1 lock record.
        mgr.clear_waiting(a);
        let waiting = mgr.scope_waiting_for(b).expect("b is parked");
        mgr.unlock(a, waiting).unwrap();

        assert_eq!(waiter.join().unwrap(), LockResult::Acquired);
    }

    #[test]
    fn upgrade_wait_edges_point_at_shared_owners() {
        let mgr = LockManager::new(16, LockUpgradeRule::Strict);
        let a = mgr.register_scope();
        let b = mgr.register_scope();

        // A holds upgradable, B holds shared on the same key.
        let (r, _) = mgr.try_lock(LockType::Upgradable, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, _) = mgr.try_lock(LockType::Shared, b, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);

        // B also waits on something A holds, forming a cycle through the
        // shared edge once A waits to upgrade.
        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"other", -1);
        assert_eq!(r, LockResult::Acquired);

        let mgr2 = Arc::clone(&mgr);
        let waiter = std::thread::spawn(move || {
            let (r, _) = mgr2.try_lock(LockType::Exclusive, b, IX, b"other", 2_000_000_000);
            r
        });
        std::thread::sleep(std::time::Duration::from_millis(100));

        // A times out upgrading: B (shared holder) never lets go.
        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", 50_000_000);
        assert_eq!(r, LockResult::TimedOutLock);

        let (set, _) = detect(&mgr, a).expect("cycle through shared owner");
        assert!(set.contains(IX, b"k"));
        assert!(set.contains(IX, b"other"));

        mgr.clear_waiting(a);
        let waiting = mgr.scope_waiting_for(b).expect("b is parked");
        mgr.unlock(a, waiting).unwrap();
        assert_eq!(waiter.join().unwrap(), LockResult::Acquired);
    }
}
