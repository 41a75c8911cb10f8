//! Commit-deferred lock bundles.
//!
//! Commit wants to release locks only after the redo record is known
//! durable. [`Locker::transfer_exclusive`](crate::Locker::transfer_exclusive)
//! moves every exclusive lock out of the scope into a [`PendingTxn`], which
//! owns them (under its own registered scope) until released.

use std::sync::Arc;

use tracing::debug;

use crate::table::{LockId, LockManager, ScopeId};

/// A bundle of exclusive locks held on behalf of a committed-but-not-yet-
/// durable transaction.
pub struct PendingTxn {
    mgr: Arc<LockManager>,
    scope: ScopeId,
    locks: Vec<LockId>,
    released: bool,
}

impl PendingTxn {
    pub(crate) fn new(mgr: &Arc<LockManager>) -> Self {
        Self {
            mgr: Arc::clone(mgr),
            scope: mgr.register_scope(),
            locks: Vec::new(),
            released: false,
        }
    }

    pub(crate) fn scope(&self) -> ScopeId {
        self.scope
    }

    pub(crate) fn add(&mut self, lock: LockId) {
        self.locks.push(lock);
    }

    /// Number of transferred locks in the bundle.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Release every lock in the bundle. Call once the associated redo
    /// record is known durable.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!(count = self.locks.len(), "releasing pending transaction locks");
        for lock in self.locks.drain(..) {
            let _ = self.mgr.unlock(self.scope, lock);
        }
        self.mgr.unregister_scope(self.scope);
    }
}

impl Drop for PendingTxn {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for PendingTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTxn")
            .field("locks", &self.locks.len())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
