//! Lock-based concurrency control over `(index id, key)` resources.
//!
//! This crate implements the locking substrate of the burrow engine: a
//! sharded lock table with shared / upgradable / exclusive modes, scoped
//! per-transaction lock stacks with nesting and promotion, best-effort
//! deadlock detection after full-timeout waits, and commit-deferred lock
//! transfer for durability-gated release.

pub mod detector;
pub mod locker;
pub mod pending;
pub mod result;
pub mod table;

pub use locker::Locker;
pub use pending::PendingTxn;
pub use result::{LockResult, LockType, LockUpgradeRule};
pub use table::{
    DEFAULT_LOCK_TABLE_SHARDS, LockManager, NanosTimeout, ScopeId, hash_resource,
};
