//! Public facade for the burrow embedded transactional key/value engine.
//!
//! Re-exports the engine surface: open a [`Database`], open an [`Index`],
//! mutate through transactions and cursors, observe mutations with
//! [`Trigger`]s, and project indexes through [`View`]s.

pub use burrow_core::{
    Cursor, Database, DatabaseConfig, FragmentStore, Index, LockMode, LogPosition, MemFragmentStore,
    MemRedoLog, MemStore, OrderedStore, PendingCommit, RedoLog, RedoRecord, Transaction,
    Transformer, Trigger, TriggerHandle, ValueRepr, View, DEFAULT_FRAGMENT_THRESHOLD,
    DEFAULT_LOCK_TIMEOUT, MAX_VALUE_LENGTH,
};
pub use burrow_error::{BurrowError, DeadlockSet, OwnerAttachment, Result};
pub use burrow_lock::{
    LockManager, LockResult, LockType, LockUpgradeRule, Locker, NanosTimeout, PendingTxn,
};
pub use burrow_types::{IndexId, TxnId, TxnIdAllocator, ValueRef, ValueState};
