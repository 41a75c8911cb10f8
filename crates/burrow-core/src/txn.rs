//! Transactions.
//!
//! A transaction couples a lock scope with an undo log. The `Bogus`
//! transaction is a distinguished variant whose lock-acquire primitives
//! are no-ops and which never fires triggers; internal maintenance (the
//! trash cursor, undo replay) runs under it.
//!
//! A transaction may be handed between threads under a happens-before
//! edge, but must never be used concurrently; the interior mutexes exist
//! to make the handoff sound, not to make concurrent use meaningful.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use burrow_error::{BurrowError, OwnerAttachment, Result};
use burrow_lock::{LockResult, Locker, NanosTimeout, PendingTxn};
use burrow_types::{IndexId, TxnId};

use crate::db::DbInner;
use crate::redo::{LogPosition, RedoRecord};
use crate::undo::{replay, UndoRecord};

/// Default lock mode applied to reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Writes take no locks and fire no triggers; reads take no locks.
    Unsafe,
    /// Reads take no locks; writes lock exclusively.
    ReadUncommitted,
    /// Reads take a shared lock and release it immediately.
    ReadCommitted,
    /// Reads take and keep a shared lock.
    RepeatableRead,
    /// Reads take and keep an upgradable lock.
    #[default]
    UpgradableRead,
}

impl LockMode {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Unsafe => 0,
            Self::ReadUncommitted => 1,
            Self::ReadCommitted => 2,
            Self::RepeatableRead => 3,
            Self::UpgradableRead => 4,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unsafe,
            1 => Self::ReadUncommitted,
            2 => Self::ReadCommitted,
            3 => Self::RepeatableRead,
            _ => Self::UpgradableRead,
        }
    }
}

const FLAG_HAS_TRASH: u8 = 1;
const FLAG_BORKED: u8 = 2;

struct ScopeSave {
    undo_len: usize,
    lock_mode: LockMode,
    timeout: NanosTimeout,
}

struct RealTxn {
    db: Arc<DbInner>,
    txn_id: TxnId,
    locker: Mutex<Locker>,
    undo: Mutex<Vec<UndoRecord>>,
    scopes: Mutex<Vec<ScopeSave>>,
    flags: AtomicU8,
    borked_reason: Mutex<Option<String>>,
    lock_mode: AtomicU8,
    timeout: AtomicI64,
}

enum TxnInner {
    Bogus,
    Real(RealTxn),
}

/// A unit of locking and undo accumulation; may nest.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxnInner>,
}

impl Transaction {
    /// The distinguished no-locking transaction.
    #[must_use]
    pub fn bogus() -> Self {
        Self {
            inner: Arc::new(TxnInner::Bogus),
        }
    }

    pub(crate) fn begin(db: &Arc<DbInner>) -> Self {
        let txn_id = db.txn_ids.alloc();
        debug!(txn_id = %txn_id, "transaction begun");
        Self {
            inner: Arc::new(TxnInner::Real(RealTxn {
                db: Arc::clone(db),
                txn_id,
                locker: Mutex::new(Locker::new(&db.lock_mgr)),
                undo: Mutex::new(Vec::new()),
                scopes: Mutex::new(Vec::new()),
                flags: AtomicU8::new(0),
                borked_reason: Mutex::new(None),
                lock_mode: AtomicU8::new(LockMode::default().as_u8()),
                timeout: AtomicI64::new(db.default_lock_timeout),
            })),
        }
    }

    fn real(&self) -> Option<&RealTxn> {
        match &*self.inner {
            TxnInner::Bogus => None,
            TxnInner::Real(real) => Some(real),
        }
    }

    fn real_or_err(&self) -> Result<&RealTxn> {
        self.real()
            .ok_or(BurrowError::IllegalState("transaction is bogus"))
    }

    /// Whether this is the bogus transaction.
    #[must_use]
    pub fn is_bogus(&self) -> bool {
        self.real().is_none()
    }

    /// The transaction id; `None` for the bogus transaction.
    #[must_use]
    pub fn id(&self) -> Option<TxnId> {
        self.real().map(|r| r.txn_id)
    }

    /// Current lock mode.
    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        self.real().map_or(LockMode::Unsafe, |r| {
            LockMode::from_u8(r.lock_mode.load(Ordering::Relaxed))
        })
    }

    /// Change the lock mode for subsequent operations in this scope.
    pub fn set_lock_mode(&self, mode: LockMode) {
        if let Some(real) = self.real() {
            real.lock_mode.store(mode.as_u8(), Ordering::Relaxed);
        }
    }

    /// Current lock timeout in nanoseconds (negative = infinite).
    #[must_use]
    pub fn lock_timeout_nanos(&self) -> NanosTimeout {
        self.real().map_or(0, |r| r.timeout.load(Ordering::Relaxed))
    }

    /// Change the lock timeout for subsequent operations in this scope.
    pub fn set_lock_timeout(&self, timeout: Duration) {
        if let Some(real) = self.real() {
            real.timeout.store(
                NanosTimeout::try_from(timeout.as_nanos()).unwrap_or(NanosTimeout::MAX),
                Ordering::Relaxed,
            );
        }
    }

    /// Set an infinite lock timeout.
    pub fn set_lock_timeout_infinite(&self) {
        if let Some(real) = self.real() {
            real.timeout.store(-1, Ordering::Relaxed);
        }
    }

    /// Attach an opaque object, surfaced to requesters this scope blocks.
    pub fn attach(&self, attachment: Option<OwnerAttachment>) {
        if let Some(real) = self.real() {
            real.locker.lock().attach(attachment);
        }
    }

    /// This transaction's attachment.
    #[must_use]
    pub fn attachment(&self) -> Option<OwnerAttachment> {
        self.real()?.locker.lock().attachment()
    }

    /// Whether the current scope is nested.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.real().is_some_and(|r| !r.scopes.lock().is_empty())
    }

    /// Scope nesting level; zero when non-nested.
    #[must_use]
    pub fn nesting_level(&self) -> usize {
        self.real().map_or(0, |r| r.scopes.lock().len())
    }

    // -- Flags -----------------------------------------------------------

    pub(crate) fn fires_triggers(&self) -> bool {
        self.real().is_some() && self.lock_mode() != LockMode::Unsafe
    }

    pub(crate) fn locks_writes(&self) -> bool {
        self.fires_triggers()
    }

    pub(crate) fn has_trash(&self) -> bool {
        self.real()
            .is_some_and(|r| r.flags.load(Ordering::Relaxed) & FLAG_HAS_TRASH != 0)
    }

    fn set_flag(&self, flag: u8) {
        if let Some(real) = self.real() {
            real.flags.fetch_or(flag, Ordering::Relaxed);
        }
    }

    /// Whether the transaction failed mid-protocol and needs a reset.
    #[must_use]
    pub fn is_borked(&self) -> bool {
        self.real()
            .is_some_and(|r| r.flags.load(Ordering::Relaxed) & FLAG_BORKED != 0)
    }

    pub(crate) fn set_borked(&self, reason: impl Into<String>) {
        if let Some(real) = self.real() {
            real.flags.fetch_or(FLAG_BORKED, Ordering::Relaxed);
            *real.borked_reason.lock() = Some(reason.into());
        }
    }

    fn ensure_not_borked(&self) -> Result<()> {
        if self.is_borked() {
            let reason = self
                .real()
                .and_then(|r| r.borked_reason.lock().clone())
                .unwrap_or_else(|| "unknown failure".to_owned());
            return Err(BurrowError::Borked { reason });
        }
        Ok(())
    }

    // -- Locking ---------------------------------------------------------

    /// Acquire a shared lock; no-op on the bogus transaction.
    pub fn lock_shared(&self, index_id: IndexId, key: &[u8]) -> Result<LockResult> {
        match self.real() {
            None => Ok(LockResult::Unowned),
            Some(real) => {
                let timeout = real.timeout.load(Ordering::Relaxed);
                real.locker.lock().lock_shared(index_id, key, timeout)
            }
        }
    }

    /// Acquire an upgradable lock; no-op on the bogus transaction.
    pub fn lock_upgradable(&self, index_id: IndexId, key: &[u8]) -> Result<LockResult> {
        match self.real() {
            None => Ok(LockResult::Unowned),
            Some(real) => {
                let timeout = real.timeout.load(Ordering::Relaxed);
                real.locker.lock().lock_upgradable(index_id, key, timeout)
            }
        }
    }

    /// Acquire an exclusive lock; no-op on the bogus transaction.
    pub fn lock_exclusive(&self, index_id: IndexId, key: &[u8]) -> Result<LockResult> {
        match self.real() {
            None => Ok(LockResult::Unowned),
            Some(real) => {
                let timeout = real.timeout.load(Ordering::Relaxed);
                real.locker.lock().lock_exclusive(index_id, key, timeout)
            }
        }
    }

    /// Check lock ownership for a key.
    #[must_use]
    pub fn lock_check(&self, index_id: IndexId, key: &[u8]) -> LockResult {
        match self.real() {
            None => LockResult::Unowned,
            Some(real) => real.locker.lock().lock_check(index_id, key),
        }
    }

    /// Index id of the last lock acquired within the current scope.
    pub fn last_locked_index(&self) -> Result<IndexId> {
        self.real_or_err()?.locker.lock().last_locked_index()
    }

    /// Key of the last lock acquired within the current scope.
    pub fn last_locked_key(&self) -> Result<Option<Vec<u8>>> {
        self.real_or_err()?.locker.lock().last_locked_key()
    }

    /// Fully release the most recently acquired lock.
    pub fn unlock(&self) -> Result<()> {
        self.real_or_err()?.locker.lock().unlock()
    }

    /// Release the most recent lock down to shared.
    pub fn unlock_to_shared(&self) -> Result<()> {
        self.real_or_err()?.locker.lock().unlock_to_shared()
    }

    /// Release the most recent lock down to upgradable.
    pub fn unlock_to_upgradable(&self) -> Result<()> {
        self.real_or_err()?.locker.lock().unlock_to_upgradable()
    }

    /// Combine the last two lock operations into one unlock group.
    pub fn unlock_combine(&self) -> Result<()> {
        self.real_or_err()?.locker.lock().unlock_combine()
    }

    /// Number of lock-stack frames held (diagnostics).
    #[must_use]
    pub fn held_lock_count(&self) -> usize {
        self.real().map_or(0, |r| r.locker.lock().held_count())
    }

    pub(crate) fn read_lock(&self, index_id: IndexId, key: &[u8]) -> Result<()> {
        let Some(real) = self.real() else {
            return Ok(());
        };
        let timeout = real.timeout.load(Ordering::Relaxed);
        match self.lock_mode() {
            LockMode::Unsafe | LockMode::ReadUncommitted => Ok(()),
            LockMode::ReadCommitted => {
                let mut locker = real.locker.lock();
                if locker.lock_shared(index_id, key, timeout)? == LockResult::Acquired {
                    locker.unlock()?;
                }
                Ok(())
            }
            LockMode::RepeatableRead => {
                real.locker.lock().lock_shared(index_id, key, timeout)?;
                Ok(())
            }
            LockMode::UpgradableRead => {
                real.locker.lock().lock_upgradable(index_id, key, timeout)?;
                Ok(())
            }
        }
    }

    // -- Undo / trash coupling -------------------------------------------

    pub(crate) fn push_undo(&self, record: UndoRecord) {
        if let Some(real) = self.real() {
            real.undo.lock().push(record);
        }
    }

    /// Move a fragmented value's descriptor into the trash and append the
    /// matching undo record. Any failure while writing the trash record
    /// promotes this transaction to the borked state.
    pub(crate) fn trash_fragmented(
        &self,
        index_id: IndexId,
        key: &[u8],
        descriptor: &[u8],
    ) -> Result<()> {
        let real = self.real_or_err()?;
        self.set_flag(FLAG_HAS_TRASH);
        let payload = match real.db.trash.add(real.txn_id, key, descriptor) {
            Ok(payload) => payload,
            Err(err) => {
                self.set_borked(format!("trash write failed: {err}"));
                return Err(err);
            }
        };
        self.push_undo(UndoRecord::ReclaimFragmented { index_id, payload });
        Ok(())
    }

    pub(crate) fn append_redo(&self, record: RedoRecord) {
        if let Some(real) = self.real() {
            real.db.redo.append(record);
        }
    }

    // -- Lifecycle -------------------------------------------------------

    /// Enter a nested scope.
    pub fn enter(&self) -> Result<()> {
        let real = self.real_or_err()?;
        real.locker.lock().scope_enter();
        real.scopes.lock().push(ScopeSave {
            undo_len: real.undo.lock().len(),
            lock_mode: self.lock_mode(),
            timeout: real.timeout.load(Ordering::Relaxed),
        });
        Ok(())
    }

    /// Exit the current scope, rolling back everything done in it. On the
    /// outermost scope this is a full rollback; the transaction remains
    /// usable.
    pub fn exit(&self) -> Result<()> {
        let Some(real) = self.real() else {
            return Ok(());
        };
        let save = real.scopes.lock().pop();
        match save {
            Some(save) => {
                let records = real.undo.lock().split_off(save.undo_len);
                replay(&real.db, real.txn_id, records)?;
                real.locker.lock().scope_exit()?;
                real.lock_mode.store(save.lock_mode.as_u8(), Ordering::Relaxed);
                real.timeout.store(save.timeout, Ordering::Relaxed);
                Ok(())
            }
            None => self.reset(),
        }
    }

    /// Commit. In a nested scope, promotes locks and undo to the parent;
    /// at the top level, makes the transaction's effects permanent and
    /// releases all locks.
    pub fn commit(&self) -> Result<()> {
        let Some(real) = self.real() else {
            return Ok(());
        };
        self.ensure_not_borked()?;

        let save = real.scopes.lock().pop();
        if let Some(save) = save {
            let mut locker = real.locker.lock();
            locker.promote();
            locker.scope_exit()?;
            real.lock_mode.store(save.lock_mode.as_u8(), Ordering::Relaxed);
            real.timeout.store(save.timeout, Ordering::Relaxed);
            return Ok(());
        }

        let wrote = !real.undo.lock().is_empty() || self.has_trash();
        if wrote {
            real.db.redo.append(RedoRecord::Commit {
                txn_id: real.txn_id,
            });
        }
        if self.has_trash() {
            real.db.trash.empty_trash(real.txn_id)?;
        }
        real.undo.lock().clear();
        real.locker.lock().scope_exit_all()?;
        real.flags.store(0, Ordering::Relaxed);
        if wrote {
            info!(txn_id = %real.txn_id, "transaction committed");
        }
        Ok(())
    }

    /// Commit with deferred lock release: the commit record is appended
    /// and the exclusive locks move into a [`PendingCommit`], completed
    /// once the record is known durable.
    pub fn commit_pending(&self) -> Result<PendingCommit> {
        let real = self.real_or_err()?;
        self.ensure_not_borked()?;
        if self.is_nested() {
            return Err(BurrowError::IllegalState("cannot defer a nested commit"));
        }

        let position = real.db.redo.append(RedoRecord::Commit {
            txn_id: real.txn_id,
        });
        let pending = real.locker.lock().transfer_exclusive();
        let trash_pending = self.has_trash();
        real.undo.lock().clear();
        real.flags.store(0, Ordering::Relaxed);
        debug!(txn_id = %real.txn_id, position, "commit pending durability");

        Ok(PendingCommit {
            db: Arc::clone(&real.db),
            txn_id: real.txn_id,
            pending,
            position,
            trash_pending,
        })
    }

    /// Roll everything back, exit all scopes, and clear failure state.
    pub fn reset(&self) -> Result<()> {
        let Some(real) = self.real() else {
            return Ok(());
        };
        let records = std::mem::take(&mut *real.undo.lock());
        let rolled_back = !records.is_empty();
        replay(&real.db, real.txn_id, records)?;
        real.scopes.lock().clear();
        real.locker.lock().scope_exit_all()?;
        real.flags.store(0, Ordering::Relaxed);
        *real.borked_reason.lock() = None;
        if rolled_back {
            info!(txn_id = %real.txn_id, "transaction rolled back");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.real() {
            None => f.write_str("Transaction(bogus)"),
            Some(real) => f
                .debug_struct("Transaction")
                .field("txn_id", &real.txn_id)
                .field("nesting", &real.scopes.lock().len())
                .field("held_locks", &real.locker.lock().held_count())
                .finish_non_exhaustive(),
        }
    }
}

/// A commit whose lock release is gated on redo durability.
pub struct PendingCommit {
    db: Arc<DbInner>,
    txn_id: TxnId,
    pending: PendingTxn,
    position: LogPosition,
    trash_pending: bool,
}

impl PendingCommit {
    /// Redo-log position of the commit record.
    #[must_use]
    pub fn log_position(&self) -> LogPosition {
        self.position
    }

    /// Number of exclusive locks held until completion.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.pending.lock_count()
    }

    /// Complete the commit: drain trash and release the lock bundle.
    /// Call once the commit record is known durable.
    pub fn finish(self) -> Result<()> {
        if self.trash_pending {
            self.db.trash.empty_trash(self.txn_id)?;
        }
        self.pending.release();
        Ok(())
    }

    /// Block until the commit record is durable, then finish.
    pub fn wait_and_finish(self) -> Result<()> {
        self.db.redo.wait_for_durable(self.position);
        self.finish()
    }
}
