//! Scoped stacks of held locks.
//!
//! A [`Locker`] accumulates the locks a transaction (or ad-hoc locker)
//! holds, in LIFO order, across zero or more nested scopes. Instances are
//! single-threaded: they may be handed between threads under a
//! happens-before edge but never used concurrently.
//!
//! Stack storage is amortized: a single hold is stored inline; further
//! frames occupy linked blocks whose capacity doubles from 8 up to a hard
//! cap of 64 entries. The cap keeps the per-frame `upgrades` and
//! `unlock_group` metadata in single 64-bit words, which is what makes the
//! rightmost-zero-bit trick in [`Locker::unlock_combine`] work.

use std::mem;
use std::sync::Arc;

use burrow_error::{BurrowError, OwnerAttachment, Result};
use burrow_types::IndexId;

use crate::detector::detect;
use crate::pending::PendingTxn;
use crate::result::{LockResult, LockType};
use crate::table::{LockId, LockManager, NanosTimeout, ScopeId};

const FIRST_BLOCK_CAPACITY: usize = 8;
const HIGHEST_BLOCK_CAPACITY: usize = 64;
const TOP_BIT: u64 = 1 << 63;

// ---------------------------------------------------------------------------
// Frame storage
// ---------------------------------------------------------------------------

struct Block {
    locks: Vec<LockId>,
    cap: usize,
    /// Bit `TOP_BIT >> i` set: frame `i` records an upgrade.
    upgrades: u64,
    /// Bit `TOP_BIT >> i` set: frame `i` releases together with `i - 1`.
    unlock_group: u64,
    prev: Option<Box<Block>>,
}

impl Block {
    fn single(lock: LockId, upgrade: bool) -> Box<Self> {
        Box::new(Self {
            locks: vec![lock],
            cap: FIRST_BLOCK_CAPACITY,
            upgrades: if upgrade { TOP_BIT } else { 0 },
            unlock_group: 0,
            prev: None,
        })
    }

    fn pair(first: LockId, second: LockId, second_upgrade: bool) -> Box<Self> {
        Box::new(Self {
            locks: vec![first, second],
            cap: FIRST_BLOCK_CAPACITY,
            upgrades: if second_upgrade { TOP_BIT >> 1 } else { 0 },
            unlock_group: 0,
            prev: None,
        })
    }

    fn chained(prev: Box<Self>, first: LockId, upgrade: bool) -> Box<Self> {
        let cap = (prev.cap * 2).clamp(FIRST_BLOCK_CAPACITY, HIGHEST_BLOCK_CAPACITY);
        Box::new(Self {
            locks: vec![first],
            cap,
            upgrades: if upgrade { TOP_BIT } else { 0 },
            unlock_group: 0,
            prev: Some(prev),
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.locks.len()
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.locks.len() >= self.cap
    }
}

enum Tail {
    Empty,
    One(LockId),
    Blocks(Box<Block>),
}

/// Marker capturing the stack height at scope entry.
struct ParentScope {
    parent: Option<Box<ParentScope>>,
    saved_len: usize,
}

// ---------------------------------------------------------------------------
// Locker
// ---------------------------------------------------------------------------

/// A scope owning a LIFO stack of acquired locks.
pub struct Locker {
    mgr: Arc<LockManager>,
    scope: ScopeId,
    tail: Tail,
    parent: Option<Box<ParentScope>>,
    /// Total frames across all scopes.
    len: usize,
}

impl Locker {
    /// Register a new scope with the manager.
    #[must_use]
    pub fn new(mgr: &Arc<LockManager>) -> Self {
        let scope = mgr.register_scope();
        Self {
            mgr: Arc::clone(mgr),
            scope,
            tail: Tail::Empty,
            parent: None,
            len: 0,
        }
    }

    /// The scope handle registered with the manager.
    #[must_use]
    pub fn scope_id(&self) -> ScopeId {
        self.scope
    }

    /// The lock manager this scope is registered with.
    #[must_use]
    pub fn manager(&self) -> &Arc<LockManager> {
        &self.mgr
    }

    /// Number of frames currently on the stack, across all scopes.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.len
    }

    /// Whether the current scope is nested.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    /// Nesting depth; zero when non-nested.
    #[must_use]
    pub fn nesting_level(&self) -> usize {
        let mut count = 0;
        let mut parent = self.parent.as_deref();
        while let Some(p) = parent {
            count += 1;
            parent = p.parent.as_deref();
        }
        count
    }

    /// Attach an opaque object, surfaced to requesters this scope blocks.
    pub fn attach(&self, attachment: Option<OwnerAttachment>) {
        self.mgr.attach(self.scope, attachment);
    }

    /// This scope's attachment.
    #[must_use]
    pub fn attachment(&self) -> Option<OwnerAttachment> {
        self.mgr.attachment(self.scope)
    }

    // -- Acquisition -----------------------------------------------------

    /// Attempt a shared lock. Timeout expiry runs the deadlock detector
    /// (unless the timeout was zero) and surfaces any cycle as an error.
    pub fn try_lock_shared(
        &mut self,
        index_id: IndexId,
        key: &[u8],
        timeout: NanosTimeout,
    ) -> Result<LockResult> {
        Ok(self.try_lock_full(LockType::Shared, index_id, key, timeout)?.0)
    }

    /// Attempt an upgradable lock.
    pub fn try_lock_upgradable(
        &mut self,
        index_id: IndexId,
        key: &[u8],
        timeout: NanosTimeout,
    ) -> Result<LockResult> {
        Ok(self
            .try_lock_full(LockType::Upgradable, index_id, key, timeout)?
            .0)
    }

    /// Attempt an exclusive lock.
    pub fn try_lock_exclusive(
        &mut self,
        index_id: IndexId,
        key: &[u8],
        timeout: NanosTimeout,
    ) -> Result<LockResult> {
        Ok(self
            .try_lock_full(LockType::Exclusive, index_id, key, timeout)?
            .0)
    }

    /// Acquire a shared lock or fail with a specific error.
    pub fn lock_shared(
        &mut self,
        index_id: IndexId,
        key: &[u8],
        timeout: NanosTimeout,
    ) -> Result<LockResult> {
        self.lock_required(LockType::Shared, index_id, key, timeout)
    }

    /// Acquire an upgradable lock or fail with a specific error.
    pub fn lock_upgradable(
        &mut self,
        index_id: IndexId,
        key: &[u8],
        timeout: NanosTimeout,
    ) -> Result<LockResult> {
        self.lock_required(LockType::Upgradable, index_id, key, timeout)
    }

    /// Acquire an exclusive lock or fail with a specific error.
    pub fn lock_exclusive(
        &mut self,
        index_id: IndexId,
        key: &[u8],
        timeout: NanosTimeout,
    ) -> Result<LockResult> {
        self.lock_required(LockType::Exclusive, index_id, key, timeout)
    }

    fn lock_required(
        &mut self,
        ty: LockType,
        index_id: IndexId,
        key: &[u8],
        timeout: NanosTimeout,
    ) -> Result<LockResult> {
        let (result, attachment) = self.try_lock_full(ty, index_id, key, timeout)?;
        if result.is_held() {
            return Ok(result);
        }
        Err(match result {
            LockResult::Illegal => BurrowError::IllegalUpgrade,
            LockResult::Interrupted => BurrowError::LockInterrupted,
            LockResult::TimedOutLock => BurrowError::LockTimeout {
                nanos_waited: timeout.unsigned_abs(),
                owner_attachment: attachment,
            },
            _ => BurrowError::LockFailure("lock not acquired"),
        })
    }

    fn try_lock_full(
        &mut self,
        ty: LockType,
        index_id: IndexId,
        key: &[u8],
        timeout: NanosTimeout,
    ) -> Result<(LockResult, Option<OwnerAttachment>)> {
        let (result, lock) = self.mgr.try_lock(ty, self.scope, index_id, key, timeout);
        match result {
            LockResult::Acquired => {
                self.push(lock.expect("acquired result carries a lock"));
            }
            LockResult::Upgraded => {
                self.push_upgrade(lock.expect("upgraded result carries a lock"));
            }
            LockResult::TimedOutLock => {
                // The wait pointer is left in place for the detector and
                // cleared afterwards; zero-timeout requests never wait and
                // never run detection.
                if let Some(waiting) = self.mgr.scope_waiting_for(self.scope) {
                    let attachment = self.mgr.find_owner_attachment(waiting);
                    let cycle = if timeout != 0 {
                        detect(&self.mgr, self.scope)
                    } else {
                        None
                    };
                    self.mgr.clear_waiting(self.scope);
                    if let Some((set, guilty)) = cycle {
                        return Err(BurrowError::Deadlock {
                            set,
                            guilty,
                            nanos_waited: timeout.unsigned_abs(),
                        });
                    }
                    return Ok((result, attachment));
                }
            }
            _ => {}
        }
        Ok((result, None))
    }

    /// Check ownership of `(index_id, key)` without acquiring.
    #[must_use]
    pub fn lock_check(&self, index_id: IndexId, key: &[u8]) -> LockResult {
        self.mgr.check(self.scope, index_id, key)
    }

    /// Index id of the last lock acquired within the current scope.
    pub fn last_locked_index(&self) -> Result<IndexId> {
        Ok(self.peek_info()?.0)
    }

    /// Key of the last lock acquired within the current scope.
    pub fn last_locked_key(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.peek_info()?.1.map(|k| k.to_vec()))
    }

    fn peek_info(&self) -> Result<(IndexId, Option<Arc<[u8]>>)> {
        let lock = self
            .top_lock()
            .ok_or(BurrowError::IllegalState("no locks held"))?;
        self.mgr
            .lock_info(lock)
            .ok_or(BurrowError::IllegalState("no locks held"))
    }

    // -- Stack maintenance -----------------------------------------------

    pub(crate) fn push(&mut self, lock: LockId) {
        self.push_frame(lock, false);
    }

    pub(crate) fn push_upgrade(&mut self, lock: LockId) {
        // An upgrade of the immediately preceding acquisition within the
        // same scope is coalesced, so unlocking the top frame releases
        // both together.
        if self.top_lock() == Some(lock) && self.top_in_current_scope() {
            return;
        }
        self.push_frame(lock, true);
    }

    fn push_frame(&mut self, lock: LockId, upgrade: bool) {
        self.len += 1;
        self.tail = match mem::replace(&mut self.tail, Tail::Empty) {
            Tail::Empty => {
                if upgrade {
                    Tail::Blocks(Block::single(lock, true))
                } else {
                    Tail::One(lock)
                }
            }
            Tail::One(first) => Tail::Blocks(Block::pair(first, lock, upgrade)),
            Tail::Blocks(mut block) => {
                if block.is_full() {
                    Tail::Blocks(Block::chained(block, lock, upgrade))
                } else {
                    let i = block.len();
                    block.locks.push(lock);
                    if upgrade {
                        block.upgrades |= TOP_BIT >> i;
                    }
                    Tail::Blocks(block)
                }
            }
        };
    }

    fn top_lock(&self) -> Option<LockId> {
        match &self.tail {
            Tail::Empty => None,
            Tail::One(lock) => Some(*lock),
            Tail::Blocks(block) => block.locks.last().copied(),
        }
    }

    fn top_in_current_scope(&self) -> bool {
        match &self.parent {
            None => true,
            Some(p) => self.len > p.saved_len,
        }
    }

    fn top_is_upgrade(&self) -> bool {
        match &self.tail {
            Tail::Blocks(block) => {
                let i = block.len() - 1;
                block.upgrades & (TOP_BIT >> i) != 0
            }
            Tail::Empty | Tail::One(_) => false,
        }
    }

    /// Frame `depth` below the top: `(lock, is_upgrade, grouped_with_next)`.
    fn frame_at(&self, depth: usize) -> Option<(LockId, bool, bool)> {
        match &self.tail {
            Tail::Empty => None,
            Tail::One(lock) => (depth == 0).then_some((*lock, false, false)),
            Tail::Blocks(block) => {
                let mut block = block;
                let mut depth = depth;
                loop {
                    if depth < block.len() {
                        let i = block.len() - 1 - depth;
                        let mask = TOP_BIT >> i;
                        return Some((
                            block.locks[i],
                            block.upgrades & mask != 0,
                            block.unlock_group & mask != 0,
                        ));
                    }
                    depth -= block.len();
                    block = block.prev.as_ref()?;
                }
            }
        }
    }

    fn pop_top(&mut self) -> (LockId, bool) {
        self.len -= 1;
        match mem::replace(&mut self.tail, Tail::Empty) {
            Tail::Empty => unreachable!("caller checks for an empty stack"),
            Tail::One(lock) => (lock, false),
            Tail::Blocks(mut block) => {
                let i = block.len() - 1;
                let mask = TOP_BIT >> i;
                let lock = block.locks.pop().expect("block is never empty");
                let grouped = block.unlock_group & mask != 0;
                block.upgrades &= !mask;
                block.unlock_group &= !mask;
                self.tail = if block.locks.is_empty() {
                    match block.prev.take() {
                        Some(prev) => Tail::Blocks(prev),
                        None => Tail::Empty,
                    }
                } else {
                    Tail::Blocks(block)
                };
                (lock, grouped)
            }
        }
    }

    fn ensure_top_unlockable(&self) -> Result<()> {
        if self.len == 0 {
            return Err(BurrowError::IllegalState("no locks held"));
        }
        if let Some(p) = &self.parent {
            if self.len == p.saved_len {
                return Err(BurrowError::IllegalState("cannot cross a scope boundary"));
            }
        }
        Ok(())
    }

    fn check_frame_boundary(&self, depth: usize) -> Result<()> {
        let abs = self
            .len
            .checked_sub(1 + depth)
            .ok_or(BurrowError::IllegalState("no locks held"))?;
        if let Some(p) = &self.parent {
            if abs < p.saved_len {
                return Err(BurrowError::IllegalState("cannot cross a scope boundary"));
            }
        }
        Ok(())
    }

    // -- Release ---------------------------------------------------------

    /// Fully release the top frame (or group), within the current scope.
    pub fn unlock(&mut self) -> Result<()> {
        self.ensure_top_unlockable()?;
        loop {
            if self.top_is_upgrade() {
                return Err(BurrowError::IllegalState(
                    "cannot unlock non-immediate upgrade",
                ));
            }
            let (lock, grouped) = self.pop_top();
            self.mgr
                .unlock(self.scope, lock)
                .map_err(BurrowError::IllegalState)?;
            if !grouped {
                return Ok(());
            }
            self.ensure_top_unlockable()?;
        }
    }

    /// Release the top frame (or group), retaining a shared hold.
    pub fn unlock_to_shared(&mut self) -> Result<()> {
        self.ensure_top_unlockable()?;
        let mut depth = 0;
        loop {
            let (lock, upgrade, grouped) = self.frame_at(depth).expect("depth bounded by len");
            if upgrade {
                return Err(BurrowError::IllegalState(
                    "cannot unlock non-immediate upgrade",
                ));
            }
            self.mgr
                .unlock_to_shared(self.scope, lock)
                .map_err(BurrowError::IllegalState)?;
            if !grouped {
                return Ok(());
            }
            depth += 1;
            self.check_frame_boundary(depth)?;
        }
    }

    /// Release the top frame (or group), retaining an upgradable hold.
    /// Upgrade frames revert to the pre-upgrade state and leave the stack.
    pub fn unlock_to_upgradable(&mut self) -> Result<()> {
        self.ensure_top_unlockable()?;
        let mut depth = 0;
        loop {
            let (lock, upgrade, grouped) = self.frame_at(depth).expect("depth bounded by len");
            self.mgr
                .unlock_to_upgradable(self.scope, lock)
                .map_err(BurrowError::IllegalState)?;
            if upgrade {
                // Groups are homogeneous, so an upgrade frame is always the
                // current top here.
                debug_assert_eq!(depth, 0);
                let (_, popped_grouped) = self.pop_top();
                if !popped_grouped {
                    return Ok(());
                }
                self.ensure_top_unlockable()?;
            } else {
                if !grouped {
                    return Ok(());
                }
                depth += 1;
                self.check_frame_boundary(depth)?;
            }
        }
    }

    /// Combine the top frame into a group with the frame below, so later
    /// `unlock*` calls cascade through both.
    pub fn unlock_combine(&mut self) -> Result<()> {
        match &mut self.tail {
            Tail::Empty => Err(BurrowError::IllegalState("no locks held")),
            Tail::One(_) => {
                self.ensure_top_unlockable()?;
                // Group of one, nothing to do.
                Ok(())
            }
            Tail::Blocks(block) => Self::combine_block(block),
        }
    }

    fn combine_block(block: &mut Block) -> Result<()> {
        let size = block.len() - 1;

        // Set all unused rightmost bits, then isolate the rightmost zero
        // bit: the newest frame not already in a group.
        let mask = block.unlock_group | (!TOP_BIT >> size);
        let mask = !mask & mask.wrapping_add(1);

        if mask == 0 {
            return match &mut block.prev {
                Some(prev) => Self::combine_block(prev),
                None => Ok(()),
            };
        }

        let upgrades = block.upgrades;
        let prev_mask = if size == 0 {
            match &block.prev {
                // Group of one, so nothing to do.
                None => return Ok(()),
                Some(prev) => prev.upgrades << (prev.len() - 1),
            }
        } else {
            upgrades >> 1
        };

        if (upgrades ^ prev_mask) & mask != 0 {
            return Err(BurrowError::IllegalState(
                "cannot combine an acquire with an upgrade",
            ));
        }

        block.unlock_group |= mask;
        Ok(())
    }

    // -- Scopes ----------------------------------------------------------

    /// Enter a nested scope.
    pub fn scope_enter(&mut self) {
        let parent = ParentScope {
            parent: self.parent.take(),
            saved_len: self.len,
        };
        self.parent = Some(Box::new(parent));
    }

    /// Reassign everything acquired in the current scope to the parent.
    pub fn promote(&mut self) {
        if let Some(p) = &mut self.parent {
            p.saved_len = self.len;
        }
    }

    /// Release all locks acquired within the current scope, without exiting.
    pub fn scope_unlock_all(&mut self) -> Result<()> {
        let target = self.parent.as_ref().map_or(0, |p| p.saved_len);
        self.unlock_to_len(target)
    }

    fn unlock_to_len(&mut self, target: usize) -> Result<()> {
        while self.len > target {
            let upgrade = self.top_is_upgrade();
            let (lock, _) = self.pop_top();
            let released = if upgrade {
                self.mgr.unlock_to_upgradable(self.scope, lock)
            } else {
                self.mgr.unlock(self.scope, lock)
            };
            released.map_err(BurrowError::IllegalState)?;
        }
        Ok(())
    }

    /// Exit the current scope, releasing everything acquired in it.
    pub fn scope_exit(&mut self) -> Result<()> {
        self.scope_unlock_all()?;
        if let Some(p) = self.parent.take() {
            self.parent = p.parent;
        }
        Ok(())
    }

    /// Release all locks and exit all scopes.
    pub fn scope_exit_all(&mut self) -> Result<()> {
        self.parent = None;
        self.scope_unlock_all()
    }

    /// Discard all locks without releasing them. They leak; only call in
    /// response to a fatal error.
    pub fn discard_all_locks(&mut self) {
        self.parent = None;
        self.tail = Tail::Empty;
        self.len = 0;
    }

    /// Transfer every exclusive lock into a [`PendingTxn`] bundle; all
    /// other holds are released immediately. The stack empties and all
    /// scopes exit.
    #[must_use]
    pub fn transfer_exclusive(&mut self) -> PendingTxn {
        let mut pending = PendingTxn::new(&self.mgr);
        while self.len > 0 {
            let (lock, _) = self.pop_top();
            if self.mgr.transfer_exclusive(self.scope, lock, pending.scope()) {
                pending.add(lock);
            }
        }
        self.parent = None;
        pending
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.parent = None;
        let _ = self.scope_unlock_all();
        self.mgr.unregister_scope(self.scope);
    }
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("scope", &self.scope)
            .field("held", &self.len)
            .field("nesting", &self.nesting_level())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::LockUpgradeRule;
    use crate::table::DEFAULT_LOCK_TABLE_SHARDS;

    const IX: IndexId = IndexId::new(7);

    fn manager() -> Arc<LockManager> {
        LockManager::new(DEFAULT_LOCK_TABLE_SHARDS, LockUpgradeRule::Strict)
    }

    fn illegal_state(err: &BurrowError) -> &'static str {
        match err {
            BurrowError::IllegalState(msg) => msg,
            other => panic!("expected IllegalState, got {other:?}"),
        }
    }

    #[test]
    fn unlock_with_empty_stack_fails() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);
        let err = locker.unlock().unwrap_err();
        assert_eq!(illegal_state(&err), "no locks held");
    }

    #[test]
    fn push_and_unlock_many() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        // Enough frames to cross several block boundaries.
        for i in 0..100u32 {
            let key = i.to_be_bytes();
            assert_eq!(
                locker.try_lock_exclusive(IX, &key, -1).unwrap(),
                LockResult::Acquired
            );
        }
        assert_eq!(locker.held_count(), 100);

        for i in (0..100u32).rev() {
            let key = i.to_be_bytes();
            assert_eq!(locker.last_locked_key().unwrap().as_deref(), Some(&key[..]));
            locker.unlock().unwrap();
        }
        assert_eq!(locker.held_count(), 0);
    }

    #[test]
    fn upgrade_of_immediate_acquire_coalesces() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        assert_eq!(
            locker.try_lock_upgradable(IX, b"k", -1).unwrap(),
            LockResult::Acquired
        );
        assert_eq!(locker.held_count(), 1);
        assert_eq!(
            locker.try_lock_exclusive(IX, b"k", -1).unwrap(),
            LockResult::Upgraded
        );
        // Coalesced: stack size unchanged.
        assert_eq!(locker.held_count(), 1);

        // Unlock releases both together.
        locker.unlock().unwrap();
        assert_eq!(locker.lock_check(IX, b"k"), LockResult::Unowned);
    }

    #[test]
    fn non_immediate_upgrade_cannot_be_unlocked() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.try_lock_upgradable(IX, b"a", -1).unwrap();
        locker.try_lock_exclusive(IX, b"b", -1).unwrap();
        // Upgrading "a" is no longer immediate; it pushes a frame.
        assert_eq!(
            locker.try_lock_exclusive(IX, b"a", -1).unwrap(),
            LockResult::Upgraded
        );
        assert_eq!(locker.held_count(), 3);

        let err = locker.unlock().unwrap_err();
        assert_eq!(illegal_state(&err), "cannot unlock non-immediate upgrade");

        // Reverting to upgradable pops the upgrade frame instead.
        locker.unlock_to_upgradable().unwrap();
        assert_eq!(locker.held_count(), 2);
        assert_eq!(locker.lock_check(IX, b"a"), LockResult::OwnedUpgradable);
    }

    #[test]
    fn unlock_to_shared_downgrades_top() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.try_lock_exclusive(IX, b"k", -1).unwrap();
        locker.unlock_to_shared().unwrap();
        assert_eq!(locker.lock_check(IX, b"k"), LockResult::OwnedShared);
        assert_eq!(locker.held_count(), 1);

        locker.unlock().unwrap();
        assert_eq!(locker.lock_check(IX, b"k"), LockResult::Unowned);
    }

    #[test]
    fn combine_releases_group_together() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.try_lock_exclusive(IX, b"a", -1).unwrap();
        locker.try_lock_exclusive(IX, b"b", -1).unwrap();
        locker.try_lock_exclusive(IX, b"c", -1).unwrap();
        locker.unlock_combine().unwrap(); // c with b
        locker.unlock_combine().unwrap(); // b with a

        locker.unlock().unwrap();
        assert_eq!(locker.held_count(), 0);
        assert_eq!(locker.lock_check(IX, b"a"), LockResult::Unowned);
        assert_eq!(locker.lock_check(IX, b"b"), LockResult::Unowned);
        assert_eq!(locker.lock_check(IX, b"c"), LockResult::Unowned);
    }

    #[test]
    fn combine_rejects_mixed_kinds() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.try_lock_upgradable(IX, b"a", -1).unwrap();
        locker.try_lock_exclusive(IX, b"b", -1).unwrap();
        // Non-immediate upgrade of "a" pushes an upgrade frame on top of
        // the plain acquire of "b".
        locker.try_lock_exclusive(IX, b"a", -1).unwrap();

        let err = locker.unlock_combine().unwrap_err();
        assert_eq!(
            illegal_state(&err),
            "cannot combine an acquire with an upgrade"
        );
    }

    #[test]
    fn scope_exit_releases_only_inner_locks() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.try_lock_exclusive(IX, b"outer", -1).unwrap();
        locker.scope_enter();
        locker.try_lock_exclusive(IX, b"inner1", -1).unwrap();
        locker.try_lock_exclusive(IX, b"inner2", -1).unwrap();
        assert!(locker.is_nested());
        assert_eq!(locker.nesting_level(), 1);
        assert_eq!(locker.held_count(), 3);

        locker.scope_exit().unwrap();
        assert_eq!(locker.held_count(), 1);
        assert_eq!(locker.lock_check(IX, b"outer"), LockResult::OwnedExclusive);
        assert_eq!(locker.lock_check(IX, b"inner1"), LockResult::Unowned);
        assert_eq!(locker.lock_check(IX, b"inner2"), LockResult::Unowned);
    }

    #[test]
    fn unlock_cannot_cross_scope_boundary() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.try_lock_exclusive(IX, b"outer", -1).unwrap();
        locker.scope_enter();

        let err = locker.unlock().unwrap_err();
        assert_eq!(illegal_state(&err), "cannot cross a scope boundary");

        let err = locker.unlock_to_shared().unwrap_err();
        assert_eq!(illegal_state(&err), "cannot cross a scope boundary");
    }

    #[test]
    fn promote_moves_locks_to_parent() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.scope_enter();
        locker.try_lock_exclusive(IX, b"k", -1).unwrap();
        locker.promote();
        locker.scope_exit().unwrap();

        // Promoted lock survived the scope exit.
        assert_eq!(locker.lock_check(IX, b"k"), LockResult::OwnedExclusive);
        assert_eq!(locker.held_count(), 1);
        locker.unlock().unwrap();
    }

    #[test]
    fn scope_unlock_all_keeps_scope_open() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.try_lock_exclusive(IX, b"outer", -1).unwrap();
        locker.scope_enter();
        locker.try_lock_exclusive(IX, b"inner", -1).unwrap();

        locker.scope_unlock_all().unwrap();
        assert!(locker.is_nested());
        assert_eq!(locker.lock_check(IX, b"inner"), LockResult::Unowned);
        assert_eq!(locker.lock_check(IX, b"outer"), LockResult::OwnedExclusive);

        // The scope is still usable afterwards.
        locker.try_lock_exclusive(IX, b"again", -1).unwrap();
        locker.scope_exit().unwrap();
        assert_eq!(locker.held_count(), 1);
    }

    #[test]
    fn transfer_exclusive_bundles_exclusive_locks() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.try_lock_exclusive(IX, b"x1", -1).unwrap();
        locker.try_lock_shared(IX, b"s1", -1).unwrap();
        locker.try_lock_exclusive(IX, b"x2", -1).unwrap();

        let pending = locker.transfer_exclusive();
        assert_eq!(pending.lock_count(), 2);
        assert_eq!(locker.held_count(), 0);

        // Shared hold was released immediately; exclusives remain held by
        // the pending bundle.
        assert_eq!(locker.lock_check(IX, b"s1"), LockResult::Unowned);
        let mut other = Locker::new(&mgr);
        assert_eq!(
            other.try_lock_exclusive(IX, b"x1", 0).unwrap(),
            LockResult::TimedOutLock
        );

        pending.release();
        assert_eq!(
            other.try_lock_exclusive(IX, b"x1", 0).unwrap(),
            LockResult::Acquired
        );
    }

    #[test]
    fn drop_releases_held_locks() {
        let mgr = manager();
        {
            let mut locker = Locker::new(&mgr);
            locker.try_lock_exclusive(IX, b"k", -1).unwrap();
        }
        let mut other = Locker::new(&mgr);
        assert_eq!(
            other.try_lock_exclusive(IX, b"k", 0).unwrap(),
            LockResult::Acquired
        );
    }

    #[test]
    fn discard_all_locks_leaks_by_design() {
        let mgr = manager();
        let mut other = Locker::new(&mgr);
        {
            let mut locker = Locker::new(&mgr);
            locker.try_lock_exclusive(IX, b"k", -1).unwrap();
            locker.discard_all_locks();
        }
        // The discarded lock was never released, not even by drop.
        assert_eq!(
            other.try_lock_exclusive(IX, b"k", 0).unwrap(),
            LockResult::TimedOutLock
        );
    }

    #[test]
    fn grouped_upgrades_release_together() {
        let mgr = manager();
        let mut locker = Locker::new(&mgr);

        locker.try_lock_upgradable(IX, b"a", -1).unwrap();
        locker.try_lock_upgradable(IX, b"b", -1).unwrap();
        // Two non-immediate upgrades, then combine them.
        locker.try_lock_exclusive(IX, b"a", -1).unwrap();
        locker.try_lock_exclusive(IX, b"b", -1).unwrap();
        assert_eq!(locker.held_count(), 4);
        locker.unlock_combine().unwrap();

        locker.unlock_to_upgradable().unwrap();
        assert_eq!(locker.held_count(), 2);
        assert_eq!(locker.lock_check(IX, b"a"), LockResult::OwnedUpgradable);
        assert_eq!(locker.lock_check(IX, b"b"), LockResult::OwnedUpgradable);
    }
}
