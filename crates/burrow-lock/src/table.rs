//! Sharded lock table.
//!
//! Resources are `(IndexId, key)` pairs. Each resource maps to a [`Lock`]
//! record in one of a power-of-two number of shards; shard selection mixes a
//! Fowler-Noll-Vo digest of the key with the index id. Locks are created
//! lazily on first acquisition and recycled as soon as the owner set and
//! waiter queues are both empty.
//!
//! Scopes and locks reference each other exclusively through integer
//! handles ([`ScopeId`], [`LockId`]), so the ownership graph contains no
//! reference cycles and the deadlock detector can walk handle-to-handle
//! edges from snapshots.
//!
//! Waiters are queued FIFO per class and served in enqueue order subject to
//! compatibility: `queue_u` holds requesters of the single owner slot
//! (upgradable, and the first phase of exclusive), `queue_sx` holds blocked
//! shared requesters plus the head-of-line upgrade-to-exclusive waiter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;
use tracing::debug;

use burrow_error::OwnerAttachment;
use burrow_types::IndexId;

use crate::result::{LockResult, LockType, LockUpgradeRule};

/// Default number of shards (power of two).
pub const DEFAULT_LOCK_TABLE_SHARDS: usize = 64;

/// Nanosecond lock timeout; negative means infinite, zero fails fast.
pub type NanosTimeout = i64;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle to a registered scope (a transaction or ad-hoc locker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u32);

impl ScopeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a lock record: shard index in the high half, arena slot in the
/// low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(u64);

impl LockId {
    #[inline]
    fn new(shard: usize, slot: u32) -> Self {
        Self(((shard as u64) << 32) | u64::from(slot))
    }

    #[inline]
    fn shard(self) -> usize {
        (self.0 >> 32) as usize
    }

    #[inline]
    fn slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Sentinel for "not waiting on any lock".
const WAITING_NONE: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Scope registry
// ---------------------------------------------------------------------------

pub(crate) struct ScopeSlot {
    /// Raw [`LockId`] this scope is parked on, or [`WAITING_NONE`].
    waiting_for: AtomicU64,
    /// Opaque owner attachment surfaced on lock timeouts.
    attachment: Mutex<Option<OwnerAttachment>>,
}

impl ScopeSlot {
    fn new() -> Self {
        Self {
            waiting_for: AtomicU64::new(WAITING_NONE),
            attachment: Mutex::new(None),
        }
    }
}

struct ScopeArena {
    slots: Vec<Option<Arc<ScopeSlot>>>,
    free: Vec<u32>,
}

impl ScopeArena {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self) -> ScopeId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(Arc::new(ScopeSlot::new()));
            return ScopeId(idx);
        }
        let idx = u32::try_from(self.slots.len()).expect("scope arena index overflow");
        self.slots.push(Some(Arc::new(ScopeSlot::new())));
        ScopeId(idx)
    }

    fn remove(&mut self, id: ScopeId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }

    fn get(&self, id: ScopeId) -> Option<Arc<ScopeSlot>> {
        self.slots.get(id.index())?.clone()
    }
}

// ---------------------------------------------------------------------------
// Wait nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitStatus {
    Waiting,
    Granted(LockResult),
    Abandoned,
    Interrupted,
}

struct WaitNode {
    state: Mutex<WaitStatus>,
    cond: Condvar,
}

impl WaitNode {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaitStatus::Waiting),
            cond: Condvar::new(),
        })
    }

    /// Mark granted and wake the waiter. Caller holds the shard latch.
    fn grant(&self, result: LockResult) {
        let mut state = self.state.lock();
        if *state == WaitStatus::Waiting {
            *state = WaitStatus::Granted(result);
            self.cond.notify_one();
        }
    }

    /// Mark interrupted and wake the waiter. Caller holds the shard latch.
    fn interrupt(&self) {
        let mut state = self.state.lock();
        if *state == WaitStatus::Waiting {
            *state = WaitStatus::Interrupted;
            self.cond.notify_one();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    /// Blocked shared requester (queue_sx).
    Shared,
    /// Requester of the owner slot (queue_u).
    Upgradable,
    /// Owner waiting for the shared set to drain (head of queue_sx).
    UpgradeToExclusive,
}

struct Waiter {
    scope: ScopeId,
    kind: WaitKind,
    /// Result delivered on grant (`Acquired` for fresh requests, `Upgraded`
    /// when the requester upgraded an existing hold).
    grant_result: LockResult,
    node: Arc<WaitNode>,
}

// ---------------------------------------------------------------------------
// Lock record
// ---------------------------------------------------------------------------

/// Shared-owner sets start inline and spill to a hash table.
const SHARED_SPILL: usize = 8;

enum SharedOwners {
    Few(SmallVec<[ScopeId; SHARED_SPILL]>),
    Many(HashSet<ScopeId>),
}

impl SharedOwners {
    fn new() -> Self {
        Self::Few(SmallVec::new())
    }

    fn contains(&self, scope: ScopeId) -> bool {
        match self {
            Self::Few(v) => v.contains(&scope),
            Self::Many(s) => s.contains(&scope),
        }
    }

    fn insert(&mut self, scope: ScopeId) {
        match self {
            Self::Few(v) => {
                if v.contains(&scope) {
                    return;
                }
                if v.len() < SHARED_SPILL {
                    v.push(scope);
                    return;
                }
                let mut set: HashSet<ScopeId> = v.iter().copied().collect();
                set.insert(scope);
                *self = Self::Many(set);
            }
            Self::Many(s) => {
                s.insert(scope);
            }
        }
    }

    fn remove(&mut self, scope: ScopeId) -> bool {
        match self {
            Self::Few(v) => match v.iter().position(|s| *s == scope) {
                Some(pos) => {
                    v.swap_remove(pos);
                    true
                }
                None => false,
            },
            Self::Many(s) => s.remove(&scope),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Few(v) => v.len(),
            Self::Many(s) => s.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_vec(&self) -> Vec<ScopeId> {
        match self {
            Self::Few(v) => v.to_vec(),
            Self::Many(s) => s.iter().copied().collect(),
        }
    }
}

struct Lock {
    index_id: IndexId,
    key: Option<Arc<[u8]>>,
    owner: Option<ScopeId>,
    /// Whether `owner` holds exclusive (vs upgradable).
    exclusive: bool,
    shared: SharedOwners,
    queue_u: VecDeque<Waiter>,
    queue_sx: VecDeque<Waiter>,
}

impl Lock {
    fn new(index_id: IndexId, key: Arc<[u8]>) -> Self {
        Self {
            index_id,
            key: Some(key),
            owner: None,
            exclusive: false,
            shared: SharedOwners::new(),
            queue_u: VecDeque::new(),
            queue_sx: VecDeque::new(),
        }
    }

    fn exclusive_held(&self) -> bool {
        self.owner.is_some() && self.exclusive
    }

    fn is_unused(&self) -> bool {
        self.owner.is_none()
            && self.shared.is_empty()
            && self.queue_u.is_empty()
            && self.queue_sx.is_empty()
    }

    /// Grant as many queued waiters as compatibility allows, FIFO.
    fn serve_waiters(&mut self) {
        loop {
            let Some(head) = self.queue_sx.front() else {
                break;
            };
            match head.kind {
                WaitKind::UpgradeToExclusive => {
                    if self.shared.is_empty()
                        && !self.exclusive
                        && self.owner == Some(head.scope)
                    {
                        let w = self.queue_sx.pop_front().expect("head exists");
                        self.exclusive = true;
                        w.node.grant(w.grant_result);
                    }
                    break;
                }
                WaitKind::Shared => {
                    if self.exclusive_held() {
                        break;
                    }
                    let w = self.queue_sx.pop_front().expect("head exists");
                    self.shared.insert(w.scope);
                    w.node.grant(w.grant_result);
                }
                WaitKind::Upgradable => unreachable!("upgradable waiters live in queue_u"),
            }
        }

        if self.owner.is_none() {
            if let Some(w) = self.queue_u.pop_front() {
                self.shared.remove(w.scope);
                self.owner = Some(w.scope);
                self.exclusive = false;
                w.node.grant(w.grant_result);
            }
        }
    }

    fn remove_waiter(&mut self, node: &Arc<WaitNode>) {
        self.queue_u.retain(|w| !Arc::ptr_eq(&w.node, node));
        self.queue_sx.retain(|w| !Arc::ptr_eq(&w.node, node));
    }
}

// ---------------------------------------------------------------------------
// Shards
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Hash)]
struct ResourceKey {
    index_id: IndexId,
    key: Arc<[u8]>,
}

struct LockArena {
    slots: Vec<Option<Lock>>,
    free: Vec<u32>,
}

impl LockArena {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, lock: Lock) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(lock);
            return idx;
        }
        let idx = u32::try_from(self.slots.len()).expect("lock arena index overflow");
        self.slots.push(Some(lock));
        idx
    }

    fn get(&self, slot: u32) -> Option<&Lock> {
        self.slots.get(slot as usize)?.as_ref()
    }

    fn get_mut(&mut self, slot: u32) -> Option<&mut Lock> {
        self.slots.get_mut(slot as usize)?.as_mut()
    }

    fn remove(&mut self, slot: u32) -> Option<Lock> {
        let lock = self.slots.get_mut(slot as usize)?.take();
        if lock.is_some() {
            self.free.push(slot);
        }
        lock
    }
}

struct ShardState {
    map: HashMap<ResourceKey, u32>,
    locks: LockArena,
}

impl ShardState {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            locks: LockArena::new(),
        }
    }

    /// Find the lock for a resource, creating it if absent.
    fn find_or_create(&mut self, index_id: IndexId, key: &[u8]) -> (u32, bool) {
        let probe = ResourceKey {
            index_id,
            key: Arc::from(key),
        };
        if let Some(&slot) = self.map.get(&probe) {
            return (slot, false);
        }
        let slot = self.locks.insert(Lock::new(index_id, probe.key.clone()));
        self.map.insert(probe, slot);
        (slot, true)
    }

    fn find(&self, index_id: IndexId, key: &[u8]) -> Option<u32> {
        let probe = ResourceKey {
            index_id,
            key: Arc::from(key),
        };
        self.map.get(&probe).copied()
    }

    /// Recycle the lock if nothing owns or waits on it.
    fn recycle_if_unused(&mut self, slot: u32) {
        let unused = match self.locks.get(slot) {
            Some(lock) => lock.is_unused(),
            None => false,
        };
        if unused {
            if let Some(lock) = self.locks.remove(slot) {
                if let Some(key) = lock.key {
                    self.map.remove(&ResourceKey {
                        index_id: lock.index_id,
                        key,
                    });
                }
            }
        }
    }
}

struct Shard {
    state: Mutex<ShardState>,
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// FNV-1a digest of the key, folded with the index id.
#[must_use]
pub fn hash_resource(index_id: IndexId, key: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in key {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h ^= index_id.get();
    h.wrapping_mul(FNV_PRIME)
}

// ---------------------------------------------------------------------------
// Snapshots (for the deadlock detector)
// ---------------------------------------------------------------------------

/// Latch-bounded snapshot of a lock's ownership, read by the detector.
pub(crate) struct LockSnapshot {
    pub(crate) index_id: IndexId,
    pub(crate) key: Option<Arc<[u8]>>,
    pub(crate) owner: Option<ScopeId>,
    pub(crate) shared: Vec<ScopeId>,
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

enum WaitOutcome {
    Granted(LockResult),
    TimedOut,
    Interrupted,
}

/// The sharded lock manager.
pub struct LockManager {
    shards: Box<[Shard]>,
    shard_mask: u64,
    scopes: RwLock<ScopeArena>,
    upgrade_rule: LockUpgradeRule,
}

impl LockManager {
    /// Create a manager with `num_shards` shards (power of two) and the
    /// given upgrade rule.
    ///
    /// # Panics
    ///
    /// Panics if `num_shards` is zero or not a power of two.
    #[must_use]
    pub fn new(num_shards: usize, upgrade_rule: LockUpgradeRule) -> Arc<Self> {
        assert!(
            num_shards > 0 && num_shards.is_power_of_two(),
            "shard count must be a power of two"
        );
        let shards = (0..num_shards)
            .map(|_| Shard {
                state: Mutex::new(ShardState::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            shards,
            shard_mask: (num_shards as u64) - 1,
            scopes: RwLock::new(ScopeArena::new()),
            upgrade_rule,
        })
    }

    /// Create a manager with the default shard count and strict upgrades.
    #[must_use]
    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_LOCK_TABLE_SHARDS, LockUpgradeRule::default())
    }

    /// The configured upgrade rule.
    #[must_use]
    pub fn upgrade_rule(&self) -> LockUpgradeRule {
        self.upgrade_rule
    }

    #[inline]
    fn shard_for(&self, hash: u64) -> &Shard {
        &self.shards[(hash & self.shard_mask) as usize]
    }

    #[inline]
    fn shard_index(&self, hash: u64) -> usize {
        (hash & self.shard_mask) as usize
    }

    // -- Scope registry --------------------------------------------------

    pub(crate) fn register_scope(&self) -> ScopeId {
        self.scopes.write().insert()
    }

    pub(crate) fn unregister_scope(&self, scope: ScopeId) {
        self.scopes.write().remove(scope);
    }

    pub(crate) fn scope_slot(&self, scope: ScopeId) -> Option<Arc<ScopeSlot>> {
        self.scopes.read().get(scope)
    }

    /// Attach an opaque object to a scope, surfaced to blocked requesters.
    pub fn attach(&self, scope: ScopeId, attachment: Option<OwnerAttachment>) {
        if let Some(slot) = self.scope_slot(scope) {
            *slot.attachment.lock() = attachment;
        }
    }

    /// Read a scope's attachment.
    #[must_use]
    pub fn attachment(&self, scope: ScopeId) -> Option<OwnerAttachment> {
        self.scope_slot(scope)?.attachment.lock().clone()
    }

    pub(crate) fn scope_waiting_for(&self, scope: ScopeId) -> Option<LockId> {
        let slot = self.scope_slot(scope)?;
        match slot.waiting_for.load(Ordering::Acquire) {
            WAITING_NONE => None,
            raw => Some(LockId::from_raw(raw)),
        }
    }

    fn set_waiting(&self, scope: ScopeId, lock: LockId) {
        if let Some(slot) = self.scope_slot(scope) {
            slot.waiting_for.store(lock.raw(), Ordering::Release);
        }
    }

    pub(crate) fn clear_waiting(&self, scope: ScopeId) {
        if let Some(slot) = self.scope_slot(scope) {
            slot.waiting_for.store(WAITING_NONE, Ordering::Release);
        }
    }

    // -- Acquisition -----------------------------------------------------

    fn deadline_for(timeout: NanosTimeout) -> Option<Instant> {
        if timeout < 0 {
            None
        } else {
            Instant::now().checked_add(Duration::from_nanos(timeout.unsigned_abs()))
        }
    }

    fn can_attempt_upgrade(&self, shared_count: usize) -> bool {
        match self.upgrade_rule {
            LockUpgradeRule::Strict => false,
            LockUpgradeRule::Lenient => shared_count == 1,
            LockUpgradeRule::Unchecked => true,
        }
    }

    /// Attempt to acquire `ty` on `(index_id, key)` for `scope`.
    ///
    /// Returns the result plus the lock handle when a new hold or upgrade
    /// was recorded (the caller pushes it onto the scope's lock stack).
    pub(crate) fn try_lock(
        &self,
        ty: LockType,
        scope: ScopeId,
        index_id: IndexId,
        key: &[u8],
        timeout: NanosTimeout,
    ) -> (LockResult, Option<LockId>) {
        let hash = hash_resource(index_id, key);
        match ty {
            LockType::Shared => self.lock_shared_inner(scope, index_id, key, hash, timeout),
            LockType::Upgradable => self.lock_upgradable_inner(scope, index_id, key, hash, timeout),
            LockType::Exclusive => self.lock_exclusive_inner(scope, index_id, key, hash, timeout),
        }
    }

    fn lock_shared_inner(
        &self,
        scope: ScopeId,
        index_id: IndexId,
        key: &[u8],
        hash: u64,
        timeout: NanosTimeout,
    ) -> (LockResult, Option<LockId>) {
        let deadline = Self::deadline_for(timeout);
        let shard_idx = self.shard_index(hash);
        let shard = &self.shards[shard_idx];

        let node;
        let lock_id;
        {
            let mut st = shard.state.lock();
            let (slot, created) = st.find_or_create(index_id, key);
            lock_id = LockId::new(shard_idx, slot);
            let lock = st.locks.get_mut(slot).expect("slot just resolved");

            if lock.owner == Some(scope) {
                return (
                    if lock.exclusive {
                        LockResult::OwnedExclusive
                    } else {
                        LockResult::OwnedUpgradable
                    },
                    None,
                );
            }
            if lock.shared.contains(scope) {
                return (LockResult::OwnedShared, None);
            }

            let blocked = lock.exclusive_held() || !lock.queue_sx.is_empty();
            if !blocked {
                lock.shared.insert(scope);
                return (LockResult::Acquired, Some(lock_id));
            }

            if timeout == 0 {
                if created {
                    st.recycle_if_unused(slot);
                }
                return (LockResult::TimedOutLock, None);
            }

            node = WaitNode::new();
            lock.queue_sx.push_back(Waiter {
                scope,
                kind: WaitKind::Shared,
                grant_result: LockResult::Acquired,
                node: node.clone(),
            });
            self.set_waiting(scope, lock_id);
            debug!(index_id = %index_id, ?scope, "shared lock contended; waiting");
        }

        match self.wait(&node, deadline, lock_id) {
            WaitOutcome::Granted(result) => {
                self.clear_waiting(scope);
                (result, Some(lock_id))
            }
            WaitOutcome::TimedOut => (LockResult::TimedOutLock, None),
            WaitOutcome::Interrupted => {
                self.clear_waiting(scope);
                (LockResult::Interrupted, None)
            }
        }
    }

    fn lock_upgradable_inner(
        &self,
        scope: ScopeId,
        index_id: IndexId,
        key: &[u8],
        hash: u64,
        timeout: NanosTimeout,
    ) -> (LockResult, Option<LockId>) {
        let deadline = Self::deadline_for(timeout);
        let shard_idx = self.shard_index(hash);
        let shard = &self.shards[shard_idx];

        let node;
        let lock_id;
        {
            let mut st = shard.state.lock();
            let (slot, created) = st.find_or_create(index_id, key);
            lock_id = LockId::new(shard_idx, slot);
            let lock = st.locks.get_mut(slot).expect("slot just resolved");

            if lock.owner == Some(scope) {
                return (
                    if lock.exclusive {
                        LockResult::OwnedExclusive
                    } else {
                        LockResult::OwnedUpgradable
                    },
                    None,
                );
            }

            let holds_shared = lock.shared.contains(scope);
            if holds_shared && !self.can_attempt_upgrade(lock.shared.len()) {
                return (LockResult::Illegal, None);
            }

            let blocked = lock.owner.is_some() || !lock.queue_u.is_empty();
            if !blocked {
                lock.shared.remove(scope);
                lock.owner = Some(scope);
                lock.exclusive = false;
                return (LockResult::Acquired, Some(lock_id));
            }

            if timeout == 0 {
                if created {
                    st.recycle_if_unused(slot);
                }
                return (LockResult::TimedOutLock, None);
            }

            node = WaitNode::new();
            lock.queue_u.push_back(Waiter {
                scope,
                kind: WaitKind::Upgradable,
                grant_result: LockResult::Acquired,
                node: node.clone(),
            });
            self.set_waiting(scope, lock_id);
            debug!(index_id = %index_id, ?scope, "upgradable lock contended; waiting");
        }

        match self.wait(&node, deadline, lock_id) {
            WaitOutcome::Granted(result) => {
                self.clear_waiting(scope);
                (result, Some(lock_id))
            }
            WaitOutcome::TimedOut => (LockResult::TimedOutLock, None),
            WaitOutcome::Interrupted => {
                self.clear_waiting(scope);
                (LockResult::Interrupted, None)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn lock_exclusive_inner(
        &self,
        scope: ScopeId,
        index_id: IndexId,
        key: &[u8],
        hash: u64,
        timeout: NanosTimeout,
    ) -> (LockResult, Option<LockId>) {
        let deadline = Self::deadline_for(timeout);
        let shard_idx = self.shard_index(hash);
        let shard = &self.shards[shard_idx];

        // Phase 1: take the owner slot (upgradable strength).
        let mut via_upgrade = false;
        let mut came_from_shared = false;
        let mut acquired_owner_here = false;
        let lock_id;

        let mut st = shard.state.lock();
        {
            let (slot, created) = st.find_or_create(index_id, key);
            lock_id = LockId::new(shard_idx, slot);
            let lock = st.locks.get_mut(slot).expect("slot just resolved");

            if lock.owner == Some(scope) {
                if lock.exclusive {
                    return (LockResult::OwnedExclusive, None);
                }
                via_upgrade = true;
            } else {
                let holds_shared = lock.shared.contains(scope);
                if holds_shared {
                    if !self.can_attempt_upgrade(lock.shared.len()) {
                        return (LockResult::Illegal, None);
                    }
                    via_upgrade = true;
                    came_from_shared = true;
                }

                let blocked = lock.owner.is_some() || !lock.queue_u.is_empty();
                if !blocked {
                    lock.shared.remove(scope);
                    lock.owner = Some(scope);
                    lock.exclusive = false;
                    acquired_owner_here = true;
                } else {
                    if timeout == 0 {
                        if created {
                            st.recycle_if_unused(slot);
                        }
                        return (LockResult::TimedOutLock, None);
                    }
                    let node = WaitNode::new();
                    lock.queue_u.push_back(Waiter {
                        scope,
                        kind: WaitKind::Upgradable,
                        grant_result: LockResult::Acquired,
                        node: node.clone(),
                    });
                    self.set_waiting(scope, lock_id);
                    debug!(index_id = %index_id, ?scope, "exclusive lock contended; waiting for owner slot");
                    drop(st);

                    match self.wait(&node, deadline, lock_id) {
                        WaitOutcome::Granted(_) => {
                            self.clear_waiting(scope);
                            acquired_owner_here = true;
                        }
                        WaitOutcome::TimedOut => return (LockResult::TimedOutLock, None),
                        WaitOutcome::Interrupted => {
                            self.clear_waiting(scope);
                            return (LockResult::Interrupted, None);
                        }
                    }
                    st = shard.state.lock();
                }
            }
        }

        // Phase 2: owner slot held (upgradable); wait for shared to drain.
        let slot = lock_id.slot();
        let lock = st.locks.get_mut(slot).expect("owned lock cannot be recycled");
        debug_assert_eq!(lock.owner, Some(scope));

        if lock.shared.is_empty() {
            lock.exclusive = true;
            let result = if via_upgrade {
                LockResult::Upgraded
            } else {
                LockResult::Acquired
            };
            return (result, Some(lock_id));
        }

        let rollback = |st: &mut ShardState| {
            // Give back the owner slot taken in phase 1 so a timed-out
            // request leaves the prior hold unchanged.
            if let Some(lock) = st.locks.get_mut(slot) {
                lock.owner = None;
                lock.exclusive = false;
                if came_from_shared {
                    lock.shared.insert(scope);
                }
                lock.serve_waiters();
            }
            st.recycle_if_unused(slot);
        };

        if timeout == 0 {
            if acquired_owner_here {
                rollback(&mut st);
            }
            return (LockResult::TimedOutLock, None);
        }

        let node = WaitNode::new();
        let grant_result = if via_upgrade {
            LockResult::Upgraded
        } else {
            LockResult::Acquired
        };
        lock.queue_sx.push_front(Waiter {
            scope,
            kind: WaitKind::UpgradeToExclusive,
            grant_result,
            node: node.clone(),
        });
        self.set_waiting(scope, lock_id);
        debug!(index_id = %index_id, ?scope, "exclusive lock waiting for shared holders to drain");
        drop(st);

        match self.wait(&node, deadline, lock_id) {
            WaitOutcome::Granted(result) => {
                self.clear_waiting(scope);
                (result, Some(lock_id))
            }
            WaitOutcome::TimedOut => {
                if acquired_owner_here {
                    let mut st = shard.state.lock();
                    rollback(&mut st);
                }
                (LockResult::TimedOutLock, None)
            }
            WaitOutcome::Interrupted => {
                self.clear_waiting(scope);
                if acquired_owner_here {
                    let mut st = shard.state.lock();
                    rollback(&mut st);
                }
                (LockResult::Interrupted, None)
            }
        }
    }

    /// Block on a wait node until granted, interrupted, or past `deadline`.
    fn wait(&self, node: &Arc<WaitNode>, deadline: Option<Instant>, lock_id: LockId) -> WaitOutcome {
        {
            let mut state = node.state.lock();
            loop {
                match *state {
                    WaitStatus::Granted(result) => return WaitOutcome::Granted(result),
                    WaitStatus::Interrupted => return WaitOutcome::Interrupted,
                    WaitStatus::Abandoned => unreachable!("abandoned only by this thread"),
                    WaitStatus::Waiting => {}
                }
                match deadline {
                    None => node.cond.wait(&mut state),
                    Some(d) => {
                        if node.cond.wait_until(&mut state, d).timed_out() {
                            break;
                        }
                    }
                }
            }
        }

        // Timed out while apparently still waiting. Re-sync with the shard:
        // a grant may have raced the timeout, in which case the hold is
        // accepted rather than abandoned.
        let shard = &self.shards[lock_id.shard()];
        let mut st = shard.state.lock();
        let mut state = node.state.lock();
        match *state {
            WaitStatus::Granted(result) => WaitOutcome::Granted(result),
            WaitStatus::Interrupted => WaitOutcome::Interrupted,
            WaitStatus::Waiting => {
                *state = WaitStatus::Abandoned;
                drop(state);
                if let Some(lock) = st.locks.get_mut(lock_id.slot()) {
                    lock.remove_waiter(node);
                }
                st.recycle_if_unused(lock_id.slot());
                WaitOutcome::TimedOut
            }
            WaitStatus::Abandoned => unreachable!("abandoned only by this thread"),
        }
    }

    // -- Release and downgrade -------------------------------------------

    /// Fully release whatever `scope` holds on `lock_id`.
    pub(crate) fn unlock(&self, scope: ScopeId, lock_id: LockId) -> Result<(), &'static str> {
        let shard = &self.shards[lock_id.shard()];
        let mut st = shard.state.lock();
        let Some(lock) = st.locks.get_mut(lock_id.slot()) else {
            return Err("lock not held");
        };

        if lock.owner == Some(scope) {
            lock.owner = None;
            lock.exclusive = false;
            lock.serve_waiters();
        } else if lock.shared.remove(scope) {
            if lock.shared.is_empty() {
                lock.serve_waiters();
            }
        } else {
            return Err("lock not held");
        }
        st.recycle_if_unused(lock_id.slot());
        Ok(())
    }

    /// Downgrade to shared, releasing the stronger portion.
    pub(crate) fn unlock_to_shared(
        &self,
        scope: ScopeId,
        lock_id: LockId,
    ) -> Result<(), &'static str> {
        let shard = &self.shards[lock_id.shard()];
        let mut st = shard.state.lock();
        let Some(lock) = st.locks.get_mut(lock_id.slot()) else {
            return Err("lock not held");
        };

        if lock.owner == Some(scope) {
            lock.owner = None;
            lock.exclusive = false;
            lock.shared.insert(scope);
            lock.serve_waiters();
            Ok(())
        } else if lock.shared.contains(scope) {
            // Already only shared.
            Ok(())
        } else {
            Err("lock not held")
        }
    }

    /// Downgrade exclusive to upgradable.
    pub(crate) fn unlock_to_upgradable(
        &self,
        scope: ScopeId,
        lock_id: LockId,
    ) -> Result<(), &'static str> {
        let shard = &self.shards[lock_id.shard()];
        let mut st = shard.state.lock();
        let Some(lock) = st.locks.get_mut(lock_id.slot()) else {
            return Err("lock not held upgradable");
        };

        if lock.owner == Some(scope) {
            if lock.exclusive {
                lock.exclusive = false;
                lock.serve_waiters();
            }
            Ok(())
        } else {
            Err("lock not held upgradable")
        }
    }

    /// Move an exclusive hold from `scope` to `pending_scope`; any weaker
    /// hold is simply released. Returns whether a transfer happened.
    pub(crate) fn transfer_exclusive(
        &self,
        scope: ScopeId,
        lock_id: LockId,
        pending_scope: ScopeId,
    ) -> bool {
        let shard = &self.shards[lock_id.shard()];
        let mut st = shard.state.lock();
        let Some(lock) = st.locks.get_mut(lock_id.slot()) else {
            return false;
        };

        if lock.owner == Some(scope) && lock.exclusive {
            lock.owner = Some(pending_scope);
            return true;
        }

        if lock.owner == Some(scope) {
            lock.owner = None;
            lock.exclusive = false;
            lock.serve_waiters();
        } else if lock.shared.remove(scope) && lock.shared.is_empty() {
            lock.serve_waiters();
        }
        st.recycle_if_unused(lock_id.slot());
        false
    }

    // -- Queries ---------------------------------------------------------

    /// Check `scope`'s ownership of `(index_id, key)`.
    #[must_use]
    pub fn check(&self, scope: ScopeId, index_id: IndexId, key: &[u8]) -> LockResult {
        let hash = hash_resource(index_id, key);
        let shard = self.shard_for(hash);
        let st = shard.state.lock();
        let Some(slot) = st.find(index_id, key) else {
            return LockResult::Unowned;
        };
        let Some(lock) = st.locks.get(slot) else {
            return LockResult::Unowned;
        };
        if lock.owner == Some(scope) {
            if lock.exclusive {
                LockResult::OwnedExclusive
            } else {
                LockResult::OwnedUpgradable
            }
        } else if lock.shared.contains(scope) {
            LockResult::OwnedShared
        } else {
            LockResult::Unowned
        }
    }

    /// Resource identity of a lock handle.
    pub(crate) fn lock_info(&self, lock_id: LockId) -> Option<(IndexId, Option<Arc<[u8]>>)> {
        let shard = &self.shards[lock_id.shard()];
        let st = shard.state.lock();
        let lock = st.locks.get(lock_id.slot())?;
        Some((lock.index_id, lock.key.clone()))
    }

    pub(crate) fn lock_snapshot(&self, lock_id: LockId) -> Option<LockSnapshot> {
        let shard = &self.shards[lock_id.shard()];
        let st = shard.state.lock();
        let lock = st.locks.get(lock_id.slot())?;
        Some(LockSnapshot {
            index_id: lock.index_id,
            key: lock.key.clone(),
            owner: lock.owner,
            shared: lock.shared.to_vec(),
        })
    }

    /// Attachment of whoever is blocking `scope` on `lock_id`, if known.
    pub(crate) fn find_owner_attachment(&self, lock_id: LockId) -> Option<OwnerAttachment> {
        let snapshot = self.lock_snapshot(lock_id)?;
        if let Some(owner) = snapshot.owner {
            if let Some(att) = self.attachment(owner) {
                return Some(att);
            }
        }
        snapshot.shared.iter().find_map(|s| self.attachment(*s))
    }

    /// Wake `scope` out of a pending lock wait with `Interrupted`.
    pub fn interrupt(&self, scope: ScopeId) {
        let Some(lock_id) = self.scope_waiting_for(scope) else {
            return;
        };
        let shard = &self.shards[lock_id.shard()];
        let mut st = shard.state.lock();
        if let Some(lock) = st.locks.get_mut(lock_id.slot()) {
            let mut node = None;
            for w in lock.queue_u.iter().chain(lock.queue_sx.iter()) {
                if w.scope == scope {
                    node = Some(w.node.clone());
                    break;
                }
            }
            if let Some(node) = node {
                lock.remove_waiter(&node);
                node.interrupt();
            }
            st.recycle_if_unused(lock_id.slot());
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("shards", &self.shards.len())
            .field("upgrade_rule", &self.upgrade_rule)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<LockManager> {
        LockManager::new(16, LockUpgradeRule::Strict)
    }

    const IX: IndexId = IndexId::new(1);

    #[test]
    fn shared_then_exclusive_conflict() {
        let mgr = manager();
        let a = mgr.register_scope();
        let b = mgr.register_scope();

        let (r, id) = mgr.try_lock(LockType::Shared, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let id = id.unwrap();

        let (r, _) = mgr.try_lock(LockType::Exclusive, b, IX, b"k", 0);
        assert_eq!(r, LockResult::TimedOutLock);

        mgr.unlock(a, id).unwrap();

        let (r, id2) = mgr.try_lock(LockType::Exclusive, b, IX, b"k", 0);
        assert_eq!(r, LockResult::Acquired);
        mgr.unlock(b, id2.unwrap()).unwrap();
    }

    #[test]
    fn owned_results_are_idempotent() {
        let mgr = manager();
        let a = mgr.register_scope();

        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, id) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::OwnedExclusive);
        assert!(id.is_none());
        let (r, _) = mgr.try_lock(LockType::Shared, a, IX, b"k", -1);
        assert_eq!(r, LockResult::OwnedExclusive);
    }

    #[test]
    fn upgradable_then_upgrade() {
        let mgr = manager();
        let a = mgr.register_scope();

        let (r, _) = mgr.try_lock(LockType::Upgradable, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Upgraded);
        assert_eq!(mgr.check(a, IX, b"k"), LockResult::OwnedExclusive);
    }

    #[test]
    fn shared_holder_cannot_upgrade_under_strict() {
        let mgr = manager();
        let a = mgr.register_scope();

        let (r, _) = mgr.try_lock(LockType::Shared, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Illegal);
        let (r, _) = mgr.try_lock(LockType::Upgradable, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Illegal);
    }

    #[test]
    fn lenient_allows_sole_shared_holder_upgrade() {
        let mgr = LockManager::new(16, LockUpgradeRule::Lenient);
        let a = mgr.register_scope();
        let b = mgr.register_scope();

        let (r, _) = mgr.try_lock(LockType::Shared, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Upgraded);

        // A second shared holder makes the upgrade illegal again.
        let (r, id) = mgr.try_lock(LockType::Shared, b, IX, b"q", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, _) = mgr.try_lock(LockType::Shared, a, IX, b"q", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"q", 0);
        assert_eq!(r, LockResult::Illegal);
        mgr.unlock(b, id.unwrap()).unwrap();
    }

    #[test]
    fn only_one_upgradable_holder() {
        let mgr = manager();
        let a = mgr.register_scope();
        let b = mgr.register_scope();

        let (r, _) = mgr.try_lock(LockType::Upgradable, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, _) = mgr.try_lock(LockType::Upgradable, b, IX, b"k", 0);
        assert_eq!(r, LockResult::TimedOutLock);

        // Shared is still compatible with an upgradable holder.
        let (r, _) = mgr.try_lock(LockType::Shared, b, IX, b"k", 0);
        assert_eq!(r, LockResult::Acquired);
    }

    #[test]
    fn downgrades() {
        let mgr = manager();
        let a = mgr.register_scope();

        let (r, id) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let id = id.unwrap();

        mgr.unlock_to_upgradable(a, id).unwrap();
        assert_eq!(mgr.check(a, IX, b"k"), LockResult::OwnedUpgradable);

        mgr.unlock_to_shared(a, id).unwrap();
        assert_eq!(mgr.check(a, IX, b"k"), LockResult::OwnedShared);

        mgr.unlock(a, id).unwrap();
        assert_eq!(mgr.check(a, IX, b"k"), LockResult::Unowned);
    }

    #[test]
    fn blocked_waiter_is_granted_on_release() {
        let mgr = manager();
        let a = mgr.register_scope();
        let b = mgr.register_scope();

        let (r, id) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let id = id.unwrap();

        let mgr2 = Arc::clone(&mgr);
        let handle = std::thread::spawn(move || {
            let (r, _) = mgr2.try_lock(LockType::Exclusive, b, IX, b"k", 5_000_000_000);
            r
        });

        // Give the waiter time to park, then release.
        std::thread::sleep(Duration::from_millis(50));
        mgr.unlock(a, id).unwrap();
        assert_eq!(handle.join().unwrap(), LockResult::Acquired);
    }

    #[test]
    fn shared_drain_grants_waiting_upgrade() {
        let mgr = manager();
        let a = mgr.register_scope();
        let b = mgr.register_scope();

        let (r, _) = mgr.try_lock(LockType::Upgradable, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let (r, shared_id) = mgr.try_lock(LockType::Shared, b, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);

        let mgr2 = Arc::clone(&mgr);
        let handle = std::thread::spawn(move || {
            let (r, _) = mgr2.try_lock(LockType::Exclusive, a, IX, b"k", 5_000_000_000);
            r
        });

        std::thread::sleep(Duration::from_millis(50));
        mgr.unlock(b, shared_id.unwrap()).unwrap();
        assert_eq!(handle.join().unwrap(), LockResult::Upgraded);
        assert_eq!(mgr.check(a, IX, b"k"), LockResult::OwnedExclusive);
    }

    #[test]
    fn interrupt_wakes_waiter() {
        let mgr = manager();
        let a = mgr.register_scope();
        let b = mgr.register_scope();

        let (r, _) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);

        let mgr2 = Arc::clone(&mgr);
        let handle = std::thread::spawn(move || {
            let (r, _) = mgr2.try_lock(LockType::Exclusive, b, IX, b"k", -1);
            r
        });

        std::thread::sleep(Duration::from_millis(50));
        mgr.interrupt(b);
        assert_eq!(handle.join().unwrap(), LockResult::Interrupted);
    }

    #[test]
    fn recycled_when_unused() {
        let mgr = manager();
        let a = mgr.register_scope();

        let (r, id) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let id = id.unwrap();
        mgr.unlock(a, id).unwrap();

        // The record was recycled; the handle no longer resolves.
        assert!(mgr.lock_info(id).is_none());
    }

    #[test]
    fn fifo_fairness_for_shared_behind_waiter() {
        let mgr = manager();
        let a = mgr.register_scope();
        let b = mgr.register_scope();
        let c = mgr.register_scope();

        let (r, id) = mgr.try_lock(LockType::Exclusive, a, IX, b"k", -1);
        assert_eq!(r, LockResult::Acquired);
        let id = id.unwrap();

        let mgr2 = Arc::clone(&mgr);
        let waiter = std::thread::spawn(move || {
            let (r, _) = mgr2.try_lock(LockType::Shared, b, IX, b"k", 5_000_000_000);
            r
        });
        std::thread::sleep(Duration::from_millis(50));

        // A newly arriving shared request queues behind the parked one.
        let (r, _) = mgr.try_lock(LockType::Shared, c, IX, b"k", 0);
        assert_eq!(r, LockResult::TimedOutLock);

        mgr.unlock(a, id).unwrap();
        assert_eq!(waiter.join().unwrap(), LockResult::Acquired);
    }
}
