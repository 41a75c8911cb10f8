//! Indexes and the transactional mutation path.
//!
//! Every mutation funnels through [`mutate`]: resolve the transaction
//! (minting an auto-commit one when none is given), acquire the exclusive
//! lock, evaluate no-op rules, fire the trigger chain, couple fragmented
//! old values to the trash, then write.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use burrow_error::{BurrowError, Result};
use burrow_types::{IndexId, ValueRef, ValueState};

use crate::cursor::Cursor;
use crate::db::DbInner;
use crate::redo::RedoRecord;
use crate::store::{OrderedStore, ValueRepr};
use crate::trigger::{Trigger, TriggerHandle, TriggerList};
use crate::txn::Transaction;
use crate::undo::UndoRecord;
use crate::view::{Transformer, View};

pub(crate) struct IndexCore {
    pub(crate) id: IndexId,
    pub(crate) name: Option<String>,
    pub(crate) store: Arc<dyn OrderedStore>,
    pub(crate) triggers: Mutex<TriggerList>,
}

/// A logically named ordered key/value store.
#[derive(Clone)]
pub struct Index {
    pub(crate) core: Arc<IndexCore>,
    pub(crate) db: Arc<DbInner>,
}

impl Index {
    pub(crate) fn new(core: Arc<IndexCore>, db: Arc<DbInner>) -> Self {
        Self { core, db }
    }

    /// The index id.
    #[must_use]
    pub fn id(&self) -> IndexId {
        self.core.id
    }

    /// The index name; temporary indexes are unnamed.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    /// The unbounded view over this index.
    #[must_use]
    pub fn view(&self) -> View {
        View::base(self.clone())
    }

    /// Restrict to keys greater than or equal to `bound`.
    #[must_use]
    pub fn view_ge(&self, bound: &[u8]) -> View {
        self.view().view_ge(bound)
    }

    /// Restrict to keys strictly less than `bound`.
    #[must_use]
    pub fn view_lt(&self, bound: &[u8]) -> View {
        self.view().view_lt(bound)
    }

    /// Restrict to keys with `prefix`, trimming `trim` bytes off the front
    /// of visible keys.
    #[must_use]
    pub fn view_prefix(&self, prefix: &[u8], trim: usize) -> View {
        self.view().view_prefix(prefix, trim)
    }

    /// Reverse iteration order.
    #[must_use]
    pub fn view_reverse(&self) -> View {
        self.view().view_reverse()
    }

    /// Hide values from cursors and observers.
    #[must_use]
    pub fn view_keys(&self) -> View {
        self.view().view_keys()
    }

    /// Transform rows through `transformer`.
    #[must_use]
    pub fn view_transformed(&self, transformer: Arc<dyn Transformer>) -> View {
        self.view().view_transformed(transformer)
    }

    /// Register a pre-mutation observer; fires LIFO.
    pub fn add_trigger(&self, trigger: Arc<dyn Trigger>) -> Result<TriggerHandle> {
        self.view().add_trigger(trigger)
    }

    /// Remove a previously registered observer.
    pub fn remove_trigger(&self, handle: TriggerHandle) -> Result<()> {
        self.view().remove_trigger(handle)
    }

    /// Open a cursor over this index.
    #[must_use]
    pub fn new_cursor(&self, txn: Option<&Transaction>) -> Cursor {
        self.view().new_cursor(txn)
    }

    /// Open a value accessor positioned at `key`, with autoload off.
    pub fn new_accessor(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Cursor> {
        let mut cursor = self.new_cursor(txn);
        cursor.autoload(false);
        cursor.find(key)?;
        Ok(cursor)
    }

    // -- Operations ------------------------------------------------------

    /// Load the value for `key`, acquiring a read lock per the
    /// transaction's lock mode.
    pub fn load(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(txn) = txn {
            txn.read_lock(self.id(), key)?;
        }
        match self.core.store.get(key)? {
            None => Ok(None),
            Some(repr) => resolve_repr(&self.db, &repr).map(Some),
        }
    }

    /// Unconditionally store (or delete, with `None`).
    pub fn store(&self, txn: Option<&Transaction>, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        mutate(
            self,
            txn,
            key,
            value,
            MutateCheck::Always,
            FireMethod::Store,
            None,
        )?;
        Ok(())
    }

    /// Store and return the previous value.
    pub fn exchange(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let outcome = mutate(
            self,
            txn,
            key,
            value,
            MutateCheck::Always,
            FireMethod::Store,
            None,
        )?;
        Ok(outcome.old)
    }

    /// Store only if the key is absent. Returns false when it exists.
    pub fn insert(&self, txn: Option<&Transaction>, key: &[u8], value: &[u8]) -> Result<bool> {
        let outcome = mutate(
            self,
            txn,
            key,
            Some(value),
            MutateCheck::InsertIfAbsent,
            FireMethod::Store,
            None,
        )?;
        Ok(outcome.applied)
    }

    /// Store only if the key exists. Returns false when it is absent.
    pub fn replace(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        let outcome = mutate(
            self,
            txn,
            key,
            value,
            MutateCheck::ReplaceIfPresent,
            FireMethod::Store,
            None,
        )?;
        Ok(outcome.applied)
    }

    /// Store unless the current value is unchanged. Returns false when
    /// nothing changed.
    pub fn update(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        let outcome = mutate(
            self,
            txn,
            key,
            value,
            MutateCheck::UpdateIfChanged,
            FireMethod::Store,
            None,
        )?;
        Ok(outcome.applied)
    }

    /// Store only if the current value equals `old`. Returns false on a
    /// mismatch.
    pub fn update_if(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let outcome = mutate(
            self,
            txn,
            key,
            new,
            MutateCheck::UpdateIfOldMatches(old.map(<[u8]>::to_vec)),
            FireMethod::Store,
            None,
        )?;
        Ok(outcome.applied)
    }

    /// Delete the entry. Returns false when it was absent.
    pub fn delete(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<bool> {
        let outcome = mutate(
            self,
            txn,
            key,
            None,
            MutateCheck::Always,
            FireMethod::Store,
            None,
        )?;
        Ok(outcome.applied)
    }

    /// Number of entries (diagnostics; not transactional).
    pub fn entry_count(&self) -> Result<usize> {
        self.core.store.len()
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Mutation path
// ---------------------------------------------------------------------------

/// Which observer method a mutation dispatches through.
pub(crate) enum FireMethod<'a> {
    Store,
    ValueLength(i64),
    ValueWrite { pos: u64, buf: &'a [u8] },
    ValueClear { pos: u64, len: u64 },
}

/// No-op rules evaluated under the exclusive lock.
pub(crate) enum MutateCheck {
    Always,
    InsertIfAbsent,
    ReplaceIfPresent,
    UpdateIfChanged,
    UpdateIfOldMatches(Option<Vec<u8>>),
}

pub(crate) struct MutateOutcome {
    /// Whether the operation logically succeeded.
    pub(crate) applied: bool,
    /// Previous value bytes, fragments resolved.
    pub(crate) old: Option<Vec<u8>>,
}

pub(crate) fn resolve_repr(db: &Arc<DbInner>, repr: &ValueRepr) -> Result<Vec<u8>> {
    match repr {
        ValueRepr::Inline(bytes) => Ok(bytes.clone()),
        ValueRepr::Fragmented(descriptor) => db
            .fragments
            .load_fragmented(descriptor)?
            .ok_or_else(|| BurrowError::corrupt("dangling fragment descriptor")),
    }
}

fn encode_value(db: &Arc<DbInner>, bytes: &[u8]) -> Result<ValueRepr> {
    if bytes.len() >= db.fragment_threshold {
        let descriptor = db.fragments.insert_fragmented(bytes)?;
        Ok(ValueRepr::Fragmented(descriptor))
    } else {
        Ok(ValueRepr::Inline(bytes.to_vec()))
    }
}

/// The transactional mutation path.
pub(crate) fn mutate(
    index: &Index,
    txn: Option<&Transaction>,
    base_key: &[u8],
    new_value: Option<&[u8]>,
    check: MutateCheck,
    fire: FireMethod<'_>,
    trig_seed: Option<(ValueState, bool)>,
) -> Result<MutateOutcome> {
    let owned;
    let (txn, auto_commit) = match txn {
        Some(txn) => (txn, false),
        None => {
            owned = Transaction::begin(&index.db);
            (&owned, true)
        }
    };

    let result = mutate_in(index, txn, base_key, new_value, check, fire, trig_seed);
    if auto_commit {
        match &result {
            Ok(_) => txn.commit()?,
            Err(_) => {
                let _ = txn.reset();
            }
        }
    }
    result
}

#[allow(clippy::too_many_lines)]
fn mutate_in(
    index: &Index,
    txn: &Transaction,
    base_key: &[u8],
    new_value: Option<&[u8]>,
    check: MutateCheck,
    fire: FireMethod<'_>,
    trig_seed: Option<(ValueState, bool)>,
) -> Result<MutateOutcome> {
    if txn.locks_writes() {
        txn.lock_exclusive(index.id(), base_key)?;
    }

    let old_repr = index.core.store.get(base_key)?;
    let old_bytes = match &old_repr {
        None => None,
        Some(repr) => Some(resolve_repr(&index.db, repr)?),
    };

    let (applied, mut write) = match &check {
        MutateCheck::Always => {
            let changes = !(new_value.is_none() && old_repr.is_none());
            (changes, changes)
        }
        MutateCheck::InsertIfAbsent => {
            let absent = old_repr.is_none();
            (absent, absent)
        }
        MutateCheck::ReplaceIfPresent => {
            let present = old_repr.is_some();
            (present, present)
        }
        MutateCheck::UpdateIfChanged => {
            let changed = old_bytes.as_deref() != new_value;
            (changed, changed)
        }
        MutateCheck::UpdateIfOldMatches(expected) => {
            let matches = old_bytes.as_deref() == expected.as_deref();
            (matches, matches && old_bytes.as_deref() != new_value)
        }
    };
    // A delete of an absent entry never writes or fires.
    write = write && !(new_value.is_none() && old_repr.is_none());

    if !write {
        return Ok(MutateOutcome {
            applied,
            old: old_bytes,
        });
    }

    // Fire observers before the write, while the cursor still reads the
    // original value.
    if txn.fires_triggers() {
        let triggers = index.core.triggers.lock().snapshot();
        if !triggers.is_empty() {
            let (seed_state, autoload) = trig_seed.unwrap_or_else(|| {
                let state = if old_repr.is_some() {
                    ValueState::NotLoaded
                } else {
                    ValueState::Absent
                };
                (state, true)
            });
            let mut cursor = Cursor::for_trigger(
                index.view(),
                Some(txn.clone()),
                base_key.to_vec(),
                seed_state,
                autoload,
            );
            let value_ref = match new_value {
                Some(bytes) => ValueRef::Loaded(bytes),
                None => ValueRef::Absent,
            };
            for trigger in &triggers {
                match &fire {
                    FireMethod::Store => trigger.store(&mut cursor, value_ref)?,
                    FireMethod::ValueLength(length) => {
                        trigger.value_length(&mut cursor, *length)?;
                    }
                    FireMethod::ValueWrite { pos, buf } => {
                        trigger.value_write(&mut cursor, *pos, buf)?;
                    }
                    FireMethod::ValueClear { pos, len } => {
                        trigger.value_clear(&mut cursor, *pos, *len)?;
                    }
                }
            }
        }
    }

    // Write, coupling any fragmented old value to the trash first so the
    // pre-mutation bytes always survive somewhere.
    match new_value {
        Some(bytes) => {
            if let Some(ValueRepr::Fragmented(descriptor)) = &old_repr {
                if txn.locks_writes() {
                    txn.trash_fragmented(index.id(), base_key, descriptor)?;
                } else {
                    index.db.fragments.delete_fragments(descriptor)?;
                }
            } else if txn.locks_writes() {
                txn.push_undo(UndoRecord::Store {
                    index_id: index.id(),
                    key: base_key.to_vec(),
                    old: old_repr.clone(),
                });
            }
            let new_repr = encode_value(&index.db, bytes)?;
            index.core.store.put(base_key, new_repr)?;
        }
        None => {
            if let Some(ValueRepr::Fragmented(descriptor)) = &old_repr {
                if txn.locks_writes() {
                    txn.trash_fragmented(index.id(), base_key, descriptor)?;
                } else {
                    index.db.fragments.delete_fragments(descriptor)?;
                }
            } else if txn.locks_writes() {
                txn.push_undo(UndoRecord::Store {
                    index_id: index.id(),
                    key: base_key.to_vec(),
                    old: old_repr.clone(),
                });
            }
            index.core.store.delete(base_key)?;
        }
    }

    if let Some(txn_id) = txn.id() {
        txn.append_redo(RedoRecord::Store {
            txn_id,
            index_id: index.id(),
            key: base_key.to_vec(),
            value: new_value.map(<[u8]>::to_vec),
        });
        trace!(index_id = %index.id(), txn_id = %txn_id, "entry mutated");
    }

    Ok(MutateOutcome {
        applied,
        old: old_bytes,
    })
}
