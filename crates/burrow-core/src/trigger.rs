//! Pre-mutation observers.
//!
//! Triggers are invoked immediately before transactional modifications,
//! for making observations. They can read the values being stored but must
//! not alter them, and must not reposition the passed cursor outside a
//! cloned copy. Modifications made without acquiring locks (the bogus
//! transaction, the unsafe lock mode) never fire triggers.

use std::sync::Arc;

use burrow_error::{BurrowError, Result};
use burrow_types::ValueRef;

use crate::cursor::{Cursor, MAX_VALUE_LENGTH};

/// A pre-mutation observer.
pub trait Trigger: Send + Sync {
    /// Invoked immediately before a store or commit operation.
    ///
    /// The cursor is positioned at the key and references the original
    /// value (possibly not yet loaded). `value` is the incoming new value;
    /// `Absent` for a delete.
    fn store(&self, cursor: &mut Cursor, value: ValueRef<'_>) -> Result<()>;

    /// Invoked immediately before a value-length change. A negative length
    /// deletes the value. The default loads the current value, constructs
    /// the post-mutation value, and dispatches through [`Trigger::store`].
    fn value_length(&self, cursor: &mut Cursor, length: i64) -> Result<()> {
        if length < 0 {
            return self.store(cursor, ValueRef::Absent);
        }
        let length = length.unsigned_abs();
        if length > MAX_VALUE_LENGTH {
            return Err(BurrowError::LargeValue { length });
        }
        let mut new_value = cursor.current_value_bytes()?.unwrap_or_default();
        new_value.resize(usize::try_from(length).unwrap_or(usize::MAX), 0);
        self.store(cursor, ValueRef::Loaded(&new_value))
    }

    /// Invoked immediately before a ranged value write. The default loads,
    /// patches, and dispatches through [`Trigger::store`].
    fn value_write(&self, cursor: &mut Cursor, pos: u64, buf: &[u8]) -> Result<()> {
        let end = pos
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= MAX_VALUE_LENGTH)
            .ok_or(BurrowError::LargeValue { length: u64::MAX })?;
        let mut new_value = cursor.current_value_bytes()?.unwrap_or_default();
        if (new_value.len() as u64) < end {
            new_value.resize(end as usize, 0);
        }
        new_value[pos as usize..end as usize].copy_from_slice(buf);
        self.store(cursor, ValueRef::Loaded(&new_value))
    }

    /// Invoked immediately before a ranged value clear. The default loads,
    /// zeroes, and dispatches through [`Trigger::store`].
    fn value_clear(&self, cursor: &mut Cursor, pos: u64, len: u64) -> Result<()> {
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= MAX_VALUE_LENGTH)
            .ok_or(BurrowError::LargeValue { length: u64::MAX })?;
        let mut new_value = cursor.current_value_bytes()?.unwrap_or_default();
        if (new_value.len() as u64) < end {
            new_value.resize(end as usize, 0);
        }
        new_value[pos as usize..end as usize].fill(0);
        self.store(cursor, ValueRef::Loaded(&new_value))
    }
}

/// Handle identifying a registered trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerHandle(u64);

/// Per-index LIFO observer list. The most recently added trigger fires
/// first.
pub(crate) struct TriggerList {
    entries: Vec<(u64, Arc<dyn Trigger>)>,
    next_id: u64,
}

impl TriggerList {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub(crate) fn add(&mut self, trigger: Arc<dyn Trigger>) -> TriggerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(0, (id, trigger));
        TriggerHandle(id)
    }

    pub(crate) fn remove(&mut self, handle: TriggerHandle) -> Result<()> {
        match self.entries.iter().position(|(id, _)| *id == handle.0) {
            Some(pos) => {
                self.entries.remove(pos);
                Ok(())
            }
            None => Err(BurrowError::IllegalState("unknown trigger handle")),
        }
    }

    /// Firing-order snapshot (newest first).
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Trigger>> {
        self.entries.iter().map(|(_, t)| Arc::clone(t)).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
