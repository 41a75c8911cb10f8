//! Cursors: stateful positions over views.
//!
//! A cursor tracks a view-space key, an autoload policy, and a tri-state
//! value (`Loaded` / `NotLoaded` / `Absent`). Navigation re-reads the
//! backing store through the view, so a freshly stored key is visible to
//! the same cursor and its copies immediately.

use burrow_error::{BurrowError, Result};
use burrow_types::{ValueRef, ValueState};

use crate::index::{mutate, FireMethod, Index, MutateCheck};
use crate::txn::Transaction;
use crate::view::{View, ViewValue};

/// Largest representable value length.
pub const MAX_VALUE_LENGTH: u64 = i32::MAX as u64;

/// A stateful position over a view, with an autoload policy and a linked
/// transaction.
#[derive(Clone)]
pub struct Cursor {
    view: View,
    txn: Option<Transaction>,
    key: Option<Vec<u8>>,
    value: ValueState,
    autoload: bool,
}

impl Cursor {
    pub(crate) fn new(view: View, txn: Option<&Transaction>) -> Self {
        Self {
            view,
            txn: txn.cloned(),
            key: None,
            value: ValueState::Absent,
            autoload: true,
        }
    }

    /// A read-only cursor used to present a row to a transformer.
    pub(crate) fn detached(view: View, key: &[u8]) -> Self {
        Self {
            view,
            txn: None,
            key: Some(key.to_vec()),
            value: ValueState::NotLoaded,
            autoload: false,
        }
    }

    /// The decorated cursor handed to observers.
    pub(crate) fn for_trigger(
        view: View,
        txn: Option<Transaction>,
        key: Vec<u8>,
        value: ValueState,
        autoload: bool,
    ) -> Self {
        Self {
            view,
            txn,
            key: Some(key),
            value,
            autoload,
        }
    }

    // -- Accessors -------------------------------------------------------

    /// Current key, or `None` when unpositioned or exhausted.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Current value state.
    #[must_use]
    pub fn value(&self) -> ValueRef<'_> {
        self.value.as_ref()
    }

    pub(crate) fn value_state(&self) -> &ValueState {
        &self.value
    }

    /// The linked transaction, if any.
    #[must_use]
    pub fn link(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }

    /// Change the autoload policy.
    pub fn autoload(&mut self, mode: bool) {
        self.autoload = mode;
    }

    /// Current autoload policy.
    #[must_use]
    pub fn is_autoload(&self) -> bool {
        self.autoload
    }

    // -- Navigation ------------------------------------------------------

    /// Position at `key` (which need not exist).
    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        self.key = Some(key.to_vec());
        if let Some(txn) = &self.txn {
            if let Some(base_key) = self.view.to_base_key(key) {
                txn.read_lock(self.view.base_index().id(), &base_key)?;
            }
        }
        self.refresh_value()
    }

    /// Position at the first entry in view order.
    pub fn first(&mut self) -> Result<()> {
        self.key = self.view.v_first()?;
        self.refresh_value()
    }

    /// Position at the last entry in view order.
    pub fn last(&mut self) -> Result<()> {
        self.key = self.view.v_last()?;
        self.refresh_value()
    }

    /// Advance to the next entry in view order.
    pub fn next(&mut self) -> Result<()> {
        let Some(key) = self.key.take() else {
            return Err(BurrowError::IllegalState("cursor unpositioned"));
        };
        self.key = self.view.v_next(&key)?;
        self.refresh_value()
    }

    /// Step back to the previous entry in view order.
    pub fn previous(&mut self) -> Result<()> {
        let Some(key) = self.key.take() else {
            return Err(BurrowError::IllegalState("cursor unpositioned"));
        };
        self.key = self.view.v_prev(&key)?;
        self.refresh_value()
    }

    /// An independent copy at the same position.
    #[must_use]
    pub fn copy(&self) -> Cursor {
        self.clone()
    }

    /// Unposition the cursor.
    pub fn reset(&mut self) {
        self.key = None;
        self.value = ValueState::Absent;
    }

    /// Load the value at the current position. Through a key-only view the
    /// value stays withheld; through a transformed view the transform is
    /// re-applied to the freshly read row.
    pub fn load(&mut self) -> Result<()> {
        let Some(key) = self.key.clone() else {
            return Err(BurrowError::IllegalState("cursor unpositioned"));
        };
        self.value = match self.view.v_load(&key)? {
            ViewValue::Absent => ValueState::Absent,
            ViewValue::Masked => ValueState::NotLoaded,
            ViewValue::Plain(bytes) => ValueState::Loaded(bytes),
        };
        Ok(())
    }

    fn refresh_value(&mut self) -> Result<()> {
        let Some(key) = self.key.clone() else {
            self.value = ValueState::Absent;
            return Ok(());
        };
        if self.autoload {
            self.load()
        } else {
            self.value = if self.view.v_exists(&key)? {
                ValueState::NotLoaded
            } else {
                ValueState::Absent
            };
            Ok(())
        }
    }

    /// Post-mutation bytes at the current position, resolving fragments
    /// and transforms; `None` if absent or withheld.
    pub(crate) fn current_value_bytes(&self) -> Result<Option<Vec<u8>>> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        match self.view.v_load(key)? {
            ViewValue::Plain(bytes) => Ok(Some(bytes)),
            ViewValue::Absent | ViewValue::Masked => Ok(None),
        }
    }

    // -- Mutation --------------------------------------------------------

    fn position_for_write(&self) -> Result<(Vec<u8>, Index)> {
        let key = self
            .key
            .clone()
            .ok_or(BurrowError::IllegalState("cursor unpositioned"))?;
        let base_key = self
            .view
            .to_base_key(&key)
            .ok_or(BurrowError::IllegalState("key outside view"))?;
        Ok((base_key, self.view.base_index().clone()))
    }

    /// Store a value (or delete with `None`) at the current position.
    pub fn store(&mut self, value: Option<&[u8]>) -> Result<()> {
        let (base_key, index) = self.position_for_write()?;
        mutate(
            &index,
            self.txn.as_ref(),
            &base_key,
            value,
            MutateCheck::Always,
            FireMethod::Store,
            Some((self.value.clone(), self.autoload)),
        )?;
        self.value = match value {
            Some(bytes) => ValueState::Loaded(bytes.to_vec()),
            None => ValueState::Absent,
        };
        Ok(())
    }

    /// Store a value and commit the linked transaction.
    pub fn commit(&mut self, value: Option<&[u8]>) -> Result<()> {
        self.store(value)?;
        if let Some(txn) = &self.txn {
            txn.commit()?;
        }
        Ok(())
    }

    // -- Value accessor operations ---------------------------------------

    /// Set the value length: truncate, zero-extend, or (negative) delete.
    /// Length changes that leave the bytes unchanged do not fire triggers
    /// and do not write.
    pub fn value_length(&mut self, length: i64) -> Result<()> {
        let current = self.current_value_bytes_positioned()?;
        let new_value: Option<Vec<u8>> = if length < 0 {
            None
        } else {
            let length = length.unsigned_abs();
            if length > MAX_VALUE_LENGTH {
                return Err(BurrowError::LargeValue { length });
            }
            let mut bytes = current.clone().unwrap_or_default();
            bytes.resize(usize::try_from(length).unwrap_or(usize::MAX), 0);
            Some(bytes)
        };
        if new_value == current {
            return Ok(());
        }
        self.apply_accessor(new_value, FireMethod::ValueLength(length))
    }

    /// Write `buf` at `pos`, zero-extending as needed.
    pub fn value_write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        let current = self.current_value_bytes_positioned()?;
        let end = pos
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= MAX_VALUE_LENGTH)
            .ok_or(BurrowError::LargeValue { length: u64::MAX })?;
        let mut bytes = current.clone().unwrap_or_default();
        if (bytes.len() as u64) < end {
            bytes.resize(end as usize, 0);
        }
        bytes[pos as usize..end as usize].copy_from_slice(buf);
        let new_value = Some(bytes);
        if new_value == current {
            return Ok(());
        }
        self.apply_accessor(new_value, FireMethod::ValueWrite { pos, buf })
    }

    /// Zero the range `[pos, pos + len)`, extending the value if the range
    /// reaches past its end. Clearing bytes that are already zero is a
    /// no-op.
    pub fn value_clear(&mut self, pos: u64, len: u64) -> Result<()> {
        let Some(current) = self.current_value_bytes_positioned()? else {
            return Ok(());
        };
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= MAX_VALUE_LENGTH)
            .ok_or(BurrowError::LargeValue { length: u64::MAX })?;
        let mut bytes = current.clone();
        if (bytes.len() as u64) < end {
            bytes.resize(end as usize, 0);
        }
        bytes[pos as usize..end as usize].fill(0);
        if bytes == current {
            return Ok(());
        }
        self.apply_accessor(Some(bytes), FireMethod::ValueClear { pos, len })
    }

    fn current_value_bytes_positioned(&self) -> Result<Option<Vec<u8>>> {
        if self.key.is_none() {
            return Err(BurrowError::IllegalState("cursor unpositioned"));
        }
        self.current_value_bytes()
    }

    fn apply_accessor(&mut self, new_value: Option<Vec<u8>>, fire: FireMethod<'_>) -> Result<()> {
        let (base_key, index) = self.position_for_write()?;
        mutate(
            &index,
            self.txn.as_ref(),
            &base_key,
            new_value.as_deref(),
            MutateCheck::Always,
            fire,
            Some((self.value.clone(), self.autoload)),
        )?;
        self.value = match new_value {
            Some(bytes) => ValueState::Loaded(bytes),
            None => ValueState::Absent,
        };
        Ok(())
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("key", &self.key)
            .field("autoload", &self.autoload)
            .finish_non_exhaustive()
    }
}
