//! Views: bounded, reversed, prefixed, key-only, and transformed
//! projections over an index.
//!
//! Views forward triggers with decorated cursors: an observer registered
//! on a view is wrapped layer by layer and installed on the underlying
//! index, so it observes mutations through the view's key space and
//! filtering rules.

use std::sync::Arc;

use burrow_error::{BurrowError, Result};
use burrow_types::{ValueRef, ValueState};

use crate::cursor::Cursor;
use crate::index::{mutate, FireMethod, Index, MutateCheck};
use crate::store::ValueRepr;
use crate::trigger::{Trigger, TriggerHandle};
use crate::txn::Transaction;

// ---------------------------------------------------------------------------
// Transformer
// ---------------------------------------------------------------------------

/// Row transformer for [`View::view_transformed`].
///
/// Implementations must be pure and re-runnable: a cursor load inside a
/// trigger re-applies `transform_value` to the freshly read row. Key
/// transforms must preserve unsigned-lexicographic ordering.
pub trait Transformer: Send + Sync {
    /// Transform or filter the key of the row the cursor is positioned at.
    /// Returning `None` hides the row (and suppresses triggers for it).
    fn transform_key(&self, cursor: &Cursor) -> Result<Option<Vec<u8>>>;

    /// Rewrite the value seen through the view. `key` is the stored key,
    /// `tkey` the transformed one.
    fn transform_value(
        &self,
        value: Option<Vec<u8>>,
        key: &[u8],
        tkey: &[u8],
    ) -> Result<Option<Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// Value visible through a view: absent, withheld (key-only views), or
/// plain bytes with fragments resolved and transforms applied.
pub(crate) enum ViewValue {
    Absent,
    Masked,
    Plain(Vec<u8>),
}

pub(crate) enum ViewInner {
    Base(Index),
    Reverse(View),
    Bounded {
        sub: View,
        /// Inclusive lower bound.
        lower: Option<Vec<u8>>,
        /// Exclusive upper bound.
        upper: Option<Vec<u8>>,
    },
    Prefix {
        sub: View,
        prefix: Vec<u8>,
        trim: usize,
    },
    Keys(View),
    Transformed {
        sub: View,
        transformer: Arc<dyn Transformer>,
    },
}

/// A possibly-bounded, possibly-transformed projection over an index.
#[derive(Clone)]
pub struct View {
    pub(crate) inner: Arc<ViewInner>,
}

impl View {
    pub(crate) fn base(index: Index) -> Self {
        Self {
            inner: Arc::new(ViewInner::Base(index)),
        }
    }

    fn wrap(inner: ViewInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The index at the bottom of the decorator chain.
    pub(crate) fn base_index(&self) -> &Index {
        match &*self.inner {
            ViewInner::Base(index) => index,
            ViewInner::Reverse(sub) | ViewInner::Keys(sub) => sub.base_index(),
            ViewInner::Bounded { sub, .. }
            | ViewInner::Prefix { sub, .. }
            | ViewInner::Transformed { sub, .. } => sub.base_index(),
        }
    }

    // -- Decorator constructors ------------------------------------------

    /// Restrict to keys greater than or equal to `bound`.
    #[must_use]
    pub fn view_ge(&self, bound: &[u8]) -> View {
        Self::wrap(ViewInner::Bounded {
            sub: self.clone(),
            lower: Some(bound.to_vec()),
            upper: None,
        })
    }

    /// Restrict to keys strictly less than `bound`.
    #[must_use]
    pub fn view_lt(&self, bound: &[u8]) -> View {
        Self::wrap(ViewInner::Bounded {
            sub: self.clone(),
            lower: None,
            upper: Some(bound.to_vec()),
        })
    }

    /// Restrict to keys starting with `prefix`, presenting them with the
    /// first `trim` bytes removed.
    #[must_use]
    pub fn view_prefix(&self, prefix: &[u8], trim: usize) -> View {
        let trim = trim.min(prefix.len());
        Self::wrap(ViewInner::Prefix {
            sub: self.clone(),
            prefix: prefix.to_vec(),
            trim,
        })
    }

    /// Reverse iteration order.
    #[must_use]
    pub fn view_reverse(&self) -> View {
        Self::wrap(ViewInner::Reverse(self.clone()))
    }

    /// Hide values: cursors and observers see only keys.
    #[must_use]
    pub fn view_keys(&self) -> View {
        Self::wrap(ViewInner::Keys(self.clone()))
    }

    /// Transform rows through `transformer`.
    #[must_use]
    pub fn view_transformed(&self, transformer: Arc<dyn Transformer>) -> View {
        Self::wrap(ViewInner::Transformed {
            sub: self.clone(),
            transformer,
        })
    }

    // -- Key-space mapping -----------------------------------------------

    /// Map a view key to the base index key, or `None` when the key lies
    /// outside this view's universe.
    pub(crate) fn to_base_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        match &*self.inner {
            ViewInner::Base(_) => Some(key.to_vec()),
            ViewInner::Reverse(sub) | ViewInner::Keys(sub) => sub.to_base_key(key),
            ViewInner::Bounded { sub, lower, upper } => {
                if !in_bounds(key, lower.as_deref(), upper.as_deref()) {
                    return None;
                }
                sub.to_base_key(key)
            }
            ViewInner::Prefix { sub, prefix, trim } => {
                let mut sub_key = prefix[..*trim].to_vec();
                sub_key.extend_from_slice(key);
                if !sub_key.starts_with(prefix) {
                    return None;
                }
                sub.to_base_key(&sub_key)
            }
            // Key transforms are required to be order preserving; the
            // transformed key is used as the navigation anchor.
            ViewInner::Transformed { sub, .. } => sub.to_base_key(key),
        }
    }

    // -- Navigation (each level operates in its own key space) -----------

    pub(crate) fn v_first(&self) -> Result<Option<Vec<u8>>> {
        match &*self.inner {
            ViewInner::Base(index) => index.core.store.first_key(),
            ViewInner::Reverse(sub) => sub.v_last(),
            ViewInner::Keys(sub) => sub.v_first(),
            ViewInner::Bounded { sub, lower, upper } => {
                let start = match lower {
                    Some(lower) => {
                        if sub.v_exists(lower)? {
                            Some(lower.clone())
                        } else {
                            sub.v_next(lower)?
                        }
                    }
                    None => sub.v_first()?,
                };
                Ok(start.filter(|k| in_bounds(k, lower.as_deref(), upper.as_deref())))
            }
            ViewInner::Prefix { sub, prefix, trim } => {
                let start = if sub.v_exists(prefix)? {
                    Some(prefix.clone())
                } else {
                    sub.v_next(prefix)?
                };
                Ok(start
                    .filter(|k| k.starts_with(prefix))
                    .map(|k| k[*trim..].to_vec()))
            }
            ViewInner::Transformed { sub, transformer } => {
                let mut sub_key = sub.v_first()?;
                while let Some(k) = sub_key {
                    if let Some(tkey) = transform_key_at(sub, transformer, &k)? {
                        return Ok(Some(tkey));
                    }
                    sub_key = sub.v_next(&k)?;
                }
                Ok(None)
            }
        }
    }

    pub(crate) fn v_last(&self) -> Result<Option<Vec<u8>>> {
        match &*self.inner {
            ViewInner::Base(index) => index.core.store.last_key(),
            ViewInner::Reverse(sub) => sub.v_first(),
            ViewInner::Keys(sub) => sub.v_last(),
            ViewInner::Bounded { sub, lower, upper } => {
                let end = match upper {
                    Some(upper) => sub.v_prev(upper)?,
                    None => sub.v_last()?,
                };
                Ok(end.filter(|k| in_bounds(k, lower.as_deref(), upper.as_deref())))
            }
            ViewInner::Prefix { sub, prefix, trim } => {
                let end = match prefix_successor(prefix) {
                    Some(upper) => sub.v_prev(&upper)?,
                    None => sub.v_last()?,
                };
                Ok(end
                    .filter(|k| k.starts_with(prefix))
                    .map(|k| k[*trim..].to_vec()))
            }
            ViewInner::Transformed { sub, transformer } => {
                let mut sub_key = sub.v_last()?;
                while let Some(k) = sub_key {
                    if let Some(tkey) = transform_key_at(sub, transformer, &k)? {
                        return Ok(Some(tkey));
                    }
                    sub_key = sub.v_prev(&k)?;
                }
                Ok(None)
            }
        }
    }

    pub(crate) fn v_next(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &*self.inner {
            ViewInner::Base(index) => index.core.store.next_key_above(key),
            ViewInner::Reverse(sub) => sub.v_prev(key),
            ViewInner::Keys(sub) => sub.v_next(key),
            ViewInner::Bounded { sub, lower, upper } => {
                if let Some(lower) = lower {
                    if key < &lower[..] {
                        return self.v_first();
                    }
                }
                let next = sub.v_next(key)?;
                Ok(next.filter(|k| in_bounds(k, lower.as_deref(), upper.as_deref())))
            }
            ViewInner::Prefix { sub, prefix, trim } => {
                let mut sub_key = prefix[..*trim].to_vec();
                sub_key.extend_from_slice(key);
                let next = sub.v_next(&sub_key)?;
                Ok(next
                    .filter(|k| k.starts_with(prefix))
                    .map(|k| k[*trim..].to_vec()))
            }
            ViewInner::Transformed { sub, transformer } => {
                let mut sub_key = sub.v_next(key)?;
                while let Some(k) = sub_key {
                    if let Some(tkey) = transform_key_at(sub, transformer, &k)? {
                        return Ok(Some(tkey));
                    }
                    sub_key = sub.v_next(&k)?;
                }
                Ok(None)
            }
        }
    }

    pub(crate) fn v_prev(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &*self.inner {
            ViewInner::Base(index) => index.core.store.next_key_below(key),
            ViewInner::Reverse(sub) => sub.v_next(key),
            ViewInner::Keys(sub) => sub.v_prev(key),
            ViewInner::Bounded { sub, lower, upper } => {
                if let Some(upper) = upper {
                    if key >= &upper[..] {
                        return self.v_last();
                    }
                }
                let prev = sub.v_prev(key)?;
                Ok(prev.filter(|k| in_bounds(k, lower.as_deref(), upper.as_deref())))
            }
            ViewInner::Prefix { sub, prefix, trim } => {
                let mut sub_key = prefix[..*trim].to_vec();
                sub_key.extend_from_slice(key);
                let prev = sub.v_prev(&sub_key)?;
                Ok(prev
                    .filter(|k| k.starts_with(prefix))
                    .map(|k| k[*trim..].to_vec()))
            }
            ViewInner::Transformed { sub, transformer } => {
                let mut sub_key = sub.v_prev(key)?;
                while let Some(k) = sub_key {
                    if let Some(tkey) = transform_key_at(sub, transformer, &k)? {
                        return Ok(Some(tkey));
                    }
                    sub_key = sub.v_prev(&k)?;
                }
                Ok(None)
            }
        }
    }

    pub(crate) fn v_exists(&self, key: &[u8]) -> Result<bool> {
        match &*self.inner {
            ViewInner::Base(index) => Ok(index.core.store.get(key)?.is_some()),
            ViewInner::Reverse(sub) | ViewInner::Keys(sub) => sub.v_exists(key),
            ViewInner::Bounded { sub, lower, upper } => {
                Ok(in_bounds(key, lower.as_deref(), upper.as_deref()) && sub.v_exists(key)?)
            }
            ViewInner::Prefix { sub, prefix, trim } => {
                let mut sub_key = prefix[..*trim].to_vec();
                sub_key.extend_from_slice(key);
                Ok(sub_key.starts_with(prefix) && sub.v_exists(&sub_key)?)
            }
            ViewInner::Transformed { sub, transformer } => {
                if !sub.v_exists(key)? {
                    return Ok(false);
                }
                Ok(transform_key_at(sub, transformer, key)?.is_some())
            }
        }
    }

    pub(crate) fn v_load(&self, key: &[u8]) -> Result<ViewValue> {
        match &*self.inner {
            ViewInner::Base(index) => match index.core.store.get(key)? {
                None => Ok(ViewValue::Absent),
                Some(ValueRepr::Inline(bytes)) => Ok(ViewValue::Plain(bytes)),
                Some(ValueRepr::Fragmented(descriptor)) => {
                    match index.db.fragments.load_fragmented(&descriptor)? {
                        Some(bytes) => Ok(ViewValue::Plain(bytes)),
                        None => Err(BurrowError::corrupt("dangling fragment descriptor")),
                    }
                }
            },
            ViewInner::Reverse(sub) => sub.v_load(key),
            ViewInner::Keys(sub) => match sub.v_load(key)? {
                ViewValue::Absent => Ok(ViewValue::Absent),
                ViewValue::Masked | ViewValue::Plain(_) => Ok(ViewValue::Masked),
            },
            ViewInner::Bounded { sub, lower, upper } => {
                if !in_bounds(key, lower.as_deref(), upper.as_deref()) {
                    return Ok(ViewValue::Absent);
                }
                sub.v_load(key)
            }
            ViewInner::Prefix { sub, prefix, trim } => {
                let mut sub_key = prefix[..*trim].to_vec();
                sub_key.extend_from_slice(key);
                if !sub_key.starts_with(prefix) {
                    return Ok(ViewValue::Absent);
                }
                sub.v_load(&sub_key)
            }
            ViewInner::Transformed { sub, transformer } => {
                let Some(tkey) = transform_key_at(sub, transformer, key)? else {
                    return Ok(ViewValue::Absent);
                };
                match sub.v_load(key)? {
                    ViewValue::Absent => Ok(ViewValue::Absent),
                    ViewValue::Masked => Ok(ViewValue::Masked),
                    ViewValue::Plain(bytes) => {
                        match transformer.transform_value(Some(bytes), key, &tkey)? {
                            Some(out) => Ok(ViewValue::Plain(out)),
                            None => Ok(ViewValue::Absent),
                        }
                    }
                }
            }
        }
    }

    // -- Operations ------------------------------------------------------

    /// Load the value for a view key.
    pub fn load(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let base_key = self
            .to_base_key(key)
            .ok_or(BurrowError::IllegalState("key outside view"))?;
        if let Some(txn) = txn {
            txn.read_lock(self.base_index().id(), &base_key)?;
        }
        match self.v_load(key)? {
            ViewValue::Plain(bytes) => Ok(Some(bytes)),
            ViewValue::Absent | ViewValue::Masked => Ok(None),
        }
    }

    /// Store (or delete, with `None`) through the view.
    pub fn store(&self, txn: Option<&Transaction>, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let base_key = self
            .to_base_key(key)
            .ok_or(BurrowError::IllegalState("key outside view"))?;
        let index = self.base_index().clone();
        mutate(
            &index,
            txn,
            &base_key,
            value,
            MutateCheck::Always,
            FireMethod::Store,
            None,
        )?;
        Ok(())
    }

    /// Open a cursor over this view.
    #[must_use]
    pub fn new_cursor(&self, txn: Option<&Transaction>) -> Cursor {
        Cursor::new(self.clone(), txn)
    }

    // -- Triggers --------------------------------------------------------

    /// Register an observer. It fires for mutations visible through this
    /// view, observing them through a decorated cursor.
    pub fn add_trigger(&self, trigger: Arc<dyn Trigger>) -> Result<TriggerHandle> {
        match &*self.inner {
            ViewInner::Base(index) => Ok(index.core.triggers.lock().add(trigger)),
            ViewInner::Reverse(sub) => sub.add_trigger(Arc::new(ReverseTrigger {
                view: self.clone(),
                source: trigger,
            })),
            ViewInner::Bounded { sub, lower, upper } => sub.add_trigger(Arc::new(BoundedTrigger {
                view: self.clone(),
                lower: lower.clone(),
                upper: upper.clone(),
                source: trigger,
            })),
            ViewInner::Prefix { sub, prefix, trim } => sub.add_trigger(Arc::new(PrefixTrigger {
                view: self.clone(),
                prefix: prefix.clone(),
                trim: *trim,
                source: trigger,
            })),
            ViewInner::Keys(sub) => sub.add_trigger(Arc::new(KeysTrigger {
                view: self.clone(),
                source: trigger,
            })),
            ViewInner::Transformed { sub, transformer } => {
                sub.add_trigger(Arc::new(TransformedTrigger {
                    view: self.clone(),
                    transformer: Arc::clone(transformer),
                    source: trigger,
                }))
            }
        }
    }

    /// Remove a previously registered observer.
    pub fn remove_trigger(&self, handle: TriggerHandle) -> Result<()> {
        self.base_index().core.triggers.lock().remove(handle)
    }
}

fn in_bounds(key: &[u8], lower: Option<&[u8]>, upper: Option<&[u8]>) -> bool {
    lower.is_none_or(|l| key >= l) && upper.is_none_or(|u| key < u)
}

/// Smallest byte string greater than every string with `prefix`, or `None`
/// when the prefix is all `0xFF`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut s = prefix.to_vec();
    loop {
        let &last = s.last()?;
        if last == 0xFF {
            s.pop();
        } else {
            *s.last_mut()? = last + 1;
            return Some(s);
        }
    }
}

/// Run the transformer's key function against the sub-view row at
/// `sub_key`, via a detached read-only cursor.
fn transform_key_at(
    sub: &View,
    transformer: &Arc<dyn Transformer>,
    sub_key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let cursor = Cursor::detached(sub.clone(), sub_key);
    transformer.transform_key(&cursor)
}

// ---------------------------------------------------------------------------
// Wrapped triggers (one per decorator kind)
// ---------------------------------------------------------------------------

fn rewrap(cursor: &Cursor, view: &View, key: Vec<u8>, value: ValueState) -> Cursor {
    Cursor::for_trigger(
        view.clone(),
        cursor.link().cloned(),
        key,
        value,
        cursor.is_autoload(),
    )
}

struct ReverseTrigger {
    view: View,
    source: Arc<dyn Trigger>,
}

impl ReverseTrigger {
    fn wrap(&self, cursor: &Cursor) -> Option<Cursor> {
        let key = cursor.key()?.to_vec();
        Some(rewrap(cursor, &self.view, key, cursor.value_state().clone()))
    }
}

impl Trigger for ReverseTrigger {
    fn store(&self, cursor: &mut Cursor, value: ValueRef<'_>) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.store(&mut wrapped, value),
            None => Ok(()),
        }
    }

    fn value_length(&self, cursor: &mut Cursor, length: i64) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.value_length(&mut wrapped, length),
            None => Ok(()),
        }
    }

    fn value_write(&self, cursor: &mut Cursor, pos: u64, buf: &[u8]) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.value_write(&mut wrapped, pos, buf),
            None => Ok(()),
        }
    }

    fn value_clear(&self, cursor: &mut Cursor, pos: u64, len: u64) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.value_clear(&mut wrapped, pos, len),
            None => Ok(()),
        }
    }
}

struct BoundedTrigger {
    view: View,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    source: Arc<dyn Trigger>,
}

impl BoundedTrigger {
    /// Keys outside the range do not fire the observer.
    fn wrap(&self, cursor: &Cursor) -> Option<Cursor> {
        let key = cursor.key()?;
        if !in_bounds(key, self.lower.as_deref(), self.upper.as_deref()) {
            return None;
        }
        let key = key.to_vec();
        Some(rewrap(cursor, &self.view, key, cursor.value_state().clone()))
    }
}

impl Trigger for BoundedTrigger {
    fn store(&self, cursor: &mut Cursor, value: ValueRef<'_>) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.store(&mut wrapped, value),
            None => Ok(()),
        }
    }

    fn value_length(&self, cursor: &mut Cursor, length: i64) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.value_length(&mut wrapped, length),
            None => Ok(()),
        }
    }

    fn value_write(&self, cursor: &mut Cursor, pos: u64, buf: &[u8]) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.value_write(&mut wrapped, pos, buf),
            None => Ok(()),
        }
    }

    fn value_clear(&self, cursor: &mut Cursor, pos: u64, len: u64) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.value_clear(&mut wrapped, pos, len),
            None => Ok(()),
        }
    }
}

struct PrefixTrigger {
    view: View,
    prefix: Vec<u8>,
    trim: usize,
    source: Arc<dyn Trigger>,
}

impl PrefixTrigger {
    fn wrap(&self, cursor: &Cursor) -> Option<Cursor> {
        let key = cursor.key()?;
        if !key.starts_with(&self.prefix) {
            return None;
        }
        let trimmed = key[self.trim..].to_vec();
        Some(rewrap(cursor, &self.view, trimmed, cursor.value_state().clone()))
    }
}

impl Trigger for PrefixTrigger {
    fn store(&self, cursor: &mut Cursor, value: ValueRef<'_>) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.store(&mut wrapped, value),
            None => Ok(()),
        }
    }

    fn value_length(&self, cursor: &mut Cursor, length: i64) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.value_length(&mut wrapped, length),
            None => Ok(()),
        }
    }

    fn value_write(&self, cursor: &mut Cursor, pos: u64, buf: &[u8]) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.value_write(&mut wrapped, pos, buf),
            None => Ok(()),
        }
    }

    fn value_clear(&self, cursor: &mut Cursor, pos: u64, len: u64) -> Result<()> {
        match self.wrap(cursor) {
            Some(mut wrapped) => self.source.value_clear(&mut wrapped, pos, len),
            None => Ok(()),
        }
    }
}

/// Key-only observer wrapper. Values are withheld, and operations that do
/// not change the key set are invisible; everything collapses to `store`
/// so key-view observers never load values.
struct KeysTrigger {
    view: View,
    source: Arc<dyn Trigger>,
}

impl KeysTrigger {
    fn fire(&self, cursor: &Cursor, deleting: bool) -> Result<()> {
        let Some(key) = cursor.key() else {
            return Ok(());
        };
        let key = key.to_vec();
        let old_exists = cursor.value_state().exists();
        let masked_old = if old_exists {
            ValueState::NotLoaded
        } else {
            ValueState::Absent
        };
        if deleting {
            if old_exists {
                let mut wrapped = rewrap(cursor, &self.view, key, masked_old);
                return self.source.store(&mut wrapped, ValueRef::Absent);
            }
        } else if !old_exists {
            let mut wrapped = rewrap(cursor, &self.view, key, masked_old);
            return self.source.store(&mut wrapped, ValueRef::NotLoaded);
        }
        Ok(())
    }
}

impl Trigger for KeysTrigger {
    fn store(&self, cursor: &mut Cursor, value: ValueRef<'_>) -> Result<()> {
        self.fire(cursor, value.is_absent())
    }

    fn value_length(&self, cursor: &mut Cursor, length: i64) -> Result<()> {
        self.fire(cursor, length < 0)
    }

    fn value_write(&self, cursor: &mut Cursor, _pos: u64, _buf: &[u8]) -> Result<()> {
        self.fire(cursor, false)
    }

    fn value_clear(&self, _cursor: &mut Cursor, _pos: u64, _len: u64) -> Result<()> {
        // A clear never changes the key set.
        Ok(())
    }
}

struct TransformedTrigger {
    view: View,
    transformer: Arc<dyn Transformer>,
    source: Arc<dyn Trigger>,
}

impl TransformedTrigger {
    fn wrap(&self, cursor: &Cursor) -> Result<Option<(Cursor, Vec<u8>)>> {
        let Some(_key) = cursor.key() else {
            return Ok(None);
        };
        let Some(tkey) = self.transformer.transform_key(cursor)? else {
            return Ok(None);
        };
        // The transform is applied lazily: the wrapped cursor reports the
        // value as not loaded until an explicit load re-runs it.
        let masked = if cursor.value_state().exists() {
            ValueState::NotLoaded
        } else {
            ValueState::Absent
        };
        let wrapped = rewrap(cursor, &self.view, tkey.clone(), masked);
        Ok(Some((wrapped, tkey)))
    }
}

impl Trigger for TransformedTrigger {
    fn store(&self, cursor: &mut Cursor, value: ValueRef<'_>) -> Result<()> {
        let Some((mut wrapped, tkey)) = self.wrap(cursor)? else {
            return Ok(());
        };
        let key = cursor.key().map(<[u8]>::to_vec).unwrap_or_default();
        match value {
            ValueRef::NotLoaded => self.source.store(&mut wrapped, ValueRef::NotLoaded),
            ValueRef::Absent => {
                match self.transformer.transform_value(None, &key, &tkey)? {
                    Some(out) => self.source.store(&mut wrapped, ValueRef::Loaded(&out)),
                    None => self.source.store(&mut wrapped, ValueRef::Absent),
                }
            }
            ValueRef::Loaded(bytes) => {
                match self
                    .transformer
                    .transform_value(Some(bytes.to_vec()), &key, &tkey)?
                {
                    Some(out) => self.source.store(&mut wrapped, ValueRef::Loaded(&out)),
                    None => self.source.store(&mut wrapped, ValueRef::Absent),
                }
            }
        }
    }

    fn value_length(&self, cursor: &mut Cursor, length: i64) -> Result<()> {
        match self.wrap(cursor)? {
            Some((mut wrapped, _)) => self.source.value_length(&mut wrapped, length),
            None => Ok(()),
        }
    }

    fn value_write(&self, cursor: &mut Cursor, pos: u64, buf: &[u8]) -> Result<()> {
        match self.wrap(cursor)? {
            Some((mut wrapped, _)) => self.source.value_write(&mut wrapped, pos, buf),
            None => Ok(()),
        }
    }

    fn value_clear(&self, cursor: &mut Cursor, pos: u64, len: u64) -> Result<()> {
        match self.wrap(cursor)? {
            Some((mut wrapped, _)) => self.source.value_clear(&mut wrapped, pos, len),
            None => Ok(()),
        }
    }
}
