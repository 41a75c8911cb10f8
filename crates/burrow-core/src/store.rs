//! External collaborator seams: the ordered key/value store backing each
//! index and the fragmented-value side store.
//!
//! The concurrency core never touches pages directly; it consumes these
//! traits. The in-memory implementations here are the reference backends
//! used by the engine facade and the test suites.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use burrow_error::Result;
use burrow_types::{read_u64_be, write_u64_be};

// ---------------------------------------------------------------------------
// Value representation
// ---------------------------------------------------------------------------

/// How an index entry's value is physically represented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRepr {
    /// Value bytes stored inline with the entry.
    Inline(Vec<u8>),
    /// A fragment descriptor; the bytes live in the fragment store.
    Fragmented(Vec<u8>),
}

impl ValueRepr {
    /// Whether this is a fragment descriptor.
    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        matches!(self, Self::Fragmented(_))
    }
}

// ---------------------------------------------------------------------------
// OrderedStore
// ---------------------------------------------------------------------------

/// An ordered byte-key store, one per index.
///
/// Keys are opaque byte sequences in unsigned-lexicographic order. The
/// store is internally synchronized; callers provide transactional
/// semantics above it.
pub trait OrderedStore: Send + Sync {
    /// Value for `key`, if present.
    fn get(&self, key: &[u8]) -> Result<Option<ValueRepr>>;

    /// Store a value, replacing any existing one.
    fn put(&self, key: &[u8], value: ValueRepr) -> Result<()>;

    /// Store a value only if the key is absent. Returns whether it stored.
    fn put_if_absent(&self, key: &[u8], value: ValueRepr) -> Result<bool>;

    /// Remove an entry, returning its old value.
    fn delete(&self, key: &[u8]) -> Result<Option<ValueRepr>>;

    /// Smallest key.
    fn first_key(&self) -> Result<Option<Vec<u8>>>;

    /// Largest key.
    fn last_key(&self) -> Result<Option<Vec<u8>>>;

    /// Smallest key strictly greater than `key`.
    fn next_key_above(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Largest key strictly less than `key`.
    fn next_key_below(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Number of entries.
    fn len(&self) -> Result<usize>;

    /// Whether the store has no entries.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory ordered store over a B-tree map.
#[derive(Default)]
pub struct MemStore {
    entries: RwLock<BTreeMap<Vec<u8>, ValueRepr>>,
}

impl MemStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl OrderedStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<ValueRepr>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: ValueRepr) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn put_if_absent(&self, key: &[u8], value: ValueRepr) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_vec(), value);
        Ok(true)
    }

    fn delete(&self, key: &[u8]) -> Result<Option<ValueRepr>> {
        Ok(self.entries.write().remove(key))
    }

    fn first_key(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().keys().next().cloned())
    }

    fn last_key(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().keys().next_back().cloned())
    }

    fn next_key_above(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn next_key_below(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, _)| k.clone()))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }
}

// ---------------------------------------------------------------------------
// FragmentStore
// ---------------------------------------------------------------------------

/// Side store for values too large to keep inline.
///
/// `insert_fragmented` persists the bytes and returns an opaque descriptor;
/// the descriptor is what index entries and trash records carry.
pub trait FragmentStore: Send + Sync {
    /// Persist `value`, returning its descriptor.
    fn insert_fragmented(&self, value: &[u8]) -> Result<Vec<u8>>;

    /// Read back the bytes for a descriptor.
    fn load_fragmented(&self, descriptor: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Release the storage referenced by a descriptor.
    fn delete_fragments(&self, descriptor: &[u8]) -> Result<()>;

    /// Number of live fragmented values (diagnostics).
    fn live_count(&self) -> usize;
}

/// In-memory fragment store; descriptors are 8-byte big-endian ids.
#[derive(Default)]
pub struct MemFragmentStore {
    fragments: Mutex<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemFragmentStore {
    /// Create an empty fragment store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl FragmentStore for MemFragmentStore {
    fn insert_fragmented(&self, value: &[u8]) -> Result<Vec<u8>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.fragments.lock().insert(id, value.to_vec());
        let mut descriptor = vec![0u8; 8];
        write_u64_be(&mut descriptor, 0, id);
        Ok(descriptor)
    }

    fn load_fragmented(&self, descriptor: &[u8]) -> Result<Option<Vec<u8>>> {
        if descriptor.len() != 8 {
            return Ok(None);
        }
        let id = read_u64_be(descriptor, 0);
        Ok(self.fragments.lock().get(&id).cloned())
    }

    fn delete_fragments(&self, descriptor: &[u8]) -> Result<()> {
        if descriptor.len() == 8 {
            let id = read_u64_be(descriptor, 0);
            self.fragments.lock().remove(&id);
        }
        Ok(())
    }

    fn live_count(&self) -> usize {
        self.fragments.lock().len()
    }
}
