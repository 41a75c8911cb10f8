//! Fragmented-value trash coupling: rollback, commit reclamation,
//! recovery, and failure promotion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use burrow_core::{Database, DatabaseConfig, MemStore, OrderedStore, ValueRepr};
use burrow_error::{BurrowError, Result};

fn small_fragment_db() -> Database {
    Database::open(DatabaseConfig::new().fragment_threshold(64))
}

fn big_value(fill: u8) -> Vec<u8> {
    vec![fill; 300]
}

#[test]
fn rollback_restores_replaced_fragmented_value() {
    let db = small_fragment_db();
    let ix = db.open_index("test").unwrap();
    let fragments = db.fragment_store();

    let original = big_value(0xA1);
    ix.store(None, b"big", Some(original.as_slice())).unwrap();
    assert_eq!(fragments.live_count(), 1);

    // Replace under a transaction: the original must move to the trash
    // before the new value lands.
    let txn = db.new_transaction();
    let replacement = big_value(0xB2);
    ix.store(Some(&txn), b"big", Some(replacement.as_slice())).unwrap();
    assert_eq!(db.trash_record_count().unwrap(), 1);
    assert_eq!(ix.load(Some(&txn), b"big").unwrap(), Some(replacement));

    // Abort: the original comes back byte for byte, the trash drains, and
    // the replacement's fragments are released.
    txn.reset().unwrap();
    assert_eq!(ix.load(None, b"big").unwrap(), Some(original));
    assert_eq!(db.trash_record_count().unwrap(), 0);
    assert_eq!(fragments.live_count(), 1);
}

#[test]
fn rollback_restores_deleted_fragmented_value() {
    let db = small_fragment_db();
    let ix = db.open_index("test").unwrap();

    let original = big_value(0xC3);
    ix.store(None, b"big", Some(original.as_slice())).unwrap();

    let txn = db.new_transaction();
    assert!(ix.delete(Some(&txn), b"big").unwrap());
    assert_eq!(ix.load(Some(&txn), b"big").unwrap(), None);
    assert_eq!(db.trash_record_count().unwrap(), 1);

    txn.reset().unwrap();
    assert_eq!(ix.load(None, b"big").unwrap(), Some(original));
    assert_eq!(db.trash_record_count().unwrap(), 0);
}

#[test]
fn commit_reclaims_trashed_fragments() {
    let db = small_fragment_db();
    let ix = db.open_index("test").unwrap();
    let fragments = db.fragment_store();

    let original = big_value(0xD4);
    ix.store(None, b"big", Some(original.as_slice())).unwrap();

    let txn = db.new_transaction();
    let replacement = big_value(0xE5);
    ix.store(Some(&txn), b"big", Some(replacement.as_slice())).unwrap();
    assert_eq!(fragments.live_count(), 2);

    txn.commit().unwrap();
    assert_eq!(ix.load(None, b"big").unwrap(), Some(replacement));
    assert_eq!(db.trash_record_count().unwrap(), 0);
    // Only the replacement's fragments survive the commit drain.
    assert_eq!(fragments.live_count(), 1);
}

#[test]
fn rollback_of_fresh_fragmented_insert_releases_fragments() {
    let db = small_fragment_db();
    let ix = db.open_index("test").unwrap();
    let fragments = db.fragment_store();

    let txn = db.new_transaction();
    ix.store(Some(&txn), b"big", Some(big_value(0xF6).as_slice())).unwrap();
    assert_eq!(fragments.live_count(), 1);
    // No trash: the key had no prior fragmented value.
    assert_eq!(db.trash_record_count().unwrap(), 0);

    txn.reset().unwrap();
    assert_eq!(ix.load(None, b"big").unwrap(), None);
    assert_eq!(fragments.live_count(), 0);
}

#[test]
fn multiple_replacements_drain_newest_first() {
    let db = small_fragment_db();
    let ix = db.open_index("test").unwrap();

    ix.store(None, b"big", Some(big_value(1).as_slice())).unwrap();

    let txn = db.new_transaction();
    ix.store(Some(&txn), b"big", Some(big_value(2).as_slice())).unwrap();
    ix.store(Some(&txn), b"big", Some(big_value(3).as_slice())).unwrap();
    ix.store(Some(&txn), b"big", Some(big_value(4).as_slice())).unwrap();
    assert_eq!(db.trash_record_count().unwrap(), 3);

    // Reverse replay walks back to the oldest value.
    txn.reset().unwrap();
    assert_eq!(ix.load(None, b"big").unwrap(), Some(big_value(1)));
    assert_eq!(db.trash_record_count().unwrap(), 0);
}

#[test]
fn recovery_drains_pending_trash() {
    let db = small_fragment_db();
    let ix = db.open_index("test").unwrap();
    let fragments = db.fragment_store();

    ix.store(None, b"big", Some(big_value(7).as_slice())).unwrap();

    // A transaction replaces the value and then the process "crashes":
    // neither commit nor rollback runs.
    {
        let txn = db.new_transaction();
        ix.store(Some(&txn), b"big", Some(big_value(8).as_slice())).unwrap();
        std::mem::forget(txn);
    }
    assert_eq!(db.trash_record_count().unwrap(), 1);

    // Any surviving entry signals in-flight transactions at crash.
    assert!(db.recover().unwrap());
    assert_eq!(db.trash_record_count().unwrap(), 0);
    assert_eq!(fragments.live_count(), 1);
    assert!(!db.recover().unwrap());
}

/// Ordered store that can be armed to fail its next write.
struct TrippableStore {
    inner: Arc<MemStore>,
    fail_puts: AtomicBool,
}

impl TrippableStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemStore::new(),
            fail_puts: AtomicBool::new(false),
        })
    }
}

impl OrderedStore for TrippableStore {
    fn get(&self, key: &[u8]) -> Result<Option<ValueRepr>> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: ValueRepr) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BurrowError::Io(std::io::Error::other("injected trash fault")));
        }
        self.inner.put(key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: ValueRepr) -> Result<bool> {
        self.inner.put_if_absent(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<Option<ValueRepr>> {
        self.inner.delete(key)
    }

    fn first_key(&self) -> Result<Option<Vec<u8>>> {
        self.inner.first_key()
    }

    fn last_key(&self) -> Result<Option<Vec<u8>>> {
        self.inner.last_key()
    }

    fn next_key_above(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.next_key_above(key)
    }

    fn next_key_below(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.next_key_below(key)
    }

    fn len(&self) -> Result<usize> {
        self.inner.len()
    }
}

#[test]
fn trash_write_failure_borks_the_transaction() {
    let trash_store = TrippableStore::new();
    let db = Database::open(
        DatabaseConfig::new()
            .fragment_threshold(64)
            .trash_store(Arc::clone(&trash_store) as Arc<dyn OrderedStore>),
    );
    let ix = db.open_index("test").unwrap();

    let original = big_value(0x11);
    ix.store(None, b"big", Some(original.as_slice())).unwrap();

    let txn = db.new_transaction();
    trash_store.fail_puts.store(true, Ordering::SeqCst);
    let err = ix
        .store(Some(&txn), b"big", Some(big_value(0x22).as_slice()))
        .unwrap_err();
    assert!(matches!(err, BurrowError::Io(_)));

    // The failure promoted the transaction; commits are refused until a
    // reset, and the index still holds the original value.
    assert!(txn.is_borked());
    assert!(matches!(txn.commit(), Err(BurrowError::Borked { .. })));
    assert_eq!(ix.load(None, b"big").unwrap(), Some(original.clone()));

    trash_store.fail_puts.store(false, Ordering::SeqCst);
    txn.reset().unwrap();
    assert!(!txn.is_borked());
    ix.store(Some(&txn), b"big", Some(big_value(0x33).as_slice())).unwrap();
    txn.commit().unwrap();
    assert_eq!(ix.load(None, b"big").unwrap(), Some(big_value(0x33)));
}
