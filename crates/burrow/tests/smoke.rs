//! End-to-end smoke test through the public facade.

use burrow::{Database, DatabaseConfig, LockResult, LockUpgradeRule};

#[test]
fn open_store_and_read_back() {
    let db = Database::open(DatabaseConfig::new().upgrade_rule(LockUpgradeRule::Strict));
    let ix = db.open_index("people").unwrap();

    ix.store(None, b"ada", Some(&b"lovelace"[..])).unwrap();
    assert_eq!(
        ix.load(None, b"ada").unwrap().as_deref(),
        Some(&b"lovelace"[..])
    );

    let txn = db.new_transaction();
    ix.store(Some(&txn), b"alan", Some(&b"turing"[..])).unwrap();
    assert_eq!(txn.lock_check(ix.id(), b"alan"), LockResult::OwnedExclusive);
    txn.commit().unwrap();

    let mut cursor = ix.new_cursor(None);
    cursor.first().unwrap();
    assert_eq!(cursor.key(), Some(&b"ada"[..]));
    cursor.next().unwrap();
    assert_eq!(cursor.key(), Some(&b"alan"[..]));
    cursor.next().unwrap();
    assert_eq!(cursor.key(), None);

    assert_eq!(ix.entry_count().unwrap(), 2);
}
