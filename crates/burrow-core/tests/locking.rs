//! Locking behavior across transactions: deadlock detection, scope
//! round-trips, bogus silence, and durability-gated lock release.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use burrow_core::{Database, DatabaseConfig, MemRedoLog, RedoLog, Transaction};
use burrow_error::BurrowError;
use burrow_lock::LockResult;

#[test]
fn two_transaction_deadlock_is_detected() {
    let db = Database::open_default();
    let ix = db.open_index("test").unwrap();
    let ix_id = ix.id();

    let txn_a = db.new_transaction();
    assert_eq!(
        txn_a.lock_exclusive(ix_id, b"k1").unwrap(),
        LockResult::Acquired
    );

    let (ready_tx, ready_rx) = mpsc::channel();
    let db2 = db.clone();
    let waiter = std::thread::spawn(move || {
        let txn_b = db2.new_transaction();
        txn_b.set_lock_timeout(Duration::from_secs(5));
        txn_b.lock_exclusive(ix_id, b"k2").unwrap();
        ready_tx.send(()).unwrap();
        // Parks on k1, which A holds, while holding k2.
        let result = txn_b.lock_exclusive(ix_id, b"k1");
        txn_b.reset().unwrap();
        result
    });

    ready_rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    // A now closes the cycle: it holds k1 and requests k2 with a short
    // timeout, so it times out first and its detector sees the cycle.
    txn_a.set_lock_timeout(Duration::from_millis(300));
    let err = txn_a.lock_exclusive(ix_id, b"k2").unwrap_err();
    match err {
        BurrowError::Deadlock { set, guilty, .. } => {
            assert!(guilty);
            assert_eq!(set.len(), 2);
            assert!(set.contains(ix_id, b"k1"));
            assert!(set.contains(ix_id, b"k2"));
        }
        other => panic!("expected a deadlock, got {other:?}"),
    }

    // Rolling the guilty party back lets the other proceed.
    txn_a.reset().unwrap();
    assert!(waiter.join().unwrap().unwrap().is_held());
}

#[test]
fn bogus_transaction_takes_no_locks() {
    let db = Database::open_default();
    let ix = db.open_index("test").unwrap();

    let bogus = Transaction::bogus();
    ix.store(Some(&bogus), b"k1", Some(&b"v1"[..])).unwrap();

    // Nothing holds the key: another transaction can lock it instantly.
    let probe = db.new_transaction();
    probe.set_lock_timeout(Duration::ZERO);
    assert_eq!(
        probe.lock_exclusive(ix.id(), b"k1").unwrap(),
        LockResult::Acquired
    );
    probe.reset().unwrap();
    assert_eq!(bogus.held_lock_count(), 0);
}

#[test]
fn scope_exit_restores_parent_view() {
    let db = Database::open_default();
    let ix = db.open_index("test").unwrap();

    let txn = db.new_transaction();
    ix.store(Some(&txn), b"outer", Some(&b"o1"[..])).unwrap();
    let held_before = txn.held_lock_count();

    txn.enter().unwrap();
    assert!(txn.is_nested());
    assert_eq!(txn.nesting_level(), 1);
    ix.store(Some(&txn), b"inner-a", Some(&b"i1"[..])).unwrap();
    ix.store(Some(&txn), b"inner-b", Some(&b"i2"[..])).unwrap();
    assert!(txn.held_lock_count() > held_before);

    // Exiting the scope rolls back exactly the inner mutations and
    // releases exactly the inner locks.
    txn.exit().unwrap();
    assert!(!txn.is_nested());
    assert_eq!(txn.held_lock_count(), held_before);
    assert_eq!(txn.lock_check(ix.id(), b"inner-a"), LockResult::Unowned);
    assert_eq!(ix.load(None, b"inner-a").unwrap(), None);
    assert_eq!(ix.load(None, b"inner-b").unwrap(), None);

    // The outer mutation is intact and still locked.
    assert_eq!(
        txn.lock_check(ix.id(), b"outer"),
        LockResult::OwnedExclusive
    );
    txn.commit().unwrap();
    assert_eq!(ix.load(None, b"outer").unwrap().as_deref(), Some(&b"o1"[..]));
}

#[test]
fn nested_commit_promotes_to_parent() {
    let db = Database::open_default();
    let ix = db.open_index("test").unwrap();

    let txn = db.new_transaction();
    txn.enter().unwrap();
    ix.store(Some(&txn), b"k", Some(&b"v"[..])).unwrap();
    txn.commit().unwrap();
    assert!(!txn.is_nested());

    // The nested commit kept the lock and the pending change.
    assert_eq!(txn.lock_check(ix.id(), b"k"), LockResult::OwnedExclusive);
    txn.reset().unwrap();
    assert_eq!(ix.load(None, b"k").unwrap(), None);
}

#[test]
fn insert_then_delete_is_lock_stack_net_stable() {
    let db = Database::open_default();
    let ix = db.open_index("test").unwrap();

    let txn = db.new_transaction();
    let base = txn.held_lock_count();
    ix.store(Some(&txn), b"k", Some(&b"v"[..])).unwrap();
    let after_insert = txn.held_lock_count();
    ix.delete(Some(&txn), b"k").unwrap();
    // The same exclusive lock covers both operations.
    assert_eq!(txn.held_lock_count(), after_insert);
    assert_eq!(after_insert, base + 1);
    txn.commit().unwrap();
    assert_eq!(txn.held_lock_count(), 0);
}

#[test]
fn last_locked_reports_stack_top() {
    let db = Database::open_default();
    let ix = db.open_index("test").unwrap();

    let txn = db.new_transaction();
    txn.lock_exclusive(ix.id(), b"alpha").unwrap();
    txn.lock_exclusive(ix.id(), b"beta").unwrap();

    assert_eq!(txn.last_locked_index().unwrap(), ix.id());
    assert_eq!(
        txn.last_locked_key().unwrap().as_deref(),
        Some(&b"beta"[..])
    );

    txn.unlock().unwrap();
    assert_eq!(
        txn.last_locked_key().unwrap().as_deref(),
        Some(&b"alpha"[..])
    );
    txn.reset().unwrap();
    assert!(matches!(
        txn.last_locked_key(),
        Err(BurrowError::IllegalState("no locks held"))
    ));
}

#[test]
fn pending_commit_releases_locks_after_durability() {
    let redo = MemRedoLog::new();
    let db = Database::open(
        DatabaseConfig::new().redo_log(Arc::clone(&redo) as Arc<dyn RedoLog>),
    );
    let ix = db.open_index("test").unwrap();

    let txn = db.new_transaction();
    ix.store(Some(&txn), b"k", Some(&b"v"[..])).unwrap();
    let pending = txn.commit_pending().unwrap();
    assert_eq!(pending.lock_count(), 1);

    // Until the redo record is durable, the exclusive lock stays held.
    let probe = db.new_transaction();
    probe.set_lock_timeout(Duration::ZERO);
    let err = probe.lock_exclusive(ix.id(), b"k").unwrap_err();
    assert!(matches!(err, BurrowError::LockTimeout { .. }));

    redo.make_durable(pending.log_position());
    pending.wait_and_finish().unwrap();

    assert_eq!(
        probe.lock_exclusive(ix.id(), b"k").unwrap(),
        LockResult::Acquired
    );
    probe.reset().unwrap();
    assert_eq!(ix.load(None, b"k").unwrap().as_deref(), Some(&b"v"[..]));
}

#[test]
fn lock_timeout_surfaces_owner_attachment() {
    let db = Database::open_default();
    let ix = db.open_index("test").unwrap();

    let holder = db.new_transaction();
    holder.attach(Some(burrow_error::OwnerAttachment::new("batch-loader")));
    holder.lock_exclusive(ix.id(), b"k").unwrap();

    let blocked = db.new_transaction();
    blocked.set_lock_timeout(Duration::from_millis(50));
    let err = blocked.lock_exclusive(ix.id(), b"k").unwrap_err();
    match err {
        BurrowError::LockTimeout {
            owner_attachment: Some(att),
            ..
        } => {
            assert_eq!(att.downcast_ref::<&str>(), Some(&"batch-loader"));
        }
        other => panic!("expected a timeout carrying the owner attachment, got {other:?}"),
    }
    holder.reset().unwrap();
}

#[test]
fn read_committed_releases_read_locks() {
    let db = Database::open_default();
    let ix = db.open_index("test").unwrap();
    ix.store(None, b"k", Some(&b"v"[..])).unwrap();

    let txn = db.new_transaction();
    txn.set_lock_mode(burrow_core::LockMode::ReadCommitted);
    assert_eq!(ix.load(Some(&txn), b"k").unwrap().as_deref(), Some(&b"v"[..]));
    assert_eq!(txn.held_lock_count(), 0);
    assert_eq!(txn.lock_check(ix.id(), b"k"), LockResult::Unowned);

    txn.set_lock_mode(burrow_core::LockMode::UpgradableRead);
    ix.load(Some(&txn), b"k").unwrap();
    assert_eq!(txn.lock_check(ix.id(), b"k"), LockResult::OwnedUpgradable);
    txn.reset().unwrap();
}
