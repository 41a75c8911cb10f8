//! Shared observer used by the trigger suites.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use burrow_core::{Cursor, Trigger};
use burrow_error::Result;
use burrow_types::ValueRef;

pub struct Observed {
    pub key: Vec<u8>,
    pub old: Option<Vec<u8>>,
    pub new: Option<Vec<u8>>,
}

/// Records every firing: key, original value (loaded lazily when needed),
/// and incoming value. A shared counter establishes relative fire order
/// between observers.
pub struct Observer {
    pub observed: Mutex<Vec<Observed>>,
    pub txn_id: Mutex<Option<u64>>,
    pub local_counter: AtomicUsize,
    order: Arc<AtomicUsize>,
}

impl Observer {
    pub fn new(order: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            observed: Mutex::new(Vec::new()),
            txn_id: Mutex::new(None),
            local_counter: AtomicUsize::new(0),
            order,
        })
    }

    pub fn standalone() -> Arc<Self> {
        Self::new(Arc::new(AtomicUsize::new(0)))
    }

    pub fn fire_count(&self) -> usize {
        self.observed.lock().unwrap().len()
    }

    pub fn verify_one_and_clear(&self, key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>) {
        let mut observed = self.observed.lock().unwrap();
        assert_eq!(observed.len(), 1, "expected exactly one firing");
        let obs = observed.remove(0);
        assert_eq!(obs.key, key);
        assert_eq!(obs.old.as_deref(), old);
        assert_eq!(obs.new.as_deref(), new);
        *self.txn_id.lock().unwrap() = None;
    }
}

impl Trigger for Observer {
    fn store(&self, cursor: &mut Cursor, value: ValueRef<'_>) -> Result<()> {
        self.local_counter
            .store(self.order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
        *self.txn_id.lock().unwrap() = cursor.link().and_then(|t| t.id()).map(|id| id.get());

        let key = cursor.key().expect("cursor is positioned").to_vec();
        let mut old = cursor.value().as_bytes().map(<[u8]>::to_vec);
        if matches!(cursor.value(), ValueRef::NotLoaded) {
            cursor.load()?;
            old = cursor.value().as_bytes().map(<[u8]>::to_vec);
        }
        let new = value.as_bytes().map(<[u8]>::to_vec);

        self.observed.lock().unwrap().push(Observed { key, old, new });
        Ok(())
    }
}
