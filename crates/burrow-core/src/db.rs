//! Engine facade: index registry, transaction service, trash, collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use burrow_error::{BurrowError, Result};
use burrow_lock::{LockManager, LockUpgradeRule, NanosTimeout, DEFAULT_LOCK_TABLE_SHARDS};
use burrow_types::{IndexId, TxnIdAllocator};

use crate::index::{Index, IndexCore};
use crate::redo::{MemRedoLog, RedoLog};
use crate::store::{FragmentStore, MemFragmentStore, MemStore, OrderedStore};
use crate::trash::FragmentedTrash;
use crate::trigger::TriggerList;
use crate::txn::Transaction;

/// Default inline-value ceiling; values at or above it are fragmented.
pub const DEFAULT_FRAGMENT_THRESHOLD: usize = 1024;

/// Default lock timeout (matches a cautious interactive setting).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// DatabaseConfig
// ---------------------------------------------------------------------------

/// Builder-style engine configuration.
pub struct DatabaseConfig {
    shard_count: usize,
    upgrade_rule: LockUpgradeRule,
    lock_timeout_nanos: NanosTimeout,
    fragment_threshold: usize,
    redo: Option<Arc<dyn RedoLog>>,
    trash_store: Option<Arc<dyn OrderedStore>>,
}

impl DatabaseConfig {
    /// Start from defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shard_count: DEFAULT_LOCK_TABLE_SHARDS,
            upgrade_rule: LockUpgradeRule::default(),
            lock_timeout_nanos: duration_to_nanos(DEFAULT_LOCK_TIMEOUT),
            fragment_threshold: DEFAULT_FRAGMENT_THRESHOLD,
            redo: None,
            trash_store: None,
        }
    }

    /// Number of lock-table shards; rounded up to a power of two and
    /// clamped to at least 1.
    #[must_use]
    pub fn shard_count(mut self, count: usize) -> Self {
        self.shard_count = count.max(1).next_power_of_two();
        self
    }

    /// Lock upgrade rule for shared holders.
    #[must_use]
    pub fn upgrade_rule(mut self, rule: LockUpgradeRule) -> Self {
        self.upgrade_rule = rule;
        self
    }

    /// Default lock timeout for new transactions.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_nanos = duration_to_nanos(timeout);
        self
    }

    /// Inline-value ceiling; clamped to at least 64 bytes so trivial values
    /// never take the fragmented path.
    #[must_use]
    pub fn fragment_threshold(mut self, threshold: usize) -> Self {
        self.fragment_threshold = threshold.max(64);
        self
    }

    /// Replace the redo log collaborator.
    #[must_use]
    pub fn redo_log(mut self, redo: Arc<dyn RedoLog>) -> Self {
        self.redo = Some(redo);
        self
    }

    /// Replace the ordered store backing the hidden trash index.
    #[must_use]
    pub fn trash_store(mut self, store: Arc<dyn OrderedStore>) -> Self {
        self.trash_store = Some(store);
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_to_nanos(d: Duration) -> NanosTimeout {
    NanosTimeout::try_from(d.as_nanos()).unwrap_or(NanosTimeout::MAX)
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

struct Registry {
    by_name: HashMap<String, Arc<IndexCore>>,
    by_id: HashMap<u64, Arc<IndexCore>>,
}

pub(crate) struct DbInner {
    pub(crate) lock_mgr: Arc<LockManager>,
    pub(crate) txn_ids: TxnIdAllocator,
    registry: RwLock<Registry>,
    next_index_id: AtomicU64,
    pub(crate) fragments: Arc<dyn FragmentStore>,
    pub(crate) trash: FragmentedTrash,
    pub(crate) redo: Arc<dyn RedoLog>,
    pub(crate) commit_latch: Arc<RwLock<()>>,
    pub(crate) default_lock_timeout: NanosTimeout,
    pub(crate) fragment_threshold: usize,
}

impl DbInner {
    pub(crate) fn index_core(&self, id: IndexId) -> Result<Arc<IndexCore>> {
        self.registry
            .read()
            .by_id
            .get(&id.get())
            .cloned()
            .ok_or(BurrowError::IllegalState("unknown index id"))
    }
}

/// An embedded transactional key/value engine.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    /// Open an engine with the given configuration.
    #[must_use]
    pub fn open(config: DatabaseConfig) -> Self {
        let fragments: Arc<dyn FragmentStore> = MemFragmentStore::new();
        let commit_latch = Arc::new(RwLock::new(()));
        let trash_store: Arc<dyn OrderedStore> =
            config.trash_store.unwrap_or_else(|| MemStore::new());
        let trash = FragmentedTrash::new(
            trash_store,
            Arc::clone(&fragments),
            Arc::clone(&commit_latch),
        );
        let redo = config.redo.unwrap_or_else(|| {
            let log: Arc<dyn RedoLog> = MemRedoLog::new();
            log
        });

        info!(
            shards = config.shard_count,
            fragment_threshold = config.fragment_threshold,
            "database opened"
        );

        Self {
            inner: Arc::new(DbInner {
                lock_mgr: LockManager::new(config.shard_count, config.upgrade_rule),
                txn_ids: TxnIdAllocator::new(),
                registry: RwLock::new(Registry {
                    by_name: HashMap::new(),
                    by_id: HashMap::new(),
                }),
                next_index_id: AtomicU64::new(1),
                fragments,
                trash,
                redo,
                commit_latch,
                default_lock_timeout: config.lock_timeout_nanos,
                fragment_threshold: config.fragment_threshold,
            }),
        }
    }

    /// Open with defaults.
    #[must_use]
    pub fn open_default() -> Self {
        Self::open(DatabaseConfig::new())
    }

    fn new_core(&self, name: Option<String>) -> Arc<IndexCore> {
        let id = IndexId::new(self.inner.next_index_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(IndexCore {
            id,
            name,
            store: MemStore::new(),
            triggers: Mutex::new(TriggerList::new()),
        })
    }

    /// Open (or create) the named index.
    pub fn open_index(&self, name: &str) -> Result<Index> {
        {
            let registry = self.inner.registry.read();
            if let Some(core) = registry.by_name.get(name) {
                return Ok(Index::new(Arc::clone(core), Arc::clone(&self.inner)));
            }
        }
        let mut registry = self.inner.registry.write();
        if let Some(core) = registry.by_name.get(name) {
            return Ok(Index::new(Arc::clone(core), Arc::clone(&self.inner)));
        }
        let core = self.new_core(Some(name.to_owned()));
        registry.by_name.insert(name.to_owned(), Arc::clone(&core));
        registry.by_id.insert(core.id.get(), Arc::clone(&core));
        info!(index_id = %core.id, name, "index opened");
        Ok(Index::new(core, Arc::clone(&self.inner)))
    }

    /// Create an anonymous temporary index.
    pub fn new_temporary_index(&self) -> Result<Index> {
        let core = self.new_core(None);
        self.inner
            .registry
            .write()
            .by_id
            .insert(core.id.get(), Arc::clone(&core));
        Ok(Index::new(core, Arc::clone(&self.inner)))
    }

    /// Begin a new transaction with the engine defaults.
    #[must_use]
    pub fn new_transaction(&self) -> Transaction {
        Transaction::begin(&self.inner)
    }

    /// Run crash recovery: seed the transaction-id service from the redo
    /// log and drain any trash left by in-flight transactions. Returns
    /// whether any trash was found.
    pub fn recover(&self) -> Result<bool> {
        self.inner.txn_ids.recover_to(self.inner.redo.top_txn_id());
        let found = self.inner.trash.empty_all_trash()?;
        if found {
            info!("recovery drained pending fragmented-value trash");
        }
        Ok(found)
    }

    /// The fragment store collaborator (diagnostics).
    #[must_use]
    pub fn fragment_store(&self) -> Arc<dyn FragmentStore> {
        Arc::clone(&self.inner.fragments)
    }

    /// Number of records currently in the trash index (diagnostics).
    pub fn trash_record_count(&self) -> Result<usize> {
        self.inner.trash.record_count()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("indexes", &self.inner.registry.read().by_id.len())
            .finish_non_exhaustive()
    }
}
