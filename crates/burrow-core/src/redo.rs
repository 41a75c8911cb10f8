//! Redo-log collaborator seam.
//!
//! The core appends commit records and observes a durability watermark; the
//! log writer itself (batching, fsync cadence, replication) lives outside
//! the core. [`MemRedoLog`] is the in-memory reference used by the engine
//! facade; its `make_durable` hook stands in for the external writer
//! advancing the watermark.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use burrow_types::{IndexId, TxnId};

/// Monotonic position in the redo log.
pub type LogPosition = u64;

/// Records appended by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    /// A committed mutation, replayed on recovery.
    Store {
        txn_id: TxnId,
        index_id: IndexId,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    /// Transaction commit marker.
    Commit { txn_id: TxnId },
}

/// Append-only redo log with a durability watermark.
pub trait RedoLog: Send + Sync {
    /// Append a record, returning its position.
    fn append(&self, record: RedoRecord) -> LogPosition;

    /// Highest position known durable.
    fn durable_position(&self) -> LogPosition;

    /// Highest transaction id that appears in the log (zero when none).
    /// Recovery seeds the id allocator from this.
    fn top_txn_id(&self) -> u64;

    /// Block until `pos` is durable.
    fn wait_for_durable(&self, pos: LogPosition);
}

struct MemRedoState {
    records: Vec<RedoRecord>,
    durable: LogPosition,
    top_txn_id: u64,
}

/// In-memory redo log. Positions are record counts; durability advances
/// only through [`MemRedoLog::make_durable`].
pub struct MemRedoLog {
    state: Mutex<MemRedoState>,
    cond: Condvar,
}

impl MemRedoLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemRedoState {
                records: Vec::new(),
                durable: 0,
                top_txn_id: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Advance the durability watermark, waking waiters.
    pub fn make_durable(&self, pos: LogPosition) {
        let mut state = self.state.lock();
        if pos > state.durable {
            state.durable = pos;
            self.cond.notify_all();
        }
    }

    /// Mark everything appended so far durable.
    pub fn make_all_durable(&self) {
        let pos = {
            let state = self.state.lock();
            state.records.len() as LogPosition
        };
        self.make_durable(pos);
    }

    /// Number of appended records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }
}

impl RedoLog for MemRedoLog {
    fn append(&self, record: RedoRecord) -> LogPosition {
        let mut state = self.state.lock();
        let txn_id = match &record {
            RedoRecord::Store { txn_id, .. } | RedoRecord::Commit { txn_id } => txn_id.get(),
        };
        state.top_txn_id = state.top_txn_id.max(txn_id);
        state.records.push(record);
        state.records.len() as LogPosition
    }

    fn durable_position(&self) -> LogPosition {
        self.state.lock().durable
    }

    fn top_txn_id(&self) -> u64 {
        self.state.lock().top_txn_id
    }

    fn wait_for_durable(&self, pos: LogPosition) {
        let mut state = self.state.lock();
        while state.durable < pos {
            self.cond.wait(&mut state);
        }
    }
}
