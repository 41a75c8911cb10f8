//! Per-transaction undo records and rollback replay.

use burrow_error::Result;
use burrow_types::{IndexId, TxnId};

use crate::db::DbInner;
use crate::store::ValueRepr;

/// One undo step. Records are replayed newest-first on rollback.
#[derive(Debug, Clone)]
pub(crate) enum UndoRecord {
    /// Restore a key to its previous (inline or absent) value.
    Store {
        index_id: IndexId,
        key: Vec<u8>,
        old: Option<ValueRepr>,
    },
    /// Rolling back: read the trash record and reinsert the fragmented
    /// value under the original key. Rolling forward (commit) instead
    /// deletes the trash record. The payload carries the original key and
    /// the trash-key suffix; the index id travels in this header.
    ReclaimFragmented { index_id: IndexId, payload: Vec<u8> },
}

/// Replay `records` (stack order: newest last) in reverse.
pub(crate) fn replay(db: &DbInner, txn_id: TxnId, records: Vec<UndoRecord>) -> Result<()> {
    for record in records.into_iter().rev() {
        match record {
            UndoRecord::Store { index_id, key, old } => {
                let core = db.index_core(index_id)?;
                // An uncommitted fragmented replacement is discarded along
                // with its fragments.
                if let Some(ValueRepr::Fragmented(descriptor)) = core.store.get(&key)? {
                    db.fragments.delete_fragments(&descriptor)?;
                }
                match old {
                    Some(repr) => core.store.put(&key, repr)?,
                    None => {
                        core.store.delete(&key)?;
                    }
                }
            }
            UndoRecord::ReclaimFragmented { index_id, payload } => {
                let core = db.index_core(index_id)?;
                db.trash.remove(txn_id, &core.store, &payload)?;
            }
        }
    }
    Ok(())
}
