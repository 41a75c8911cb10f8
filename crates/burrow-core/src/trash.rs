//! Fragmented-value trash.
//!
//! Replacing or deleting a fragmented value under a transaction first
//! copies its descriptor into a hidden trash index, so rollback always
//! finds a live copy. Trash keys are `txn_id (8 bytes big-endian)` followed
//! by a reverse-varint sequence: the first entry for a transaction is
//! `0xFF` and each subsequent entry sorts strictly before it, so a prefix
//! scan walks entries newest-first.
//!
//! Trash is emptied after transactions commit and during recovery. The
//! trash cursor path takes no locks; callers serialize per transaction.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use burrow_error::{BurrowError, Result};
use burrow_types::{next_reverse_var, write_u64_be, TxnId};

use crate::store::{FragmentStore, OrderedStore, ValueRepr};

/// Longest index key representable in a reclaim payload header.
const MAX_RECLAIM_KEY_LEN: usize = 0x3FFF;

/// Persisted collection of fragmented values pending undo or reclamation.
pub(crate) struct FragmentedTrash {
    store: Arc<dyn OrderedStore>,
    fragments: Arc<dyn FragmentStore>,
    commit_latch: Arc<RwLock<()>>,
}

impl FragmentedTrash {
    pub(crate) fn new(
        store: Arc<dyn OrderedStore>,
        fragments: Arc<dyn FragmentStore>,
        commit_latch: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            store,
            fragments,
            commit_latch,
        }
    }

    /// Copy a fragmented-value descriptor into the trash and return the
    /// undo payload referencing it. The trash record is durable before
    /// this returns, so the undo record always refers to something valid.
    pub(crate) fn add(&self, txn_id: TxnId, key: &[u8], descriptor: &[u8]) -> Result<Vec<u8>> {
        let trash_key = self.prepare_key(txn_id)?;
        self.store
            .put(&trash_key, ValueRepr::Inline(descriptor.to_vec()))?;
        debug!(txn_id = %txn_id, "fragmented value moved to trash");
        encode_reclaim_payload(key, &trash_key[8..])
    }

    /// Next trash key for `txn_id`: start at `0xFF`, otherwise decrement
    /// the most recent entry.
    fn prepare_key(&self, txn_id: TxnId) -> Result<Vec<u8>> {
        let mut prefix = vec![0u8; 8];
        write_u64_be(&mut prefix, 0, txn_id.get());

        let suffix = match self.store.next_key_above(&prefix)? {
            Some(existing) if existing.len() > 8 && existing[..8] == prefix[..] => {
                next_reverse_var(&existing[8..])
                    .ok_or_else(|| BurrowError::corrupt("undecodable trash key suffix"))?
            }
            _ => vec![0xFF],
        };

        let mut trash_key = prefix;
        trash_key.extend_from_slice(&suffix);
        Ok(trash_key)
    }

    /// Undo replay: move an entry out of the trash and back into the index
    /// under its original key.
    pub(crate) fn remove(
        &self,
        txn_id: TxnId,
        index_store: &Arc<dyn OrderedStore>,
        payload: &[u8],
    ) -> Result<()> {
        let (key, suffix) = decode_reclaim_payload(payload)?;

        let mut trash_key = vec![0u8; 8];
        write_u64_be(&mut trash_key, 0, txn_id.get());
        trash_key.extend_from_slice(suffix);

        let descriptor = match self.store.get(&trash_key)? {
            Some(ValueRepr::Inline(d)) => d,
            Some(ValueRepr::Fragmented(_)) => {
                return Err(BurrowError::corrupt("trash record is itself fragmented"));
            }
            None => return Err(BurrowError::corrupt("trash record missing during undo")),
        };
        self.store.delete(&trash_key)?;

        if !index_store.put_if_absent(key, ValueRepr::Fragmented(descriptor.clone()))? {
            // The undo applies to an update: delete the uncommitted value
            // and insert again.
            if let Some(ValueRepr::Fragmented(d)) = index_store.delete(key)? {
                self.fragments.delete_fragments(&d)?;
            }
            index_store.put_if_absent(key, ValueRepr::Fragmented(descriptor))?;
        }
        Ok(())
    }

    /// Non-transactionally delete all trash for a committed transaction,
    /// releasing fragments under the shared commit latch.
    pub(crate) fn empty_trash(&self, txn_id: TxnId) -> Result<()> {
        let mut prefix = vec![0u8; 8];
        write_u64_be(&mut prefix, 0, txn_id.get());

        let mut cursor_key = prefix.clone();
        loop {
            let Some(key) = self.store.next_key_above(&cursor_key)? else {
                break;
            };
            if key.len() < 8 || key[..8] != prefix[..] {
                break;
            }
            if let Some(ValueRepr::Inline(descriptor)) = self.store.get(&key)? {
                let _commit_guard = self.commit_latch.read();
                self.fragments.delete_fragments(&descriptor)?;
                self.store.delete(&key)?;
            } else {
                self.store.delete(&key)?;
            }
            cursor_key = key;
        }
        debug!(txn_id = %txn_id, "transaction trash emptied");
        Ok(())
    }

    /// Recovery: delete all trash from all transactions. Returns whether
    /// any trash was found, which signals in-flight transactions at crash.
    pub(crate) fn empty_all_trash(&self) -> Result<bool> {
        let mut found = false;
        while let Some(key) = self.store.first_key()? {
            found = true;
            if let Some(ValueRepr::Inline(descriptor)) = self.store.get(&key)? {
                let _commit_guard = self.commit_latch.read();
                self.fragments.delete_fragments(&descriptor)?;
                self.store.delete(&key)?;
            } else {
                self.store.delete(&key)?;
            }
        }
        if found {
            info!("trash index emptied during recovery");
        }
        Ok(found)
    }

    pub(crate) fn record_count(&self) -> Result<usize> {
        self.store.len()
    }
}

/// Reclaim payload: a 1-or-2-byte key-length header, the original index
/// key, then the trash-key suffix. Short form covers keys of 1..=64 bytes
/// (`len - 1` in the low 6 bits); the long form sets the high bit and
/// carries 14 bits of length.
pub(crate) fn encode_reclaim_payload(key: &[u8], suffix: &[u8]) -> Result<Vec<u8>> {
    let key_len = key.len();
    if key_len == 0 || key_len > MAX_RECLAIM_KEY_LEN {
        return Err(BurrowError::corrupt("index key length out of payload range"));
    }

    let mut payload = Vec::with_capacity(2 + key_len + suffix.len());
    if key_len <= 64 {
        payload.push((key_len - 1) as u8);
    } else {
        payload.push(0x80 | (key_len >> 8) as u8);
        payload.push(key_len as u8);
    }
    payload.extend_from_slice(key);
    payload.extend_from_slice(suffix);
    Ok(payload)
}

/// Parse a reclaim payload into `(index key, trash-key suffix)`.
pub(crate) fn decode_reclaim_payload(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    let b0 = *payload
        .first()
        .ok_or_else(|| BurrowError::corrupt("empty reclaim payload"))?;

    let (key_len, header_len) = if b0 & 0x80 == 0 {
        ((b0 & 0x3F) as usize + 1, 1)
    } else {
        let b1 = *payload
            .get(1)
            .ok_or_else(|| BurrowError::corrupt("truncated reclaim payload header"))?;
        ((((b0 & 0x3F) as usize) << 8) | b1 as usize, 2)
    };

    let key_end = header_len + key_len;
    if payload.len() < key_end {
        return Err(BurrowError::corrupt("truncated reclaim payload key"));
    }
    Ok((&payload[header_len..key_end], &payload[key_end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemFragmentStore, MemStore};

    fn trash() -> (FragmentedTrash, Arc<MemFragmentStore>) {
        let fragments = MemFragmentStore::new();
        let store: Arc<dyn OrderedStore> = MemStore::new();
        (
            FragmentedTrash::new(
                store,
                Arc::clone(&fragments) as Arc<dyn FragmentStore>,
                Arc::new(RwLock::new(())),
            ),
            fragments,
        )
    }

    fn txn(raw: u64) -> TxnId {
        TxnId::new(raw).unwrap()
    }

    #[test]
    fn payload_round_trip_short_and_long() {
        for key_len in [1usize, 5, 64, 65, 300, MAX_RECLAIM_KEY_LEN] {
            let key = vec![0xAB; key_len];
            let suffix = [0xFE, 0x01];
            let payload = encode_reclaim_payload(&key, &suffix).unwrap();
            let (k, s) = decode_reclaim_payload(&payload).unwrap();
            assert_eq!(k, &key[..], "key_len={key_len}");
            assert_eq!(s, &suffix[..]);
        }
        assert!(encode_reclaim_payload(&[], &[0xFF]).is_err());
        assert!(encode_reclaim_payload(&vec![0; MAX_RECLAIM_KEY_LEN + 1], &[0xFF]).is_err());
    }

    #[test]
    fn first_trash_key_ends_with_ff_and_newer_sorts_first() {
        let (trash, _) = trash();
        let t = txn(9);

        let k1 = trash.prepare_key(t).unwrap();
        assert_eq!(k1[8..], [0xFF]);
        trash.store.put(&k1, ValueRepr::Inline(vec![1])).unwrap();

        let k2 = trash.prepare_key(t).unwrap();
        trash.store.put(&k2, ValueRepr::Inline(vec![2])).unwrap();
        assert!(k2 < k1, "newer trash entries sort first");

        let k3 = trash.prepare_key(t).unwrap();
        assert!(k3 < k2);
    }

    #[test]
    fn remove_restores_into_empty_slot_and_occupied_slot() {
        let (trash, fragments) = trash();
        let t = txn(4);
        let index_store: Arc<dyn OrderedStore> = MemStore::new();

        let descriptor = fragments.insert_fragmented(&[7u8; 2048]).unwrap();
        let payload = trash.add(t, b"big", &descriptor).unwrap();
        assert_eq!(trash.record_count().unwrap(), 1);

        // Destination occupied by an uncommitted intermediate value.
        index_store
            .put(b"big", ValueRepr::Inline(b"uncommitted".to_vec()))
            .unwrap();

        trash.remove(t, &index_store, &payload).unwrap();
        assert_eq!(trash.record_count().unwrap(), 0);
        assert_eq!(
            index_store.get(b"big").unwrap(),
            Some(ValueRepr::Fragmented(descriptor.clone()))
        );

        // And into an empty slot.
        let payload = trash.add(t, b"big", &descriptor).unwrap();
        index_store.delete(b"big").unwrap();
        trash.remove(t, &index_store, &payload).unwrap();
        assert_eq!(
            index_store.get(b"big").unwrap(),
            Some(ValueRepr::Fragmented(descriptor))
        );
    }

    #[test]
    fn empty_trash_releases_fragments_for_one_txn_only() {
        let (trash, fragments) = trash();

        let d1 = fragments.insert_fragmented(&[1u8; 2048]).unwrap();
        let d2 = fragments.insert_fragmented(&[2u8; 2048]).unwrap();
        let d3 = fragments.insert_fragmented(&[3u8; 2048]).unwrap();
        trash.add(txn(1), b"a", &d1).unwrap();
        trash.add(txn(1), b"b", &d2).unwrap();
        trash.add(txn(2), b"c", &d3).unwrap();
        assert_eq!(fragments.live_count(), 3);

        trash.empty_trash(txn(1)).unwrap();
        assert_eq!(trash.record_count().unwrap(), 1);
        assert_eq!(fragments.live_count(), 1);

        // Recovery drains the rest.
        assert!(trash.empty_all_trash().unwrap());
        assert_eq!(trash.record_count().unwrap(), 0);
        assert_eq!(fragments.live_count(), 0);
        assert!(!trash.empty_all_trash().unwrap());
    }
}
