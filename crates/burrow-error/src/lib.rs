use std::sync::Arc;
use std::time::Duration;

use burrow_types::IndexId;
use thiserror::Error;

/// The cycle of `(index_id, key)` pairs witnessed when a deadlock is
/// reported. Keys are cloned out of the lock records; a lock created
/// without a key records `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockSet {
    entries: Vec<(IndexId, Option<Vec<u8>>)>,
}

impl DeadlockSet {
    /// Build a set from cycle entries.
    #[must_use]
    pub fn new(entries: Vec<(IndexId, Option<Vec<u8>>)>) -> Self {
        Self { entries }
    }

    /// Number of locks on the cycle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cycle is empty (never true for a reported deadlock).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate the `(index_id, key)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = &(IndexId, Option<Vec<u8>>)> {
        self.entries.iter()
    }

    /// Whether the cycle contains a lock on `(index_id, key)`.
    #[must_use]
    pub fn contains(&self, index_id: IndexId, key: &[u8]) -> bool {
        self.entries
            .iter()
            .any(|(id, k)| *id == index_id && k.as_deref() == Some(key))
    }
}

/// Opaque attachment of a lock owner, surfaced on timeout so the blocked
/// caller can identify who is in the way.
#[derive(Clone)]
pub struct OwnerAttachment(Arc<dyn std::any::Any + Send + Sync>);

impl OwnerAttachment {
    /// Wrap an arbitrary value.
    pub fn new<T: std::any::Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the attachment as `T`, if that is what it holds.
    #[must_use]
    pub fn downcast_ref<T: std::any::Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl std::fmt::Debug for OwnerAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OwnerAttachment(..)")
    }
}

/// Primary error type for burrow operations.
///
/// Structured variants for the recoverable cases, terse `IllegalState`
/// messages for programmer bugs.
#[derive(Error, Debug)]
pub enum BurrowError {
    // === Lock acquisition ===
    /// Lock request waited the full timeout.
    #[error("lock acquisition timed out after {nanos_waited}ns")]
    LockTimeout {
        nanos_waited: u64,
        /// The blocking owner's attachment, when known.
        owner_attachment: Option<OwnerAttachment>,
    },

    /// A shared holder requested an upgradable or exclusive lock.
    #[error("illegal lock upgrade from a shared hold")]
    IllegalUpgrade,

    /// The waiting scope was interrupted.
    #[error("interrupted while waiting for a lock")]
    LockInterrupted,

    /// A lock wait expired and the detector found a cycle.
    #[error("deadlock detected ({} locks on cycle)", set.len())]
    Deadlock {
        set: DeadlockSet,
        /// Whether the waiting scope itself closes the cycle.
        guilty: bool,
        nanos_waited: u64,
    },

    /// Generic lock failure (unowned downgrade, closed manager).
    #[error("lock operation failed: {0}")]
    LockFailure(&'static str),

    // === API misuse ===
    /// Programmer bug: empty stack, scope-boundary crossing, combining an
    /// acquire with an upgrade, removing an unknown trigger handle.
    #[error("{0}")]
    IllegalState(&'static str),

    // === Transaction state ===
    /// The transaction failed mid-protocol and must be reset before reuse.
    #[error("transaction is borked: {reason}")]
    Borked { reason: String },

    /// A value-length operation exceeded the representable maximum.
    #[error("value length {length} exceeds the maximum")]
    LargeValue { length: u64 },

    // === Collaborator seams ===
    /// I/O error from a backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A trash or undo record failed to parse.
    #[error("corrupt record: {detail}")]
    CorruptRecord { detail: String },
}

impl BurrowError {
    /// Whether retrying the operation (typically after backing off or
    /// rolling back one participant) may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::Deadlock { .. } | Self::LockInterrupted
        )
    }

    /// Whether this indicates API misuse rather than a runtime condition.
    #[must_use]
    pub fn is_usage_bug(&self) -> bool {
        matches!(self, Self::IllegalState(_) | Self::IllegalUpgrade)
    }

    /// Human-friendly suggestion for recovering from this error.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::LockTimeout { .. } => Some("retry after the blocking transaction finishes"),
            Self::Deadlock { .. } => Some("roll back this transaction and retry it"),
            Self::Borked { .. } => Some("reset the transaction before using it again"),
            _ => None,
        }
    }

    /// Create a timeout error from a waited duration.
    #[must_use]
    pub fn timeout(waited: Duration, owner_attachment: Option<OwnerAttachment>) -> Self {
        Self::LockTimeout {
            nanos_waited: u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX),
            owner_attachment,
        }
    }

    /// Create a borked-transaction error.
    pub fn borked(reason: impl Into<String>) -> Self {
        Self::Borked {
            reason: reason.into(),
        }
    }

    /// Create a corrupt-record error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::CorruptRecord {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `BurrowError`.
pub type Result<T> = std::result::Result<T, BurrowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        let err = BurrowError::IllegalState("no locks held");
        assert_eq!(err.to_string(), "no locks held");

        let err = BurrowError::LargeValue { length: 1 << 40 };
        assert!(err.to_string().contains("exceeds the maximum"));

        let err = BurrowError::borked("trash write failed");
        assert_eq!(err.to_string(), "transaction is borked: trash write failed");
    }

    #[test]
    fn classification() {
        assert!(BurrowError::timeout(Duration::from_millis(5), None).is_transient());
        assert!(BurrowError::IllegalUpgrade.is_usage_bug());
        assert!(!BurrowError::IllegalUpgrade.is_transient());
        assert!(BurrowError::borked("x").suggestion().is_some());
    }

    #[test]
    fn deadlock_set_contains() {
        let ix = IndexId::new(3);
        let set = DeadlockSet::new(vec![
            (ix, Some(b"k1".to_vec())),
            (ix, Some(b"k2".to_vec())),
        ]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(ix, b"k1"));
        assert!(set.contains(ix, b"k2"));
        assert!(!set.contains(ix, b"k3"));

        let err = BurrowError::Deadlock {
            set,
            guilty: true,
            nanos_waited: 1_000,
        };
        assert!(err.to_string().contains("2 locks"));
    }
}
