//! Identifier newtypes and the transaction-id service.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a logical key space (an index or a temporary index).
///
/// Pairs `(IndexId, key)` name a lockable resource. The id is opaque to the
/// concurrency core; it is assigned by the index registry and carried in
/// undo headers and deadlock reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct IndexId(u64);

impl IndexId {
    /// Construct from a raw u64.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ix#{}", self.0)
    }
}

/// Monotonically increasing transaction identifier.
///
/// Zero is reserved as the "no transaction" sentinel in persisted formats,
/// so a real id is never zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(NonZeroU64);

impl TxnId {
    /// Construct a `TxnId` from a non-zero raw value.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.get())
    }
}

impl TryFrom<u64> for TxnId {
    type Error = InvalidTxnId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidTxnId { raw: value })
    }
}

/// Error returned when attempting to construct an out-of-domain `TxnId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTxnId {
    raw: u64,
}

impl fmt::Display for InvalidTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid TxnId {} (must be non-zero)", self.raw)
    }
}

impl std::error::Error for InvalidTxnId {}

/// Monotonic transaction-id service.
///
/// Allocation is a CAS loop (never `fetch_add`) so the counter can never
/// wrap through zero unnoticed. Recovery advances the counter past the
/// highest durably-logged id before any new transaction begins.
#[derive(Debug)]
pub struct TxnIdAllocator {
    next: AtomicU64,
}

impl TxnIdAllocator {
    /// Create an allocator whose first issued id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next transaction id.
    pub fn alloc(&self) -> TxnId {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let mut candidate = current;
            if candidate == 0 {
                // Wrapped; skip the reserved zero value.
                candidate = 1;
            }
            match self.next.compare_exchange_weak(
                current,
                candidate.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return TxnId::new(candidate).expect("candidate is non-zero");
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Advance past `highest`, as read from the durable log during recovery.
    ///
    /// Ids at or below `highest` will never be issued again.
    pub fn recover_to(&self, highest: u64) {
        let mut current = self.next.load(Ordering::Relaxed);
        while current <= highest {
            match self.next.compare_exchange_weak(
                current,
                highest + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// The highest id issued so far, or zero if none.
    #[must_use]
    pub fn last_issued(&self) -> u64 {
        self.next.load(Ordering::Acquire).saturating_sub(1)
    }
}

impl Default for TxnIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_id_rejects_zero() {
        assert!(TxnId::new(0).is_none());
        assert!(TxnId::new(1).is_some());
        let err = TxnId::try_from(0).unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }

    #[test]
    fn allocator_is_monotonic() {
        let alloc = TxnIdAllocator::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        let c = alloc.alloc();
        assert!(a.get() < b.get());
        assert!(b.get() < c.get());
    }

    #[test]
    fn allocator_recovers_past_logged_high_water() {
        let alloc = TxnIdAllocator::new();
        alloc.recover_to(41);
        assert_eq!(alloc.alloc().get(), 42);

        // Recovering backwards is a no-op.
        alloc.recover_to(10);
        assert_eq!(alloc.alloc().get(), 43);
    }

    #[test]
    fn display_forms() {
        assert_eq!(IndexId::new(7).to_string(), "ix#7");
        assert_eq!(TxnId::new(9).unwrap().to_string(), "txn#9");
    }
}
