//! Lock acquisition results.

/// Result of a lock acquisition or ownership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResult {
    /// Lock was freshly acquired in the requested mode.
    Acquired,
    /// An owned upgradable (or lenient shared) hold was upgraded to exclusive.
    Upgraded,
    /// Already owned shared; no extra unlock should be performed.
    OwnedShared,
    /// Already owned upgradable; no extra unlock should be performed.
    OwnedUpgradable,
    /// Already owned exclusive; no extra unlock should be performed.
    OwnedExclusive,
    /// Not owned at all (ownership checks only).
    Unowned,
    /// The wait expired before the lock became available.
    TimedOutLock,
    /// A shared holder requested upgradable or exclusive, which the upgrade
    /// rule forbids.
    Illegal,
    /// The waiting scope was interrupted.
    Interrupted,
}

impl LockResult {
    /// Whether the lock is held after this result (fresh or already owned).
    #[must_use]
    pub fn is_held(self) -> bool {
        matches!(
            self,
            Self::Acquired
                | Self::Upgraded
                | Self::OwnedShared
                | Self::OwnedUpgradable
                | Self::OwnedExclusive
        )
    }

    /// Whether the lock was already owned before the request.
    #[must_use]
    pub fn is_already_owned(self) -> bool {
        matches!(
            self,
            Self::OwnedShared | Self::OwnedUpgradable | Self::OwnedExclusive
        )
    }

    /// Whether the request expired.
    #[must_use]
    pub fn is_timed_out(self) -> bool {
        self == Self::TimedOutLock
    }
}

/// Requested lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared: compatible with other shared and one upgradable holder.
    Shared,
    /// Upgradable: shared-compatible, reserves the right to upgrade.
    Upgradable,
    /// Exclusive: no other holders.
    Exclusive,
}

/// Policy for upgrade attempts by a holder of only a shared lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LockUpgradeRule {
    /// Shared to upgradable/exclusive is always illegal.
    #[default]
    Strict,
    /// Permitted only when the requester is the sole shared holder.
    Lenient,
    /// Always attempted; deadlock-prone and detector-reliant.
    Unchecked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_predicate() {
        assert!(LockResult::Acquired.is_held());
        assert!(LockResult::Upgraded.is_held());
        assert!(LockResult::OwnedExclusive.is_held());
        assert!(!LockResult::Unowned.is_held());
        assert!(!LockResult::TimedOutLock.is_held());
        assert!(!LockResult::Illegal.is_held());
        assert!(!LockResult::Interrupted.is_held());
    }

    #[test]
    fn already_owned_predicate() {
        assert!(LockResult::OwnedShared.is_already_owned());
        assert!(!LockResult::Acquired.is_already_owned());
        assert!(!LockResult::Upgraded.is_already_owned());
    }
}
