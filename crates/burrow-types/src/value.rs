//! Tri-state value payload.
//!
//! Cursors distinguish "no entry" from "entry exists but the value has not
//! been loaded". Key-only views rely on the distinction: their cursors may
//! prove existence without ever revealing bytes.

/// Owned value state carried by a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueState {
    /// No entry exists at the cursor position.
    Absent,
    /// An entry exists but its value has not been loaded.
    NotLoaded,
    /// The value bytes.
    Loaded(Vec<u8>),
}

impl ValueState {
    /// Whether the state carries loaded bytes.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// Whether an entry exists (loaded or not).
    #[must_use]
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Absent)
    }

    /// Loaded bytes, if any.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Loaded(bytes) => Some(bytes),
            Self::Absent | Self::NotLoaded => None,
        }
    }

    /// Borrowed view of this state.
    #[must_use]
    pub fn as_ref(&self) -> ValueRef<'_> {
        match self {
            Self::Absent => ValueRef::Absent,
            Self::NotLoaded => ValueRef::NotLoaded,
            Self::Loaded(bytes) => ValueRef::Loaded(bytes),
        }
    }
}

/// Borrowed value state, used as the trigger `value` argument.
///
/// `Absent` plays the role of "null" for deletes; `NotLoaded` is the lazy
/// sentinel an observer may resolve with `Cursor::load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef<'a> {
    /// No value (a delete, or no entry).
    Absent,
    /// A value exists but its bytes are withheld or not yet loaded.
    NotLoaded,
    /// The value bytes.
    Loaded(&'a [u8]),
}

impl<'a> ValueRef<'a> {
    /// Loaded bytes, if any.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Self::Loaded(bytes) => Some(bytes),
            Self::Absent | Self::NotLoaded => None,
        }
    }

    /// Whether this is the `Absent` ("null") state.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Convert to an owned state.
    #[must_use]
    pub fn to_owned_state(&self) -> ValueState {
        match self {
            Self::Absent => ValueState::Absent,
            Self::NotLoaded => ValueState::NotLoaded,
            Self::Loaded(bytes) => ValueState::Loaded(bytes.to_vec()),
        }
    }
}

impl<'a> From<Option<&'a [u8]>> for ValueRef<'a> {
    fn from(opt: Option<&'a [u8]>) -> Self {
        match opt {
            Some(bytes) => Self::Loaded(bytes),
            None => Self::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(!ValueState::Absent.exists());
        assert!(ValueState::NotLoaded.exists());
        assert!(!ValueState::NotLoaded.is_loaded());
        assert_eq!(ValueState::Loaded(b"x".to_vec()).as_bytes(), Some(&b"x"[..]));
        assert!(ValueRef::Absent.is_absent());
        assert_eq!(ValueRef::Loaded(b"y").as_bytes(), Some(&b"y"[..]));
    }

    #[test]
    fn borrow_and_owned_round_trip() {
        let state = ValueState::Loaded(b"abc".to_vec());
        assert_eq!(state.as_ref().to_owned_state(), state);
        assert_eq!(ValueState::NotLoaded.as_ref(), ValueRef::NotLoaded);
    }
}
