//! Cross-cutting identifier and payload types for the burrow engine.
//!
//! This crate is intentionally small: it defines the identifier newtypes,
//! the byte-encoding helpers shared by the persisted trash-key format, and
//! the tri-state value payload used by cursors and triggers. Runtime
//! machinery (lock tables, transactions) lives in the crates built on top.

pub mod encoding;
pub mod ids;
pub mod value;

pub use encoding::{
    decode_reverse_var, decode_unsigned_var, encode_reverse_var, encode_unsigned_var,
    next_reverse_var, read_u64_be, write_u64_be,
};
pub use ids::{IndexId, InvalidTxnId, TxnId, TxnIdAllocator};
pub use value::{ValueRef, ValueState};
