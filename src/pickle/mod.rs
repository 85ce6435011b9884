//! Pickle codec for the archive index.
//!
//! The index the external ecosystem ships is a pickled mapping of path →
//! segment tuples.  [`read`] decodes protocols 0–5 into the [`Value`]
//! lattice; [`write`] emits protocols 2 and 4, which is all any archive
//! family ever carries.

pub mod read;
pub mod value;
pub mod write;

pub use read::{loads, HIGHEST_PROTOCOL};
pub use value::Value;
pub use write::dumps;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PickleError {
    #[error("truncated stream")]
    Truncated,
    #[error("unknown opcode 0x{0:02x} at offset {1}")]
    UnknownOpcode(u8, u64),
    #[error("stack underflow at offset {0}")]
    StackUnderflow(u64),
    #[error("no open mark at offset {0}")]
    NoMark(u64),
    #[error("memo slot {0} read before it was written")]
    MemoMissing(u32),
    #[error("malformed {what} argument: {detail}")]
    BadArgument { what: &'static str, detail: String },
    #[error("{0} applied to a wrong-typed stack entry")]
    TypeMismatch(&'static str),
    #[error("integer outside the 64-bit range")]
    IntRange,
    #[error("invalid utf-8 in unicode string")]
    BadUtf8,
    #[error("unsupported pickle feature: {0}")]
    Unsupported(String),
}
