//! Crate-level error surface.
//!
//! Each leaf module keeps its own small error enum; this module folds them
//! into [`ArchiveError`], which is what every public operation returns.

use thiserror::Error;

use crate::codec::CodecError;
use crate::header::HeaderError;
use crate::index::IndexError;
use crate::pickle::PickleError;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad header: {0}")]
    BadHeader(#[from] HeaderError),

    #[error("bad pickle: {0}")]
    BadPickle(PickleError),

    #[error("bad index: {0}")]
    BadIndex(IndexError),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("not found in archive: {0}")]
    NotFound(String),

    #[error("refusing unsafe member path: {0}")]
    UnsafePath(String),

    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("no input files")]
    EmptyInput,

    #[error(transparent)]
    Decompile(#[from] DecompileError),
}

/// Failure reported by the external script decompiler collaborator.
///
/// `extract_all` counts these per member and keeps going; every other
/// error kind aborts the operation that raised it.
#[derive(Error, Debug)]
#[error("decompile failed: {0}")]
pub struct DecompileError(pub String);

impl From<PickleError> for ArchiveError {
    fn from(e: PickleError) -> Self {
        match e {
            PickleError::Unsupported(what) => ArchiveError::Unsupported(what),
            other => ArchiveError::BadPickle(other),
        }
    }
}

impl From<IndexError> for ArchiveError {
    fn from(e: IndexError) -> Self {
        match e {
            // Pickle-level failures keep their own kind so callers can tell
            // a malformed serialization from a malformed index shape.
            IndexError::Pickle(inner) => ArchiveError::from(inner),
            other => ArchiveError::BadIndex(other),
        }
    }
}

impl From<CodecError> for ArchiveError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => ArchiveError::Io(io),
            other => ArchiveError::BadIndex(IndexError::Codec(other)),
        }
    }
}
