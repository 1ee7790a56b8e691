//! Error and Result types for Tally store operations.

use crate::store::slot::ValueKind;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for Tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;

/// The error type for counter store and WAL operations.
#[derive(Debug, Error)]
pub enum TallyError {
    /// Slot count is not a power of two, so the hash reduction cannot be a bitmask.
    #[error("Slot count must be a power of two, got {0}")]
    InvalidSlotCount(u64),

    /// A key's established value type does not match the incoming operation's type.
    #[error("Type conflict on key {key}: slot holds {stored:?}, operation supplied {supplied:?}")]
    TypeConflict {
        /// The key whose slot was touched.
        key: String,
        /// Value type pinned by the slot's first write.
        stored: ValueKind,
        /// Value type supplied by the failing operation.
        supplied: ValueKind,
    },

    /// A merge target's stored source set no longer matches the requested one.
    #[error("Merge source set for {0} does not match its stored descriptor")]
    DescriptorDrift(String),

    /// Merge was called with no source keys.
    #[error("Merge target {0} has an empty source set")]
    EmptySourceSet(String),

    /// Merge was called with an empty-string source key.
    #[error("Merge target {0} has an empty-string source key")]
    EmptySourceKey(String),

    /// Integer merge recomputation divided by a zero-valued source.
    #[error("Merge target {0} divided by a zero-valued source")]
    DivisionByZero(String),

    /// A slot's type tag byte is not a known value type.
    #[error("Unknown value type tag: {0}")]
    UnknownTypeTag(u8),

    /// A merge descriptor's operator field is not a known operator.
    #[error("Unknown merge operator: {0}")]
    UnknownMergeOp(u64),

    /// Invalid magic bytes at a WAL frame boundary.
    #[error("Invalid WAL magic: expected TWAL, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// A WAL payload decoded from a CRC-valid frame is structurally invalid.
    #[error("Malformed WAL record: {0}")]
    MalformedRecord(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
