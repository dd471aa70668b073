//! Error types for isocast shared types.

use thiserror::Error;

/// Errors raised while decoding or building advertising data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdvDataError {
    /// An AD structure claims more bytes than the report carries.
    #[error("truncated AD structure at offset {offset}: declared {declared} bytes, {available} available")]
    Truncated {
        /// Offset of the structure's length byte.
        offset: usize,
        /// Length declared by the structure.
        declared: usize,
        /// Bytes left in the report after the length byte.
        available: usize,
    },

    /// A local name does not fit into a single AD structure.
    #[error("local name too long: {len} bytes (max {max})")]
    NameTooLong {
        /// Actual name length.
        len: usize,
        /// Maximum encodable length.
        max: usize,
    },
}
