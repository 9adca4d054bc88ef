//! Type conversion errors.

use thiserror::Error;

/// Errors that can occur while building Parley types from wire data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypesError {
    /// The identifier does not have 40 hex characters (or 20 raw bytes).
    #[error("invalid object id length: {0}")]
    InvalidLength(usize),

    /// The identifier contains non-hex characters.
    #[error("invalid object id: {0}")]
    InvalidHex(String),
}
