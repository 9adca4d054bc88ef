//! Git transfer negotiation error types.

use parley_types::{ObjectId, TypesError};
use thiserror::Error;

/// Errors that can occur during a negotiation.
///
/// Every variant aborts the whole exchange: once one frame is misparsed the
/// frame boundaries that follow cannot be trusted. Per-ref push rejections are
/// not errors; they are reported through [`crate::RefStatus`].
#[derive(Debug, Error)]
pub enum WireError {
    /// The transport closed without a clean flush.
    #[error("the remote end hung up unexpectedly")]
    Hangup,

    /// Invalid pkt-line format.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The requester asked for objects the provider never advertised.
    #[error("requested objects were not advertised: {0:?}")]
    InvalidWants(Vec<ObjectId>),

    /// The peer reported a fatal error (`ERR` line or sideband channel 3).
    #[error("remote error: {0}")]
    Remote(String),

    /// The peer failed to unpack the pushed objects.
    #[error("remote failed to unpack: {0}")]
    UnpackFailed(String),

    /// Malformed object identifier on the wire.
    #[error("invalid object id: {0}")]
    Types(#[from] TypesError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Shorthand for building a [`WireError::Protocol`].
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Returns true when the transport went away rather than misbehaving.
    pub fn is_hangup(&self) -> bool {
        matches!(self, Self::Hangup)
    }
}
