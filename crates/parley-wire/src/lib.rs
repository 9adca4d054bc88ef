//! Git transfer negotiation for Parley.
//!
//! This crate implements the negotiation half of the git smart protocol
//! (v0/v1): pkt-line framing, capability negotiation, sideband multiplexing,
//! the want/have exchange with its three acknowledgment styles, shallow
//! negotiation and the push command/report-status protocol.
//!
//! Object storage, ref storage and pack encoding stay outside: they are
//! reached through [`GraphWalker`], [`CommitGraph`] and [`PackSource`].

mod ack;
mod capabilities;
mod config;
mod error;
mod fetch;
mod pktline;
mod push;
mod report;
mod shallow;
mod sideband;
mod want;

pub use ack::{
    ack_strategy, exchange_haves, AckLine, AckStatus, AckStrategy, HaveExchange, MultiAck,
    MultiAckDetailed, ProtocolWalker, SingleAck, WantsSatisfied,
};
pub use capabilities::{
    extract_want_line_capabilities, negotiate, read_advertisement, split_capabilities,
    write_advertisement, AckStyle, Advertisement, Capability, CapabilitySet, Negotiated, Role,
};
pub use config::NegotiationConfig;
pub use error::WireError;
pub use fetch::{check_wants, CanRead, FetchNegotiator, FetchOutcome, FetchState, GraphWalker};
pub use pktline::{
    BufferedPktLineWriter, PktLine, PktLineParser, PktLineReader, PktLineSeq, PktLineWriter,
    WritePkt, DEFAULT_WRITE_BUFFER, MAX_PKT_DATA_LEN, MAX_PKT_LEN,
};
pub use push::{
    read_update_commands, PackSource, PushNegotiator, PushOutcome, RefUpdate, UpdateRequest,
    DELETE_UNSUPPORTED,
};
pub use report::{write_report_status, RefStatus, ReportStatusParser};
pub use shallow::{
    find_shallow, handle_shallow_request, read_shallow_updates, CommitGraph, ShallowBoundary,
    ShallowCommand, ShallowUpdate, INFINITE_DEPTH,
};
pub use sideband::{
    demultiplex, Channel, SidebandHandlers, SidebandMode, SidebandWriter, BASIC_SIDEBAND_DATA,
    LARGE_SIDEBAND_DATA,
};
pub use want::{read_want_request, WantRequest};

/// Capability names.
pub mod caps {
    pub use crate::capabilities::{
        AGENT, ALLOW_REACHABLE_SHA1_IN_WANT, ALLOW_TIP_SHA1_IN_WANT, ATOMIC, DEEPEN_NOT,
        DEEPEN_RELATIVE, DEEPEN_SINCE, DELETE_REFS, INCLUDE_TAG, MULTI_ACK, MULTI_ACK_DETAILED,
        NO_DONE, NO_PROGRESS, OFS_DELTA, PUSH_OPTIONS, QUIET, REPORT_STATUS, SHALLOW, SIDE_BAND,
        SIDE_BAND_64K, SYMREF, THIN_PACK,
    };
}

pub use parley_types::{ObjectId, Refs, ZERO_ID};

/// Result type for negotiation operations.
pub type Result<T> = std::result::Result<T, WireError>;
