//! Negotiation configuration.

use crate::capabilities::{self, Capability, CapabilitySet, Role, AGENT};
use crate::pktline::{BufferedPktLineWriter, DEFAULT_WRITE_BUFFER};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Settings shared by every negotiation a process runs.
///
/// Built once and passed by reference into the negotiators.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Agent string announced as `agent=<value>`.
    pub agent: String,
    /// Capabilities supported when fetching.
    pub fetch_capabilities: Vec<String>,
    /// Capabilities supported when pushing.
    pub push_capabilities: Vec<String>,
    /// Byte budget of the batching pkt-line writer.
    pub write_buffer_size: usize,
    /// Stateless transport (smart HTTP): every request ends with a flush.
    pub stateless: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            agent: format!("parley/{}", env!("CARGO_PKG_VERSION")),
            fetch_capabilities: [
                capabilities::MULTI_ACK,
                capabilities::MULTI_ACK_DETAILED,
                capabilities::NO_DONE,
                capabilities::SIDE_BAND_64K,
                capabilities::SIDE_BAND,
                capabilities::OFS_DELTA,
                capabilities::THIN_PACK,
                capabilities::SHALLOW,
                capabilities::INCLUDE_TAG,
                capabilities::NO_PROGRESS,
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            push_capabilities: [
                capabilities::REPORT_STATUS,
                capabilities::DELETE_REFS,
                capabilities::SIDE_BAND_64K,
                capabilities::OFS_DELTA,
                capabilities::QUIET,
                capabilities::ATOMIC,
                capabilities::PUSH_OPTIONS,
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            write_buffer_size: DEFAULT_WRITE_BUFFER,
            stateless: false,
        }
    }
}

impl NegotiationConfig {
    /// Locally supported capabilities for a role, including the agent token.
    pub fn local_set(&self, role: Role) -> Result<CapabilitySet> {
        let names = match role {
            Role::Fetch => &self.fetch_capabilities,
            Role::Push => &self.push_capabilities,
        };
        let mut set = names
            .iter()
            .map(|name| Capability::parse(name))
            .collect::<Result<CapabilitySet>>()?;
        set.insert(Capability::with_value(AGENT, self.agent.clone()));
        Ok(set)
    }

    /// Shorthand for `local_set(Role::Fetch)`.
    pub fn fetch_set(&self) -> Result<CapabilitySet> {
        self.local_set(Role::Fetch)
    }

    /// Shorthand for `local_set(Role::Push)`.
    pub fn push_set(&self) -> Result<CapabilitySet> {
        self.local_set(Role::Push)
    }

    /// Wraps a transport in a batching writer sized by `write_buffer_size`.
    pub fn writer<W: Write>(&self, inner: W) -> BufferedPktLineWriter<W> {
        BufferedPktLineWriter::with_budget(inner, self.write_buffer_size)
    }
}
