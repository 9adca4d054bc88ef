//! Want request parsing (provider side).

use crate::capabilities::{extract_want_line_capabilities, trim_newline, CapabilitySet};
use crate::fetch::check_wants;
use crate::pktline::PktLineReader;
use crate::shallow::ShallowCommand;
use crate::{Result, WireError};
use parley_types::{ObjectId, Refs};
use std::collections::BTreeSet;
use std::io::Read;

/// The first section of an upload request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WantRequest {
    /// Requested commits, in the order received.
    pub wants: Vec<ObjectId>,
    /// Capabilities from the first want line.
    pub capabilities: CapabilitySet,
    /// Boundaries the requester already has.
    pub client_shallow: BTreeSet<ObjectId>,
    /// Requested depth.
    pub depth: Option<u32>,
}

/// Reads want, shallow and deepen lines up to the closing flush.
///
/// Every want must be among the `advertised` refs.
pub fn read_want_request<R: Read>(
    reader: &mut PktLineReader<R>,
    advertised: &Refs,
) -> Result<WantRequest> {
    let mut request = WantRequest::default();

    for line in reader.read_seq() {
        let line = line?;
        let line = trim_newline(&line);

        if line.starts_with(b"want ") {
            let want = if request.wants.is_empty() {
                let (want, caps) = extract_want_line_capabilities(line)?;
                request.capabilities = caps;
                want
            } else {
                line
            };
            let id = ObjectId::from_hex_bytes(&want[b"want ".len()..])?;
            request.wants.push(id);
            continue;
        }

        match ShallowCommand::parse(line)? {
            ShallowCommand::Shallow(id) => {
                request.client_shallow.insert(id);
            }
            ShallowCommand::Deepen(depth) => request.depth = Some(depth),
            ShallowCommand::Unshallow(_) => {
                return Err(WireError::protocol("unshallow in a want request"));
            }
        }
    }

    check_wants(&request.wants, advertised)?;
    tracing::debug!(
        wants = request.wants.len(),
        capabilities = %request.capabilities,
        depth = ?request.depth,
        "read want request"
    );
    Ok(request)
}
