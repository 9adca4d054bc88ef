//! Shallow (depth-limited) negotiation.
//!
//! The requester announces the commits it already has as boundaries
//! (`shallow <id>`) and the depth it wants (`deepen <n>`). The provider answers
//! with the commits that become new boundaries and the ones that stop being
//! boundaries (`unshallow <id>`).

use crate::capabilities::trim_newline;
use crate::pktline::{PktLineReader, WritePkt};
use crate::{Result, WireError};
use parley_types::ObjectId;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::io::Read;

/// Depth requested by `--unshallow`-style fetches: the whole history.
pub const INFINITE_DEPTH: u32 = 0x7fff_ffff;

/// A single line of the shallow sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShallowCommand {
    /// `shallow <id>`
    Shallow(ObjectId),
    /// `unshallow <id>`
    Unshallow(ObjectId),
    /// `deepen <n>`
    Deepen(u32),
}

impl ShallowCommand {
    /// Parses a line, with or without its trailing newline.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let line = trim_newline(line);
        if let Some(id) = line.strip_prefix(b"shallow ") {
            Ok(Self::Shallow(ObjectId::from_hex_bytes(id)?))
        } else if let Some(id) = line.strip_prefix(b"unshallow ") {
            Ok(Self::Unshallow(ObjectId::from_hex_bytes(id)?))
        } else if let Some(depth) = line.strip_prefix(b"deepen ") {
            let depth = std::str::from_utf8(depth)
                .ok()
                .and_then(|d| d.parse::<u32>().ok())
                .ok_or_else(|| {
                    WireError::protocol(format!(
                        "invalid deepen value {:?}",
                        String::from_utf8_lossy(depth)
                    ))
                })?;
            Ok(Self::Deepen(depth))
        } else {
            Err(WireError::protocol(format!(
                "unexpected shallow command {:?}",
                String::from_utf8_lossy(line)
            )))
        }
    }
}

impl fmt::Display for ShallowCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shallow(id) => write!(f, "shallow {}", id),
            Self::Unshallow(id) => write!(f, "unshallow {}", id),
            Self::Deepen(depth) => write!(f, "deepen {}", depth),
        }
    }
}

/// A provider's answer to a depth request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShallowUpdate {
    /// Commits that became boundaries.
    pub shallow: BTreeSet<ObjectId>,
    /// Commits that are no longer boundaries.
    pub unshallow: BTreeSet<ObjectId>,
}

/// Reads `shallow`/`unshallow` lines up to a flush.
pub fn read_shallow_updates<R: Read>(reader: &mut PktLineReader<R>) -> Result<ShallowUpdate> {
    let mut update = ShallowUpdate::default();
    for line in reader.read_seq() {
        match ShallowCommand::parse(&line?)? {
            ShallowCommand::Shallow(id) => {
                update.shallow.insert(id);
            }
            ShallowCommand::Unshallow(id) => {
                update.unshallow.insert(id);
            }
            ShallowCommand::Deepen(_) => {
                return Err(WireError::protocol("deepen in a shallow response"));
            }
        }
    }
    tracing::debug!(
        shallow = update.shallow.len(),
        unshallow = update.unshallow.len(),
        "read shallow update"
    );
    Ok(update)
}

/// Parent links of the commit graph, provided by the object store.
pub trait CommitGraph {
    /// Returns the parents of a commit.
    fn parents(&self, id: &ObjectId) -> Result<Vec<ObjectId>>;
}

/// Boundary of a depth-limited traversal.
///
/// The sets may overlap: a commit reached at the boundary along one path and
/// inside the depth along a shorter one is in both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShallowBoundary {
    /// Commits whose parents are not transferred.
    pub shallow: BTreeSet<ObjectId>,
    /// Commits fully inside the requested depth.
    pub not_shallow: BTreeSet<ObjectId>,
}

/// Computes the shallow boundary `depth` commits deep from every head.
///
/// Each path carries its own remaining budget: a head keeps `depth - 1` edges,
/// a commit with budget left is interior and schedules its parents with one
/// less, and a commit with none left is a boundary. Depth 0 and
/// [`INFINITE_DEPTH`] mean no limit.
pub fn find_shallow<G: CommitGraph + ?Sized>(
    graph: &G,
    heads: &[ObjectId],
    depth: u32,
) -> Result<ShallowBoundary> {
    let mut boundary = ShallowBoundary::default();

    if depth == 0 || depth >= INFINITE_DEPTH {
        let mut queue: VecDeque<ObjectId> = heads.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if boundary.not_shallow.insert(id) {
                queue.extend(graph.parents(&id)?);
            }
        }
        return Ok(boundary);
    }

    let mut seen: HashSet<(ObjectId, u32)> = HashSet::new();
    let mut queue: VecDeque<(ObjectId, u32)> = heads.iter().map(|id| (*id, depth - 1)).collect();
    while let Some((id, budget)) = queue.pop_front() {
        if !seen.insert((id, budget)) {
            continue;
        }
        if budget == 0 {
            boundary.shallow.insert(id);
            continue;
        }
        boundary.not_shallow.insert(id);
        for parent in graph.parents(&id)? {
            queue.push_back((parent, budget - 1));
        }
    }

    tracing::trace!(
        depth,
        heads = heads.len(),
        shallow = boundary.shallow.len(),
        not_shallow = boundary.not_shallow.len(),
        "computed shallow boundary"
    );
    Ok(boundary)
}

/// Answers a depth request (provider side).
///
/// Announces every new boundary the client does not already have and every
/// client boundary that now falls inside the requested depth, then a flush.
pub fn handle_shallow_request<G, W>(
    graph: &G,
    wants: &[ObjectId],
    client_shallow: &BTreeSet<ObjectId>,
    depth: u32,
    writer: &mut W,
) -> Result<ShallowBoundary>
where
    G: CommitGraph + ?Sized,
    W: WritePkt,
{
    let boundary = find_shallow(graph, wants, depth)?;

    let new_shallow = boundary
        .shallow
        .iter()
        .filter(|id| !boundary.not_shallow.contains(id) && !client_shallow.contains(id));
    for id in new_shallow {
        writer.write_line(&ShallowCommand::Shallow(*id).to_string())?;
    }
    for id in client_shallow.intersection(&boundary.not_shallow) {
        writer.write_line(&ShallowCommand::Unshallow(*id).to_string())?;
    }
    writer.flush_pkt()?;
    writer.flush()?;

    tracing::debug!(depth, wants = wants.len(), "answered shallow request");
    Ok(boundary)
}
