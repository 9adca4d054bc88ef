//! Capability advertisement and negotiation.
//!
//! Capabilities are space-separated tokens, each a name with an optional
//! `=value`. They ride on the first ref of an advertisement (after a NUL), on
//! the first want line of a fetch and on the first command of a push.

use crate::pktline::{PktLineReader, WritePkt};
use crate::{NegotiationConfig, Result, WireError};
use parley_types::{ObjectId, Refs, ZERO_ID};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Read;

// Capability names.
pub const MULTI_ACK: &str = "multi_ack";
pub const MULTI_ACK_DETAILED: &str = "multi_ack_detailed";
pub const NO_DONE: &str = "no-done";
pub const SIDE_BAND: &str = "side-band";
pub const SIDE_BAND_64K: &str = "side-band-64k";
pub const OFS_DELTA: &str = "ofs-delta";
pub const THIN_PACK: &str = "thin-pack";
pub const SHALLOW: &str = "shallow";
pub const DEEPEN_SINCE: &str = "deepen-since";
pub const DEEPEN_NOT: &str = "deepen-not";
pub const DEEPEN_RELATIVE: &str = "deepen-relative";
pub const NO_PROGRESS: &str = "no-progress";
pub const INCLUDE_TAG: &str = "include-tag";
pub const REPORT_STATUS: &str = "report-status";
pub const DELETE_REFS: &str = "delete-refs";
pub const QUIET: &str = "quiet";
pub const ATOMIC: &str = "atomic";
pub const PUSH_OPTIONS: &str = "push-options";
pub const ALLOW_TIP_SHA1_IN_WANT: &str = "allow-tip-sha1-in-want";
pub const ALLOW_REACHABLE_SHA1_IN_WANT: &str = "allow-reachable-sha1-in-want";
pub const AGENT: &str = "agent";
pub const SYMREF: &str = "symref";

/// Marker ref name used by an empty repository to carry its capabilities.
const EMPTY_REPO_MARKER: &str = "capabilities^{}";

/// A single capability token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Capability {
    name: String,
    value: Option<String>,
}

impl Capability {
    /// Creates a capability without a value.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Creates a `name=value` capability.
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Parses a single token, splitting at the first `=`.
    pub fn parse(token: &str) -> Result<Self> {
        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (token, None),
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(WireError::protocol(format!(
                "invalid capability token {:?}",
                token
            )));
        }
        Ok(Self {
            name: name.to_string(),
            value,
        })
    }

    /// The capability name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value after `=`, if any.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// An order-independent set of capabilities.
///
/// A name may appear more than once with different values (`symref`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    caps: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a whitespace-separated capability list.
    pub fn parse(text: &str) -> Result<Self> {
        text.split_ascii_whitespace().map(Capability::parse).collect()
    }

    /// Parses a capability list straight off the wire.
    pub fn parse_bytes(text: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(text)
            .map_err(|_| WireError::protocol("capability list is not valid UTF-8"))?;
        Self::parse(text)
    }

    /// Adds a capability.
    pub fn insert(&mut self, cap: Capability) {
        self.caps.insert(cap);
    }

    /// Removes every capability with the given name.
    pub fn remove(&mut self, name: &str) {
        self.caps.retain(|c| c.name != name);
    }

    /// Returns true if a capability with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.caps.iter().any(|c| c.name == name)
    }

    /// Returns the first value recorded for `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.caps
            .iter()
            .find(|c| c.name == name)
            .and_then(Capability::value)
    }

    /// Iterates in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.caps.iter()
    }

    /// Number of tokens in the set.
    pub fn len(&self) -> usize {
        self.caps.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// The `agent=` value.
    pub fn agent(&self) -> Option<&str> {
        self.value(AGENT)
    }

    /// All `symref=src:dst` pairs, keyed by source.
    pub fn symrefs(&self) -> Result<BTreeMap<String, String>> {
        self.caps
            .iter()
            .filter(|c| c.name == SYMREF)
            .map(|c| {
                c.value()
                    .and_then(|v| v.split_once(':'))
                    .map(|(src, dst)| (src.to_string(), dst.to_string()))
                    .ok_or_else(|| {
                        WireError::protocol(format!(
                            "malformed symref capability {:?}",
                            c.to_string()
                        ))
                    })
            })
            .collect()
    }

    /// Capabilities present here whose names the local side does not know.
    pub fn unknown<'a>(&'a self, local: &CapabilitySet) -> Vec<&'a Capability> {
        self.caps
            .iter()
            .filter(|c| !local.contains(&c.name))
            .collect()
    }

    /// Renders the set as a space-separated list in name order.
    pub fn to_line(&self) -> String {
        self.caps
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            caps: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Computes the capabilities both sides support.
///
/// A token is kept verbatim when both sides carry it with the same value;
/// a name both sides know but with differing values is kept without a value.
pub fn negotiate(local: &CapabilitySet, peer: &CapabilitySet) -> CapabilitySet {
    let mut out = CapabilitySet::new();
    for cap in local.iter() {
        if !peer.contains(&cap.name) {
            continue;
        }
        if peer.caps.contains(cap) {
            out.insert(cap.clone());
        } else {
            let exact_match = local
                .iter()
                .filter(|c| c.name == cap.name)
                .any(|c| peer.caps.contains(c));
            if !exact_match {
                out.insert(Capability::new(cap.name.clone()));
            }
        }
    }
    out
}

/// Which side of a transfer the local process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Requesting objects (fetch/clone).
    Fetch,
    /// Sending objects (push).
    Push,
}

/// Outcome of negotiating against a peer advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Capabilities both sides support.
    pub capabilities: CapabilitySet,
    /// Peer `symref` side information.
    pub symrefs: BTreeMap<String, String>,
    /// Peer agent string.
    pub agent: Option<String>,
}

impl Negotiated {
    /// Negotiates the local capabilities of `role` against the peer's advertisement.
    pub fn new(config: &NegotiationConfig, role: Role, peer: &CapabilitySet) -> Result<Self> {
        let local = config.local_set(role)?;
        for cap in peer.unknown(&local) {
            tracing::debug!(capability = %cap, ?role, "ignoring unknown peer capability");
        }
        let mut capabilities = negotiate(&local, peer);
        if capabilities.contains(AGENT) {
            // agents are announced, never agreed upon
            capabilities.remove(AGENT);
            capabilities.insert(Capability::with_value(AGENT, config.agent.clone()));
        }
        let negotiated = Self {
            capabilities,
            symrefs: peer.symrefs()?,
            agent: peer.agent().map(str::to_string),
        };
        tracing::debug!(
            ?role,
            capabilities = %negotiated.capabilities,
            peer_agent = negotiated.agent.as_deref().unwrap_or("unknown"),
            "negotiated capabilities"
        );
        Ok(negotiated)
    }

    /// Returns true if the capability was negotiated.
    pub fn has(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }
}

/// Acknowledgment style selected by the negotiated capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStyle {
    /// A single `ACK` for the first common commit.
    Plain,
    /// `multi_ack`: `ACK <id> continue` per common commit.
    Multi,
    /// `multi_ack_detailed`: `common` and `ready` qualifiers.
    MultiDetailed,
}

impl AckStyle {
    /// Picks the richest style present in the set.
    pub fn from_capabilities(caps: &CapabilitySet) -> Self {
        if caps.contains(MULTI_ACK_DETAILED) {
            Self::MultiDetailed
        } else if caps.contains(MULTI_ACK) {
            Self::Multi
        } else {
            Self::Plain
        }
    }
}

/// Splits `"<rest>\0<capabilities>"` into its two halves.
pub fn split_capabilities(line: &[u8]) -> Result<(&[u8], CapabilitySet)> {
    match line.iter().position(|&b| b == 0) {
        Some(nul) => Ok((&line[..nul], CapabilitySet::parse_bytes(&line[nul + 1..])?)),
        None => Ok((line, CapabilitySet::new())),
    }
}

/// Splits `"want <id> <capabilities...>"` into the want part and the capabilities.
pub fn extract_want_line_capabilities(line: &[u8]) -> Result<(&[u8], CapabilitySet)> {
    let line = trim_newline(line);
    let second_space = line
        .iter()
        .enumerate()
        .filter_map(|(i, b)| (*b == b' ').then_some(i))
        .nth(1);
    match second_space {
        Some(second) => Ok((
            &line[..second],
            CapabilitySet::parse_bytes(&line[second + 1..])?,
        )),
        None => Ok((line, CapabilitySet::new())),
    }
}

pub(crate) fn trim_newline(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\n").unwrap_or(line)
}

/// Refs and capabilities announced by a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertised refs, including peeled `^{}` entries.
    pub refs: Refs,
    /// Capabilities from the first line.
    pub capabilities: CapabilitySet,
}

/// Reads a ref advertisement up to its terminating flush.
///
/// A leading `# service=` preamble (smart HTTP) is skipped.
pub fn read_advertisement<R: Read>(reader: &mut PktLineReader<R>) -> Result<Advertisement> {
    let mut adv = Advertisement::default();
    let mut first = true;

    while let Some(line) = reader.read_line()? {
        let line = trim_newline(&line);
        if first && line.starts_with(b"# service=") {
            // the preamble has its own flush
            reader.read_until_flush()?;
            continue;
        }
        if let Some(msg) = line.strip_prefix(b"ERR ") {
            return Err(WireError::Remote(String::from_utf8_lossy(msg).into_owned()));
        }

        let (rest, caps) = split_capabilities(line)?;
        if first {
            adv.capabilities = caps;
            first = false;
        }

        let (id, name) = parse_ref_line(rest)?;
        if name == EMPTY_REPO_MARKER {
            continue;
        }
        adv.refs.insert(name, id);
    }

    tracing::debug!(
        refs = adv.refs.len(),
        capabilities = %adv.capabilities,
        "read ref advertisement"
    );
    Ok(adv)
}

fn parse_ref_line(line: &[u8]) -> Result<(ObjectId, String)> {
    let space = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| WireError::protocol("ref line without a name"))?;
    let id = ObjectId::from_hex_bytes(&line[..space])?;
    let name = std::str::from_utf8(&line[space + 1..])
        .map_err(|_| WireError::protocol("ref name is not valid UTF-8"))?;
    if name.is_empty() {
        return Err(WireError::protocol("empty ref name"));
    }
    Ok((id, name.to_string()))
}

/// Writes a ref advertisement (provider side).
///
/// `HEAD` goes first when present; an empty ref map is announced with the
/// `capabilities^{}` marker so the capabilities still reach the peer.
pub fn write_advertisement<W: WritePkt>(
    writer: &mut W,
    refs: &Refs,
    capabilities: &CapabilitySet,
    service: Option<&str>,
) -> Result<()> {
    if let Some(service) = service {
        writer.write_line(&format!("# service={}", service))?;
        writer.flush_pkt()?;
    }

    let mut ordered: Vec<(&str, &ObjectId)> = Vec::with_capacity(refs.len());
    if let Some(head) = refs.get("HEAD") {
        ordered.push(("HEAD", head));
    }
    ordered.extend(
        refs.iter()
            .filter(|(name, _)| name.as_str() != "HEAD")
            .map(|(name, id)| (name.as_str(), id)),
    );

    match ordered.split_first() {
        Some(((name, id), rest)) => {
            writer.write_data(format!("{} {}\0{}\n", id, name, capabilities).as_bytes())?;
            for (name, id) in rest {
                writer.write_line(&format!("{} {}", id, name))?;
            }
        }
        None => {
            writer.write_data(
                format!("{} {}\0{}\n", ZERO_ID, EMPTY_REPO_MARKER, capabilities).as_bytes(),
            )?;
        }
    }

    writer.flush_pkt()?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::PktLineWriter;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn set(text: &str) -> CapabilitySet {
        CapabilitySet::parse(text).unwrap()
    }

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    #[test]
    fn test_capability_parse() {
        let cap = Capability::parse("agent=git/2.40").unwrap();
        assert_eq!(cap.name(), "agent");
        assert_eq!(cap.value(), Some("git/2.40"));
        assert_eq!(cap.to_string(), "agent=git/2.40");

        let bare = Capability::parse("thin-pack").unwrap();
        assert_eq!(bare.value(), None);

        let symref = Capability::parse("symref=HEAD:refs/heads/main").unwrap();
        assert_eq!(symref.value(), Some("HEAD:refs/heads/main"));
    }

    #[test]
    fn test_capability_parse_rejects_empty_name() {
        assert!(Capability::parse("").is_err());
        assert!(Capability::parse("=value").is_err());
    }

    #[test]
    fn test_set_is_order_independent() {
        assert_eq!(set("ofs-delta thin-pack"), set("thin-pack  ofs-delta"));
        assert_eq!(set("thin-pack ofs-delta").to_line(), "ofs-delta thin-pack");
    }

    #[test]
    fn test_negotiate_intersection() {
        let local = set("multi_ack side-band-64k ofs-delta agent=parley/0.1");
        let peer = set("multi_ack ofs-delta report-status agent=git/2.40");
        let negotiated = negotiate(&local, &peer);
        assert_eq!(negotiated, set("multi_ack ofs-delta agent"));
    }

    #[test]
    fn test_negotiate_keeps_matching_values() {
        let local = set("object-format=sha1");
        assert_eq!(negotiate(&local, &local), local);
    }

    #[test]
    fn test_symrefs_and_agent() {
        let caps = set(
            "symref=HEAD:refs/heads/main symref=refs/remotes/o/HEAD:refs/remotes/o/main agent=git/2.40",
        );
        let symrefs = caps.symrefs().unwrap();
        assert_eq!(symrefs.len(), 2);
        assert_eq!(symrefs["HEAD"], "refs/heads/main");
        assert_eq!(caps.agent(), Some("git/2.40"));
    }

    #[test]
    fn test_malformed_symref() {
        assert!(set("symref=HEAD").symrefs().is_err());
    }

    #[test]
    fn test_unknown_capabilities() {
        let local = set("thin-pack ofs-delta");
        let peer = set("thin-pack filter bogus=1");
        let unknown: Vec<String> = peer.unknown(&local).iter().map(|c| c.to_string()).collect();
        assert_eq!(unknown, vec!["bogus=1".to_string(), "filter".to_string()]);
    }

    #[test]
    fn test_negotiated_replaces_agent() {
        let config = NegotiationConfig::default();
        let peer =
            set("multi_ack_detailed side-band-64k agent=git/2.40 symref=HEAD:refs/heads/main");
        let negotiated = Negotiated::new(&config, Role::Fetch, &peer).unwrap();
        assert!(negotiated.has(MULTI_ACK_DETAILED));
        assert_eq!(negotiated.capabilities.agent(), Some(config.agent.as_str()));
        assert_eq!(negotiated.agent.as_deref(), Some("git/2.40"));
        assert_eq!(negotiated.symrefs["HEAD"], "refs/heads/main");
    }

    #[test]
    fn test_ack_style() {
        assert_eq!(AckStyle::from_capabilities(&set("")), AckStyle::Plain);
        assert_eq!(AckStyle::from_capabilities(&set("multi_ack")), AckStyle::Multi);
        assert_eq!(
            AckStyle::from_capabilities(&set("multi_ack multi_ack_detailed")),
            AckStyle::MultiDetailed
        );
    }

    #[test]
    fn test_split_capabilities() {
        let (rest, caps) = split_capabilities(b"abc HEAD\0ofs-delta thin-pack").unwrap();
        assert_eq!(rest, b"abc HEAD");
        assert_eq!(caps, set("ofs-delta thin-pack"));

        let (rest, caps) = split_capabilities(b"abc refs/heads/main").unwrap();
        assert_eq!(rest, b"abc refs/heads/main");
        assert!(caps.is_empty());
    }

    #[test]
    fn test_extract_want_line_capabilities() {
        let line = format!("want {} multi_ack thin-pack\n", oid(1));
        let (want, caps) = extract_want_line_capabilities(line.as_bytes()).unwrap();
        assert_eq!(want, format!("want {}", oid(1)).as_bytes());
        assert_eq!(caps, set("multi_ack thin-pack"));

        let line = format!("want {}\n", oid(1));
        let (want, caps) = extract_want_line_capabilities(line.as_bytes()).unwrap();
        assert_eq!(want, format!("want {}", oid(1)).as_bytes());
        assert!(caps.is_empty());
    }

    #[test]
    fn test_advertisement_roundtrip() {
        let mut refs = Refs::new();
        refs.insert("HEAD".to_string(), oid(1));
        refs.insert("refs/heads/main".to_string(), oid(1));
        refs.insert("refs/tags/v1".to_string(), oid(2));
        refs.insert("refs/tags/v1^{}".to_string(), oid(3));
        let caps = set("multi_ack side-band-64k symref=HEAD:refs/heads/main");

        let mut writer = PktLineWriter::new(Vec::new());
        write_advertisement(&mut writer, &refs, &caps, Some("git-upload-pack")).unwrap();
        let wire = writer.into_inner();
        assert!(wire.starts_with(b"001e# service=git-upload-pack\n0000"));

        let mut reader = PktLineReader::new(Cursor::new(wire));
        let adv = read_advertisement(&mut reader).unwrap();
        assert_eq!(adv.refs, refs);
        assert_eq!(adv.capabilities, caps);
    }

    #[test]
    fn test_advertisement_empty_repo() {
        let caps = set("report-status delete-refs");
        let mut writer = PktLineWriter::new(Vec::new());
        write_advertisement(&mut writer, &Refs::new(), &caps, None).unwrap();

        let mut reader = PktLineReader::new(Cursor::new(writer.into_inner()));
        let adv = read_advertisement(&mut reader).unwrap();
        assert!(adv.refs.is_empty());
        assert_eq!(adv.capabilities, caps);
    }

    #[test]
    fn test_advertisement_err_line() {
        let mut writer = PktLineWriter::new(Vec::new());
        writer.write_line("ERR access denied").unwrap();
        let mut reader = PktLineReader::new(Cursor::new(writer.into_inner()));
        match read_advertisement(&mut reader) {
            Err(WireError::Remote(msg)) => assert_eq!(msg, "access denied"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_advertisement_hangup() {
        let mut reader = PktLineReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(matches!(
            read_advertisement(&mut reader),
            Err(WireError::Hangup)
        ));
    }
}
