//! Fetch negotiation (requester side).
//!
//! Sends the wants, the optional depth request and the haves produced by a
//! [`GraphWalker`], then hands the connection over to the pack receiver.

use crate::ack::{AckLine, AckStatus};
use crate::capabilities::{
    AckStyle, Advertisement, Negotiated, Role, SHALLOW, SIDE_BAND, SIDE_BAND_64K,
};
use crate::pktline::{PktLine, PktLineReader, WritePkt};
use crate::shallow::{read_shallow_updates, ShallowCommand, ShallowUpdate};
use crate::sideband::{demultiplex, SidebandHandlers, SidebandMode};
use crate::{NegotiationConfig, Result, WireError};
use parley_types::{ObjectId, Refs, PEELED_SUFFIX};
use std::collections::BTreeSet;
use std::io::Read;

/// Source of `have` candidates, backed by the local object store.
pub trait GraphWalker {
    /// Next commit to announce, or `None` when exhausted.
    fn next_have(&mut self) -> Result<Option<ObjectId>>;

    /// The peer has `id`; its ancestors need not be announced.
    fn ack(&mut self, id: &ObjectId);

    /// The peer found nothing in common in the last round.
    fn nak(&mut self);

    /// Commits that are already shallow boundaries locally.
    fn shallow(&self) -> BTreeSet<ObjectId> {
        BTreeSet::new()
    }

    /// Applies the boundary changes announced by the peer.
    fn update_shallow(&mut self, _update: &ShallowUpdate) {}
}

/// Progress of a fetch negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Announcing wants.
    SendingWants,
    /// Announcing shallow boundaries and the requested depth.
    SendingShallow,
    /// Streaming haves and reading acknowledgments.
    ExchangingHaves,
    /// `done` sent.
    Done,
    /// Reading the pack.
    Receiving,
    /// Nothing left to read.
    Finished,
}

/// Result of the negotiation phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Commits the peer acknowledged as common.
    pub common: Vec<ObjectId>,
    /// Boundary changes announced by the peer, when a depth was requested.
    pub shallow_update: Option<ShallowUpdate>,
    /// Whether a pack follows.
    pub pack_expected: bool,
}

/// Fails with [`WireError::InvalidWants`] for wants the peer never advertised.
///
/// Peeled `^{}` entries do not count as advertised.
pub fn check_wants(wants: &[ObjectId], refs: &Refs) -> Result<()> {
    let advertised: BTreeSet<&ObjectId> = refs
        .iter()
        .filter(|(name, _)| !name.ends_with(PEELED_SUFFIX))
        .map(|(_, id)| id)
        .collect();
    let missing: Vec<ObjectId> = wants
        .iter()
        .filter(|id| !advertised.contains(id))
        .copied()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(WireError::InvalidWants(missing))
    }
}

/// Optional readiness probe: true when a response line can be read without
/// blocking. Without one, acknowledgments are only read after `done`.
pub type CanRead<'a> = Option<&'a mut dyn FnMut() -> bool>;

/// Drives one fetch negotiation.
pub struct FetchNegotiator<'c> {
    config: &'c NegotiationConfig,
    negotiated: Negotiated,
    peer_refs: Refs,
    state: FetchState,
    shallow_pending: bool,
    terminal_ack_seen: bool,
}

impl<'c> FetchNegotiator<'c> {
    /// Negotiates capabilities against the peer's advertisement.
    pub fn new(config: &'c NegotiationConfig, advertisement: &Advertisement) -> Result<Self> {
        let negotiated = Negotiated::new(config, Role::Fetch, &advertisement.capabilities)?;
        Ok(Self {
            config,
            negotiated,
            peer_refs: advertisement.refs.clone(),
            state: FetchState::SendingWants,
            shallow_pending: false,
            terminal_ack_seen: false,
        })
    }

    /// Current state.
    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Negotiated capabilities and peer side information.
    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// Acknowledgment style the peer will use.
    pub fn ack_style(&self) -> AckStyle {
        AckStyle::from_capabilities(&self.negotiated.capabilities)
    }

    /// Sideband mode of the pack phase.
    pub fn sideband_mode(&self) -> SidebandMode {
        SidebandMode::from_capabilities(&self.negotiated.capabilities)
    }

    fn transition(&mut self, next: FetchState) {
        tracing::debug!(from = ?self.state, to = ?next, "fetch state");
        self.state = next;
    }

    /// Capabilities sent on the first want line.
    fn request_capabilities(&self) -> String {
        let mut caps = self.negotiated.capabilities.clone();
        if caps.contains(SIDE_BAND_64K) {
            caps.remove(SIDE_BAND);
        }
        caps.to_line()
    }

    /// Runs the want, shallow and have phases and sends `done`.
    ///
    /// An empty want list sends a lone flush and finishes the negotiation.
    pub fn negotiate<R, W>(
        &mut self,
        reader: &mut PktLineReader<R>,
        mut writer: W,
        walker: &mut dyn GraphWalker,
        wants: &[ObjectId],
        depth: Option<u32>,
        mut can_read: CanRead<'_>,
    ) -> Result<FetchOutcome>
    where
        R: Read,
        W: WritePkt,
    {
        if self.state != FetchState::SendingWants {
            return Err(WireError::protocol(format!(
                "negotiation already started ({:?})",
                self.state
            )));
        }
        check_wants(wants, &self.peer_refs)?;

        let mut outcome = FetchOutcome::default();
        if wants.is_empty() {
            writer.flush_pkt()?;
            writer.flush()?;
            self.transition(FetchState::Finished);
            return Ok(outcome);
        }

        let caps = self.request_capabilities();
        for (i, want) in wants.iter().enumerate() {
            if i == 0 {
                writer.write_line(&first_want_line(want, &caps))?;
            } else {
                writer.write_line(&format!("want {}", want))?;
            }
        }

        let depth = depth.filter(|d| *d > 0);
        let known_shallow = walker.shallow();
        if depth.is_some() || !known_shallow.is_empty() {
            self.transition(FetchState::SendingShallow);
            if !self.negotiated.has(SHALLOW) {
                return Err(WireError::protocol(
                    "depth requested but the peer does not support shallow",
                ));
            }
            for id in &known_shallow {
                writer.write_line(&ShallowCommand::Shallow(*id).to_string())?;
            }
            if let Some(depth) = depth {
                writer.write_line(&ShallowCommand::Deepen(depth).to_string())?;
            }
        }
        writer.flush_pkt()?;
        writer.flush()?;

        if depth.is_some() {
            if can_read.is_some() {
                let update = read_shallow_updates(reader)?;
                walker.update_shallow(&update);
                outcome.shallow_update = Some(update);
            } else {
                self.shallow_pending = true;
            }
        }

        self.transition(FetchState::ExchangingHaves);
        let style = self.ack_style();
        let mut haves = 0usize;
        while let Some(have) = walker.next_have()? {
            writer.write_line(&format!("have {}", have))?;
            haves += 1;

            let Some(can_read) = can_read.as_mut() else {
                continue;
            };
            writer.flush()?;
            if !can_read() {
                continue;
            }
            match AckLine::parse(&read_data(reader)?)? {
                AckLine::Nak => walker.nak(),
                AckLine::Ack { id, status } => {
                    walker.ack(&id);
                    outcome.common.push(id);
                    match status {
                        None if style == AckStyle::Plain => {
                            self.terminal_ack_seen = true;
                            break;
                        }
                        Some(AckStatus::Ready) => break,
                        _ => {}
                    }
                }
            }
        }
        tracing::debug!(haves, common = outcome.common.len(), "have exchange sent");

        writer.write_line("done")?;
        writer.flush()?;
        self.transition(FetchState::Done);

        self.drain_acks(reader, walker, &mut outcome)?;
        outcome.pack_expected = true;
        self.transition(FetchState::Receiving);
        Ok(outcome)
    }

    /// Reads what is left of the acknowledgments before the pack.
    fn drain_acks<R: Read>(
        &mut self,
        reader: &mut PktLineReader<R>,
        walker: &mut dyn GraphWalker,
        outcome: &mut FetchOutcome,
    ) -> Result<()> {
        if self.shallow_pending {
            let update = read_shallow_updates(reader)?;
            walker.update_shallow(&update);
            outcome.shallow_update = Some(update);
            self.shallow_pending = false;
        }
        if self.terminal_ack_seen {
            return Ok(());
        }

        loop {
            let data = match reader.read()? {
                PktLine::Flush => break,
                PktLine::Data(data) => data,
            };
            let ack = match AckLine::parse(&data) {
                Ok(ack) => ack,
                Err(_) => {
                    // first frame of the pack
                    reader.unread(PktLine::Data(data))?;
                    break;
                }
            };
            match ack {
                AckLine::Nak => walker.nak(),
                AckLine::Ack { id, .. } => {
                    walker.ack(&id);
                    if !outcome.common.contains(&id) {
                        outcome.common.push(id);
                    }
                }
            }
            if ack.is_final() {
                break;
            }
        }
        Ok(())
    }

    /// Reads the pack, routing it through the negotiated sideband.
    pub fn receive<R: Read>(
        &mut self,
        reader: &mut PktLineReader<R>,
        handlers: &mut SidebandHandlers<'_>,
    ) -> Result<()> {
        if self.state != FetchState::Receiving {
            return Err(WireError::protocol(format!(
                "no pack expected in state {:?}",
                self.state
            )));
        }
        demultiplex(reader, self.sideband_mode(), handlers)?;
        self.transition(FetchState::Finished);
        Ok(())
    }

    /// Runs a whole fetch: negotiation followed by the pack.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch<R, W>(
        &mut self,
        reader: &mut PktLineReader<R>,
        writer: W,
        walker: &mut dyn GraphWalker,
        wants: &[ObjectId],
        depth: Option<u32>,
        can_read: CanRead<'_>,
        handlers: &mut SidebandHandlers<'_>,
    ) -> Result<FetchOutcome>
    where
        R: Read,
        W: WritePkt,
    {
        let outcome = self.negotiate(reader, writer, walker, wants, depth, can_read)?;
        if outcome.pack_expected {
            self.receive(reader, handlers)?;
        }
        tracing::debug!(
            agent = self.config.agent.as_str(),
            common = outcome.common.len(),
            "fetch finished"
        );
        Ok(outcome)
    }
}

/// `want <id>[ <caps>]`.
fn first_want_line(want: &ObjectId, caps: &str) -> String {
    if caps.is_empty() {
        format!("want {}", want)
    } else {
        format!("want {} {}", want, caps)
    }
}

fn read_data<R: Read>(reader: &mut PktLineReader<R>) -> Result<Vec<u8>> {
    reader
        .read_line()?
        .ok_or_else(|| WireError::protocol("unexpected flush while reading acknowledgments"))
}
