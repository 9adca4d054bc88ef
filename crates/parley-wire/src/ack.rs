//! Acknowledgment strategies (provider side) and ack line parsing.
//!
//! While the requester streams `have` lines, the provider tells it which ones
//! are common. How it does so depends on the negotiated style: a single
//! `ACK`, `ACK <id> continue` per common commit (`multi_ack`), or
//! `ACK <id> common` plus `ACK <id> ready` (`multi_ack_detailed`).

use crate::capabilities::{trim_newline, AckStyle};
use crate::pktline::{PktLine, PktLineReader, WritePkt};
use crate::{Result, WireError};
use parley_types::ObjectId;
use std::fmt;
use std::io::Read;

/// Qualifier following `ACK <id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// `continue` (`multi_ack`).
    Continue,
    /// `common` (`multi_ack_detailed`).
    Common,
    /// `ready` (`multi_ack_detailed`): the provider can send a pack.
    Ready,
}

impl AckStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Common => "common",
            Self::Ready => "ready",
        }
    }
}

/// One acknowledgment line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckLine {
    /// `ACK <id>[ <status>]`
    Ack {
        /// Acknowledged commit.
        id: ObjectId,
        /// Qualifier, absent for a final or plain-style ack.
        status: Option<AckStatus>,
    },
    /// `NAK`
    Nak,
}

impl AckLine {
    /// Parses an ack line.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let line = trim_newline(line);
        if line == b"NAK" {
            return Ok(Self::Nak);
        }
        let rest = line.strip_prefix(b"ACK ").ok_or_else(|| {
            WireError::protocol(format!(
                "expected ACK or NAK, got {:?}",
                String::from_utf8_lossy(line)
            ))
        })?;
        let (id, status) = match rest.iter().position(|&b| b == b' ') {
            Some(space) => (&rest[..space], Some(&rest[space + 1..])),
            None => (rest, None),
        };
        let status = match status {
            None => None,
            Some(b"continue") => Some(AckStatus::Continue),
            Some(b"common") => Some(AckStatus::Common),
            Some(b"ready") => Some(AckStatus::Ready),
            Some(other) => {
                return Err(WireError::protocol(format!(
                    "invalid ack qualifier {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        Ok(Self::Ack {
            id: ObjectId::from_hex_bytes(id)?,
            status,
        })
    }

    /// Returns true for lines that end a round of acknowledgments.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Nak | Self::Ack { status: None, .. })
    }
}

impl fmt::Display for AckLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nak => f.write_str("NAK"),
            Self::Ack { id, status: None } => write!(f, "ACK {}", id),
            Self::Ack {
                id,
                status: Some(status),
            } => write!(f, "ACK {} {}", id, status.as_str()),
        }
    }
}

/// A command sent by the requester during the have exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HaveCommand {
    Have(ObjectId),
    Done,
    Flush,
}

/// Predicate telling whether the acknowledged commits cover every want.
pub type WantsSatisfied<'a> = Box<dyn FnMut(&[ObjectId]) -> bool + 'a>;

/// Connection state shared by every acknowledgment strategy.
pub struct ProtocolWalker<'a, R, W> {
    reader: &'a mut PktLineReader<R>,
    writer: W,
    all_wants_satisfied: WantsSatisfied<'a>,
    stateless: bool,
    done_received: bool,
    flush_seen: bool,
}

impl<'a, R: Read, W: WritePkt> ProtocolWalker<'a, R, W> {
    /// Creates a walker over an established connection.
    pub fn new(
        reader: &'a mut PktLineReader<R>,
        writer: W,
        all_wants_satisfied: WantsSatisfied<'a>,
        stateless: bool,
    ) -> Self {
        Self {
            reader,
            writer,
            all_wants_satisfied,
            stateless,
            done_received: false,
            flush_seen: false,
        }
    }

    /// Whether the requester sent `done`.
    pub fn done_received(&self) -> bool {
        self.done_received
    }

    /// Whether the exchange reached a terminating flush.
    pub fn flush_seen(&self) -> bool {
        self.flush_seen
    }

    fn read_command(&mut self) -> Result<HaveCommand> {
        match self.reader.read()? {
            PktLine::Flush => {
                self.flush_seen = true;
                Ok(HaveCommand::Flush)
            }
            PktLine::Data(data) => {
                let line = trim_newline(&data);
                if line == b"done" {
                    self.done_received = true;
                    Ok(HaveCommand::Done)
                } else if let Some(id) = line.strip_prefix(b"have ") {
                    Ok(HaveCommand::Have(ObjectId::from_hex_bytes(id)?))
                } else {
                    Err(WireError::protocol(format!(
                        "expected have or done, got {:?}",
                        String::from_utf8_lossy(line)
                    )))
                }
            }
        }
    }

    fn send(&mut self, line: AckLine) -> Result<()> {
        tracing::trace!(line = %line, "sending ack");
        self.writer.write_line(&line.to_string())?;
        self.writer.flush()
    }

    fn send_ack(&mut self, id: ObjectId, status: Option<AckStatus>) -> Result<()> {
        self.send(AckLine::Ack { id, status })
    }

    fn send_nak(&mut self) -> Result<()> {
        self.send(AckLine::Nak)
    }

    fn satisfied(&mut self, common: &[ObjectId]) -> bool {
        (self.all_wants_satisfied)(common)
    }
}

/// Contract shared by the acknowledgment styles.
pub trait AckStrategy {
    /// Reads the next `have`, or `None` once the requester sent `done` or
    /// ended the request.
    fn next_have(&mut self) -> Result<Option<ObjectId>>;

    /// Records a `have` the provider also has.
    fn ack(&mut self, id: ObjectId) -> Result<()>;

    /// Sends a negative acknowledgment.
    fn nak(&mut self) -> Result<()>;

    /// Finishes the exchange; returns whether a pack may be sent.
    ///
    /// With `done_required` a pack follows only an explicit `done`. Without
    /// it (`no-done`) being ready is enough once the exchange reached a
    /// terminating flush.
    fn handle_done(&mut self, done_required: bool, done_received: bool) -> Result<bool>;

    /// Whether the requester sent `done`.
    fn done_received(&self) -> bool;
}

/// Plain style: one `ACK` for the first common commit.
pub struct SingleAck<'a, R, W> {
    walker: ProtocolWalker<'a, R, W>,
    common: Option<ObjectId>,
}

impl<R: Read, W: WritePkt> AckStrategy for SingleAck<'_, R, W> {
    fn next_have(&mut self) -> Result<Option<ObjectId>> {
        match self.walker.read_command()? {
            HaveCommand::Have(id) => Ok(Some(id)),
            HaveCommand::Done | HaveCommand::Flush => Ok(None),
        }
    }

    fn ack(&mut self, id: ObjectId) -> Result<()> {
        if self.common.is_none() {
            self.walker.send_ack(id, None)?;
            self.common = Some(id);
        }
        Ok(())
    }

    fn nak(&mut self) -> Result<()> {
        self.walker.send_nak()
    }

    fn handle_done(&mut self, done_required: bool, done_received: bool) -> Result<bool> {
        if self.common.is_none() {
            self.walker.send_nak()?;
        }
        if done_required && !done_received {
            return Ok(false);
        }
        if !done_received && (self.common.is_none() || !self.walker.flush_seen()) {
            return Ok(false);
        }
        Ok(true)
    }

    fn done_received(&self) -> bool {
        self.walker.done_received()
    }
}

/// `multi_ack`: `ACK <id> continue` for every common commit.
pub struct MultiAck<'a, R, W> {
    walker: ProtocolWalker<'a, R, W>,
    common: Vec<ObjectId>,
}

impl<R: Read, W: WritePkt> AckStrategy for MultiAck<'_, R, W> {
    fn next_have(&mut self) -> Result<Option<ObjectId>> {
        loop {
            match self.walker.read_command()? {
                HaveCommand::Have(id) => return Ok(Some(id)),
                HaveCommand::Done => return Ok(None),
                HaveCommand::Flush => {
                    // liveness probe: the requester has more haves to send
                    self.walker.send_nak()?;
                    if self.walker.stateless {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn ack(&mut self, id: ObjectId) -> Result<()> {
        self.common.push(id);
        self.walker.send_ack(id, Some(AckStatus::Continue))
    }

    fn nak(&mut self) -> Result<()> {
        self.walker.send_nak()
    }

    fn handle_done(&mut self, done_required: bool, done_received: bool) -> Result<bool> {
        if done_required && !done_received {
            return Ok(false);
        }
        if !done_received && (self.common.is_empty() || !self.walker.flush_seen()) {
            return Ok(false);
        }
        match self.common.last() {
            Some(id) => self.walker.send_ack(*id, None)?,
            None => self.walker.send_nak()?,
        }
        Ok(true)
    }

    fn done_received(&self) -> bool {
        self.walker.done_received()
    }
}

/// `multi_ack_detailed`: `ACK <id> common`, then `ACK <id> ready` once every
/// want is covered.
pub struct MultiAckDetailed<'a, R, W> {
    walker: ProtocolWalker<'a, R, W>,
    common: Vec<ObjectId>,
    ready: bool,
}

impl<R: Read, W: WritePkt> MultiAckDetailed<'_, R, W> {
    fn check_ready(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        if let Some(&last) = self.common.last() {
            if self.walker.satisfied(&self.common) {
                self.ready = true;
                tracing::debug!(id = %last, "all wants satisfied");
                self.walker.send_ack(last, Some(AckStatus::Ready))?;
            }
        }
        Ok(())
    }
}

impl<R: Read, W: WritePkt> AckStrategy for MultiAckDetailed<'_, R, W> {
    fn next_have(&mut self) -> Result<Option<ObjectId>> {
        loop {
            match self.walker.read_command()? {
                HaveCommand::Have(id) => return Ok(Some(id)),
                HaveCommand::Done => return Ok(None),
                HaveCommand::Flush => {
                    self.check_ready()?;
                    self.walker.send_nak()?;
                    if self.walker.stateless {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn ack(&mut self, id: ObjectId) -> Result<()> {
        self.common.push(id);
        self.walker.send_ack(id, Some(AckStatus::Common))?;
        self.check_ready()
    }

    fn nak(&mut self) -> Result<()> {
        self.walker.send_nak()
    }

    fn handle_done(&mut self, done_required: bool, done_received: bool) -> Result<bool> {
        if done_required && !done_received {
            return Ok(false);
        }
        if !done_received && !(self.ready && self.walker.flush_seen()) {
            return Ok(false);
        }
        match self.common.last() {
            Some(id) => self.walker.send_ack(*id, None)?,
            None => self.walker.send_nak()?,
        }
        Ok(true)
    }

    fn done_received(&self) -> bool {
        self.walker.done_received()
    }
}

/// Builds the strategy for a negotiated style.
pub fn ack_strategy<'a, R, W>(
    style: AckStyle,
    walker: ProtocolWalker<'a, R, W>,
) -> Box<dyn AckStrategy + 'a>
where
    R: Read + 'a,
    W: WritePkt + 'a,
{
    tracing::debug!(?style, stateless = walker.stateless, "starting have exchange");
    match style {
        AckStyle::Plain => Box::new(SingleAck {
            walker,
            common: None,
        }),
        AckStyle::Multi => Box::new(MultiAck {
            walker,
            common: Vec::new(),
        }),
        AckStyle::MultiDetailed => Box::new(MultiAckDetailed {
            walker,
            common: Vec::new(),
            ready: false,
        }),
    }
}

/// Outcome of a provider-side have exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaveExchange {
    /// Haves the provider also has, in the order received.
    pub common: Vec<ObjectId>,
    /// Whether the pack may be sent now.
    pub send_pack: bool,
}

/// Drives a strategy to the end of the exchange.
///
/// `has_object` answers whether the provider has a `have`.
pub fn exchange_haves<F>(
    strategy: &mut dyn AckStrategy,
    mut has_object: F,
    done_required: bool,
) -> Result<HaveExchange>
where
    F: FnMut(&ObjectId) -> bool,
{
    let mut exchange = HaveExchange::default();
    while let Some(id) = strategy.next_have()? {
        if has_object(&id) {
            strategy.ack(id)?;
            exchange.common.push(id);
        }
    }
    let done = strategy.done_received();
    exchange.send_pack = strategy.handle_done(done_required, done)?;
    tracing::debug!(
        common = exchange.common.len(),
        done,
        send_pack = exchange.send_pack,
        "have exchange finished"
    );
    Ok(exchange)
}
