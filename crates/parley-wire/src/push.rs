//! Push negotiation (sender side) and update command parsing (receiver side).

use crate::capabilities::{
    split_capabilities, trim_newline, CapabilitySet, Negotiated, Role, DELETE_REFS, OFS_DELTA,
    PUSH_OPTIONS, REPORT_STATUS, SIDE_BAND, SIDE_BAND_64K,
};
use crate::pktline::{PktLine, PktLineParser, PktLineReader, WritePkt};
use crate::report::{RefStatus, ReportStatusParser};
use crate::sideband::{demultiplex, SidebandHandlers, SidebandMode};
use crate::{NegotiationConfig, Result, WireError};
use bytes::Bytes;
use parley_types::{ObjectId, Refs, ZERO_ID};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

/// Reason recorded for deletions the receiver cannot perform.
pub const DELETE_UNSUPPORTED: &str = "remote does not support deleting refs";

/// A ref update command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Current value on the receiver (zero to create).
    pub old: ObjectId,
    /// Desired value (zero to delete).
    pub new: ObjectId,
    /// Reference name.
    pub name: String,
}

impl RefUpdate {
    /// Checks if this is a create command.
    pub fn is_create(&self) -> bool {
        self.old.is_zero()
    }

    /// Checks if this is a delete command.
    pub fn is_delete(&self) -> bool {
        self.new.is_zero()
    }

    /// Parses `<old> <new> <ref>`, without capabilities.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let line = trim_newline(line);
        let mut parts = line.splitn(3, |&b| b == b' ');
        let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(WireError::protocol(format!(
                "malformed update command {:?}",
                String::from_utf8_lossy(line)
            )));
        };
        let name = std::str::from_utf8(name)
            .map_err(|_| WireError::protocol("ref name is not valid UTF-8"))?;
        if name.is_empty() {
            return Err(WireError::protocol("empty ref name"));
        }
        Ok(Self {
            old: ObjectId::from_hex_bytes(old)?,
            new: ObjectId::from_hex_bytes(new)?,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RefUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.old, self.new, self.name)
    }
}

/// Object store side of a push: builds the pack for the commands.
pub trait PackSource {
    /// Returns the object count and the pack bytes for everything reachable
    /// from `wants` but not from `haves`.
    fn generate_pack_data(
        &mut self,
        haves: &[ObjectId],
        wants: &[ObjectId],
        ofs_delta: bool,
    ) -> Result<(usize, Box<dyn Iterator<Item = Bytes> + '_>)>;
}

/// What a push did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Commands sent to the receiver.
    pub commands: Vec<RefUpdate>,
    /// Per-ref outcome: local refusals plus the receiver's report.
    pub ref_status: BTreeMap<String, RefStatus>,
    /// Objects in the pack, if one was sent.
    pub pack_objects: Option<usize>,
    /// Receiver agent string.
    pub agent: Option<String>,
}

/// Drives one push.
pub struct PushNegotiator<'c> {
    config: &'c NegotiationConfig,
    negotiated: Negotiated,
}

impl<'c> PushNegotiator<'c> {
    /// Negotiates capabilities against the receiver's advertisement.
    pub fn new(config: &'c NegotiationConfig, peer_capabilities: &CapabilitySet) -> Result<Self> {
        Ok(Self {
            config,
            negotiated: Negotiated::new(config, Role::Push, peer_capabilities)?,
        })
    }

    /// Negotiated capabilities and peer side information.
    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    fn sideband_mode(&self) -> SidebandMode {
        SidebandMode::from_capabilities(&self.negotiated.capabilities)
    }

    fn request_capabilities(&self) -> String {
        let mut caps = self.negotiated.capabilities.clone();
        if caps.contains(SIDE_BAND_64K) {
            caps.remove(SIDE_BAND);
        }
        caps.to_line()
    }

    /// Sends update commands, the pack and reads the status report.
    ///
    /// `update_refs` maps the receiver's refs to the desired refs; every ref
    /// whose value differs becomes a command.
    #[allow(clippy::too_many_arguments)]
    pub fn send_pack<R, W, F>(
        &self,
        reader: &mut PktLineReader<R>,
        mut writer: W,
        peer_refs: &Refs,
        update_refs: F,
        pack_source: &mut dyn PackSource,
        push_options: &[String],
        progress: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<PushOutcome>
    where
        R: Read,
        W: WritePkt,
        F: FnOnce(&Refs) -> Refs,
    {
        let mut outcome = PushOutcome {
            agent: self.negotiated.agent.clone(),
            ..Default::default()
        };
        let mut new_refs = update_refs(peer_refs);

        let unchanged = new_refs
            .iter()
            .all(|(name, id)| peer_refs.get(name) == Some(id));
        if unchanged {
            tracing::debug!("nothing to push");
            writer.flush_pkt()?;
            writer.flush()?;
            return Ok(outcome);
        }

        if !self.negotiated.has(DELETE_REFS) {
            new_refs.retain(|name, id| {
                if id.is_zero() && peer_refs.contains_key(name) {
                    tracing::warn!(ref_name = %name, "receiver cannot delete refs");
                    outcome.ref_status.insert(
                        name.clone(),
                        RefStatus::Rejected(DELETE_UNSUPPORTED.to_string()),
                    );
                    false
                } else {
                    true
                }
            });
        }

        outcome.commands = new_refs
            .iter()
            .filter_map(|(name, new)| {
                let old = peer_refs.get(name).copied().unwrap_or(ZERO_ID);
                (old != *new).then(|| RefUpdate {
                    old,
                    new: *new,
                    name: name.clone(),
                })
            })
            .collect();

        if outcome.commands.is_empty() {
            writer.flush_pkt()?;
            writer.flush()?;
            return Ok(outcome);
        }

        if !push_options.is_empty() && !self.negotiated.has(PUSH_OPTIONS) {
            return Err(WireError::protocol("the receiver does not support push options"));
        }

        let caps = self.request_capabilities();
        for (i, command) in outcome.commands.iter().enumerate() {
            if i == 0 {
                writer.write_data(first_command_line(command, &caps).as_bytes())?;
            } else {
                writer.write_line(&command.to_string())?;
            }
        }
        writer.flush_pkt()?;
        if !push_options.is_empty() {
            for option in push_options {
                writer.write_line(option)?;
            }
            writer.flush_pkt()?;
        }
        tracing::debug!(commands = outcome.commands.len(), "sent update commands");

        let haves: Vec<ObjectId> = peer_refs
            .values()
            .filter(|id| !id.is_zero())
            .copied()
            .collect();
        let mut wants: Vec<ObjectId> = Vec::new();
        for command in &outcome.commands {
            let new = command.new;
            if !new.is_zero() && !haves.contains(&new) && !wants.contains(&new) {
                wants.push(new);
            }
        }

        if outcome.commands.iter().any(|c| !c.new.is_zero()) {
            let (count, chunks) = pack_source.generate_pack_data(
                &haves,
                &wants,
                self.negotiated.has(OFS_DELTA),
            )?;
            for chunk in chunks {
                writer.write_raw(&chunk)?;
            }
            tracing::debug!(objects = count, "sent pack");
            outcome.pack_objects = Some(count);
        }
        writer.flush()?;

        let report = self.read_report(reader, progress)?;
        outcome.ref_status.extend(report);
        tracing::debug!(
            agent = self.config.agent.as_str(),
            refs = outcome.ref_status.len(),
            "push finished"
        );
        Ok(outcome)
    }

    /// Reads the receiver's answer.
    ///
    /// Without `report-status` only sideband progress is consumed and the
    /// returned map is empty.
    fn read_report<R: Read>(
        &self,
        reader: &mut PktLineReader<R>,
        progress: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<BTreeMap<String, RefStatus>> {
        let report_status = self.negotiated.has(REPORT_STATUS);
        let mode = self.sideband_mode();
        let mut parser = ReportStatusParser::new();

        if mode.is_multiplexed() {
            let mut lines = PktLineParser::new(|pkt: PktLine| parser.handle_packet(pkt.data()));
            {
                let mut on_data = |data: &[u8]| {
                    if report_status {
                        lines.feed(data)
                    } else {
                        Ok(())
                    }
                };
                let mut handlers = SidebandHandlers::new(&mut on_data);
                if let Some(progress) = progress {
                    handlers = handlers.with_progress(progress);
                }
                demultiplex(reader, mode, &mut handlers)?;
            }
            if !lines.tail().is_empty() {
                return Err(WireError::protocol(format!(
                    "status report cut off with {} bytes of a partial pkt-line",
                    lines.tail().len()
                )));
            }
        } else if report_status {
            loop {
                let pkt = reader.read()?;
                parser.handle_packet(pkt.data())?;
                if pkt.is_flush() {
                    break;
                }
            }
        } else {
            return Ok(BTreeMap::new());
        }

        if report_status {
            parser.check()
        } else {
            Ok(BTreeMap::new())
        }
    }
}

/// First command line; the capability list follows a NUL byte only when non-empty.
fn first_command_line(command: &RefUpdate, caps: &str) -> String {
    if caps.is_empty() {
        format!("{}\n", command)
    } else {
        format!("{}\0{}\n", command, caps)
    }
}

/// Update commands received by the receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    /// Commands in the order received.
    pub commands: Vec<RefUpdate>,
    /// Capabilities from the first command.
    pub capabilities: CapabilitySet,
    /// Push options, when `push-options` was requested.
    pub push_options: Vec<String>,
}

/// Reads update commands up to the flush, then the push options if requested.
pub fn read_update_commands<R: Read>(reader: &mut PktLineReader<R>) -> Result<UpdateRequest> {
    let mut request = UpdateRequest::default();
    for line in reader.read_seq() {
        let line = line?;
        let command = if request.commands.is_empty() {
            let (rest, caps) = split_capabilities(trim_newline(&line))?;
            request.capabilities = caps;
            RefUpdate::parse(rest)?
        } else {
            RefUpdate::parse(&line)?
        };
        request.commands.push(command);
    }

    if !request.commands.is_empty() && request.capabilities.contains(PUSH_OPTIONS) {
        for option in reader.read_seq() {
            let option = option?;
            let option = std::str::from_utf8(trim_newline(&option))
                .map_err(|_| WireError::protocol("push option is not valid UTF-8"))?;
            request.push_options.push(option.to_string());
        }
    }

    tracing::debug!(
        commands = request.commands.len(),
        capabilities = %request.capabilities,
        "read update commands"
    );
    Ok(request)
}
