//! Sideband multiplexing.
//!
//! With `side-band` or `side-band-64k` negotiated, every pkt-line of the pack
//! phase starts with a channel byte: 1 carries pack data, 2 progress text and
//! 3 a fatal error message. Without it the pack is sent as raw bytes and the
//! progress and error channels do not exist.

use crate::capabilities::{CapabilitySet, SIDE_BAND, SIDE_BAND_64K};
use crate::pktline::{PktLine, PktLineReader, WritePkt, MAX_PKT_DATA_LEN};
use crate::{Result, WireError};
use std::io::{self, Read};

/// Data bytes per frame with `side-band-64k`.
pub const LARGE_SIDEBAND_DATA: usize = MAX_PKT_DATA_LEN - 1;
/// Data bytes per frame with plain `side-band` (1000-byte frames).
pub const BASIC_SIDEBAND_DATA: usize = 1000 - 4 - 1;

/// Size of the chunks read from a raw (non-multiplexed) pack stream.
const RAW_READ_SIZE: usize = 64 * 1024;

/// A sideband channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Pack data.
    PackData = 1,
    /// Human-readable progress.
    Progress = 2,
    /// Fatal error text.
    Fatal = 3,
}

impl Channel {
    /// Decodes a channel tag.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::PackData),
            2 => Ok(Self::Progress),
            3 => Ok(Self::Fatal),
            other => Err(WireError::protocol(format!(
                "invalid sideband channel {}",
                other
            ))),
        }
    }
}

/// Which multiplexing, if any, was negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebandMode {
    /// Raw pack stream.
    None,
    /// `side-band`: frames of at most 1000 bytes.
    Basic,
    /// `side-band-64k`: frames of at most 65520 bytes.
    Large,
}

impl SidebandMode {
    /// Picks the mode from negotiated capabilities, preferring `side-band-64k`.
    pub fn from_capabilities(caps: &CapabilitySet) -> Self {
        if caps.contains(SIDE_BAND_64K) {
            Self::Large
        } else if caps.contains(SIDE_BAND) {
            Self::Basic
        } else {
            Self::None
        }
    }

    /// Largest amount of channel data one frame may carry.
    pub fn max_data_len(&self) -> usize {
        match self {
            Self::None => MAX_PKT_DATA_LEN,
            Self::Basic => BASIC_SIDEBAND_DATA,
            Self::Large => LARGE_SIDEBAND_DATA,
        }
    }

    /// Returns true when frames carry a channel byte.
    pub fn is_multiplexed(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Callbacks receiving demultiplexed data.
pub struct SidebandHandlers<'a> {
    pack_data: &'a mut dyn FnMut(&[u8]) -> Result<()>,
    progress: Option<&'a mut dyn FnMut(&[u8])>,
    error: Option<&'a mut dyn FnMut(&[u8])>,
}

impl<'a> SidebandHandlers<'a> {
    /// Creates handlers that only consume pack data.
    pub fn new(pack_data: &'a mut dyn FnMut(&[u8]) -> Result<()>) -> Self {
        Self {
            pack_data,
            progress: None,
            error: None,
        }
    }

    /// Receives channel 2. Without it progress is dropped.
    pub fn with_progress(mut self, progress: &'a mut dyn FnMut(&[u8])) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Receives channel 3.
    ///
    /// Without it a channel 3 frame fails the transfer with
    /// [`WireError::Remote`] carrying the message, not [`WireError::Protocol`].
    pub fn with_error(mut self, error: &'a mut dyn FnMut(&[u8])) -> Self {
        self.error = Some(error);
        self
    }

    /// Routes one multiplexed frame to its handler.
    pub fn dispatch(&mut self, frame: &[u8]) -> Result<()> {
        let (&tag, data) = frame
            .split_first()
            .ok_or_else(|| WireError::protocol("empty sideband frame"))?;
        match Channel::from_tag(tag)? {
            Channel::PackData => (self.pack_data)(data),
            Channel::Progress => {
                match self.progress.as_mut() {
                    Some(progress) => progress(data),
                    None => tracing::trace!(len = data.len(), "dropping progress"),
                }
                Ok(())
            }
            Channel::Fatal => match self.error.as_mut() {
                Some(error) => {
                    error(data);
                    Ok(())
                }
                None => {
                    let msg = String::from_utf8_lossy(data).trim_end().to_string();
                    tracing::warn!(message = %msg, "remote reported a fatal error");
                    Err(WireError::Remote(msg))
                }
            },
        }
    }
}

/// Reads the pack phase of a connection, routing data to `handlers`.
///
/// Multiplexed streams end at a flush; raw streams end when the transport
/// signals end of data.
pub fn demultiplex<R: Read>(
    reader: &mut PktLineReader<R>,
    mode: SidebandMode,
    handlers: &mut SidebandHandlers<'_>,
) -> Result<()> {
    if mode.is_multiplexed() {
        for frame in reader.read_seq() {
            handlers.dispatch(&frame?)?;
        }
        return Ok(());
    }

    // a frame pushed back by the ack drain is the start of the raw pack
    if let Some(held) = reader.take_unread() {
        (handlers.pack_data)(&held.encode()?)?;
    }
    let inner = reader.inner_mut();
    let mut buf = vec![0u8; RAW_READ_SIZE];
    loop {
        let n = match inner.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        (handlers.pack_data)(&buf[..n])?;
    }
    Ok(())
}

/// Multiplexes outgoing data onto sideband channels (provider side).
pub struct SidebandWriter<W> {
    writer: W,
    mode: SidebandMode,
}

impl<W: WritePkt> SidebandWriter<W> {
    /// Wraps a pkt-line writer.
    pub fn new(writer: W, mode: SidebandMode) -> Self {
        Self { writer, mode }
    }

    /// Writes `data` on `channel`, split into frames that fit the mode.
    pub fn write_channel(&mut self, channel: Channel, data: &[u8]) -> Result<()> {
        if !self.mode.is_multiplexed() {
            return match channel {
                Channel::PackData => self.writer.write_raw(data),
                other => Err(WireError::protocol(format!(
                    "{:?} channel requires a negotiated sideband",
                    other
                ))),
            };
        }

        for chunk in data.chunks(self.mode.max_data_len()) {
            let mut frame = Vec::with_capacity(chunk.len() + 1);
            frame.push(channel as u8);
            frame.extend_from_slice(chunk);
            self.writer.write(&PktLine::Data(frame))?;
        }
        Ok(())
    }

    /// Sends progress text on channel 2.
    pub fn progress(&mut self, text: &str) -> Result<()> {
        self.write_channel(Channel::Progress, text.as_bytes())
    }

    /// Sends a fatal error on channel 3.
    pub fn fatal(&mut self, text: &str) -> Result<()> {
        self.write_channel(Channel::Fatal, text.as_bytes())
    }

    /// Ends a multiplexed stream with a flush.
    pub fn finish(mut self) -> Result<W> {
        if self.mode.is_multiplexed() {
            self.writer.flush_pkt()?;
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: WritePkt> io::Write for SidebandWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_channel(Channel::PackData, buf)
            .map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().map_err(io::Error::other)
    }
}
