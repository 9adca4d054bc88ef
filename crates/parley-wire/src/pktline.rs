//! Git pkt-line format implementation.
//!
//! The pkt-line format is used for all git protocol communication.
//! Each line is prefixed with a 4-character lowercase hex length that counts
//! the prefix itself, or "0000" for flush.

use crate::{Result, WireError};
use std::io::{ErrorKind, Read, Write};

/// Largest encoded frame, header included.
pub const MAX_PKT_LEN: usize = 65520;
/// Largest payload a single frame can carry.
pub const MAX_PKT_DATA_LEN: usize = MAX_PKT_LEN - 4;
/// Default byte budget of [`BufferedPktLineWriter`].
pub const DEFAULT_WRITE_BUFFER: usize = 65515;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet, appending to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Data(data) => {
                if data.len() > MAX_PKT_DATA_LEN {
                    return Err(WireError::InvalidPktLine(format!(
                        "payload of {} bytes exceeds {} bytes",
                        data.len(),
                        MAX_PKT_DATA_LEN
                    )));
                }
                out.extend_from_slice(format!("{:04x}", data.len() + 4).as_bytes());
                out.extend_from_slice(data);
            }
            Self::Flush => out.extend_from_slice(b"0000"),
        }
        Ok(())
    }

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data().map_or(4, |d| d.len() + 4));
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for flush.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            Self::Flush => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Decodes a 4-byte length prefix. Returns 0 for flush, otherwise the full frame length.
fn parse_len(prefix: &[u8]) -> Result<usize> {
    if prefix.len() != 4 || !prefix.iter().all(u8::is_ascii_hexdigit) {
        return Err(WireError::InvalidPktLine(format!(
            "invalid length prefix {:?}",
            String::from_utf8_lossy(prefix)
        )));
    }
    // all four bytes are ASCII hex digits, so the slice is valid UTF-8
    let text = std::str::from_utf8(prefix)
        .map_err(|_| WireError::InvalidPktLine("invalid length prefix".to_string()))?;
    let len = usize::from_str_radix(text, 16)
        .map_err(|_| WireError::InvalidPktLine("invalid length".to_string()))?;
    match len {
        0 => Ok(0),
        1..=3 => Err(WireError::InvalidPktLine(format!("length {} too small", len))),
        n if n > MAX_PKT_LEN => Err(WireError::InvalidPktLine(format!(
            "length {} exceeds {}",
            n, MAX_PKT_LEN
        ))),
        n => Ok(n),
    }
}

/// Fills `buf` as far as the source allows, returning how many bytes were read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof
                ) =>
            {
                return Err(WireError::Hangup)
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Reader for pkt-line format, with a single frame of look-ahead.
pub struct PktLineReader<R> {
    reader: R,
    unread: Option<PktLine>,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            unread: None,
        }
    }

    /// Reads the next packet, or `None` when the source closed cleanly at a frame boundary.
    ///
    /// A source that closes part way through a frame is a [`WireError::Hangup`].
    pub fn try_read(&mut self) -> Result<Option<PktLine>> {
        if let Some(pkt) = self.unread.take() {
            return Ok(Some(pkt));
        }

        let mut len_buf = [0u8; 4];
        match read_full(&mut self.reader, &mut len_buf)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(WireError::Hangup),
        }

        let len = parse_len(&len_buf)?;
        if len == 0 {
            tracing::trace!("pkt-line < flush");
            return Ok(Some(PktLine::Flush));
        }

        let mut data = vec![0u8; len - 4];
        if read_full(&mut self.reader, &mut data)? < data.len() {
            return Err(WireError::Hangup);
        }
        tracing::trace!(len = data.len(), "pkt-line < data");
        Ok(Some(PktLine::Data(data)))
    }

    /// Reads the next packet. A closed source is a [`WireError::Hangup`], never a flush.
    pub fn read(&mut self) -> Result<PktLine> {
        self.try_read()?.ok_or(WireError::Hangup)
    }

    /// Reads the next packet, returning its payload or `None` for flush.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        match self.read()? {
            PktLine::Data(data) => Ok(Some(data)),
            PktLine::Flush => Ok(None),
        }
    }

    /// Pushes one packet back so the next read returns it.
    ///
    /// Only one packet can be held; a second call before it is consumed fails.
    pub fn unread(&mut self, pkt: PktLine) -> Result<()> {
        if self.unread.is_some() {
            return Err(WireError::protocol("attempted to unread multiple pkt-lines"));
        }
        self.unread = Some(pkt);
        Ok(())
    }

    /// Takes the packet held by [`PktLineReader::unread`], if any.
    pub fn take_unread(&mut self) -> Option<PktLine> {
        self.unread.take()
    }

    /// Returns a lazy sequence of payloads that ends at (and consumes) the next flush.
    pub fn read_seq(&mut self) -> PktLineSeq<'_, R> {
        PktLineSeq {
            reader: self,
            finished: false,
        }
    }

    /// Reads all payloads until a flush packet.
    pub fn read_until_flush(&mut self) -> Result<Vec<Vec<u8>>> {
        self.read_seq().collect()
    }

    /// Returns a mutable reference to the inner reader.
    ///
    /// Bytes held by [`PktLineReader::unread`] are not visible through it; see
    /// [`PktLineReader::take_unread`].
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Payloads up to the next flush; see [`PktLineReader::read_seq`].
pub struct PktLineSeq<'a, R> {
    reader: &'a mut PktLineReader<R>,
    finished: bool,
}

impl<R: Read> Iterator for PktLineSeq<'_, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.reader.read() {
            Ok(PktLine::Data(data)) => Some(Ok(data)),
            Ok(PktLine::Flush) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Destination for pkt-lines, implemented by the direct and the buffered writer.
pub trait WritePkt {
    /// Writes a packet.
    fn write(&mut self, pkt: &PktLine) -> Result<()>;

    /// Writes bytes outside of pkt-line framing (raw pack data).
    fn write_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Pushes everything written so far to the transport.
    fn flush(&mut self) -> Result<()>;

    /// Writes a data line.
    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a string line (with newline).
    fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }
}

impl<T: WritePkt + ?Sized> WritePkt for &mut T {
    fn write(&mut self, pkt: &PktLine) -> Result<()> {
        (**self).write(pkt)
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_raw(data)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns a mutable reference to the inner writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> WritePkt for PktLineWriter<W> {
    fn write(&mut self, pkt: &PktLine) -> Result<()> {
        self.writer.write_all(&pkt.encode()?)?;
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writer that batches small frames into one underlying write.
///
/// Frames accumulate until the next one would push the buffer past the byte
/// budget; a frame larger than the whole budget is written straight through.
pub struct BufferedPktLineWriter<W> {
    writer: W,
    buf: Vec<u8>,
    budget: usize,
}

impl<W: Write> BufferedPktLineWriter<W> {
    /// Creates a buffered writer with [`DEFAULT_WRITE_BUFFER`] bytes of budget.
    pub fn new(writer: W) -> Self {
        Self::with_budget(writer, DEFAULT_WRITE_BUFFER)
    }

    /// Creates a buffered writer with a custom byte budget.
    pub fn with_budget(writer: W, budget: usize) -> Self {
        Self {
            writer,
            buf: Vec::with_capacity(budget.min(DEFAULT_WRITE_BUFFER)),
            budget,
        }
    }

    /// Number of encoded bytes waiting to be written.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn drain_buffer(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.writer.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Returns a reference to the inner writer.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Flushes pending frames and returns the inner writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.drain_buffer()?;
        Ok(self.writer)
    }
}

impl<W: Write> WritePkt for BufferedPktLineWriter<W> {
    fn write(&mut self, pkt: &PktLine) -> Result<()> {
        let encoded = pkt.encode()?;
        if !self.buf.is_empty() && self.buf.len() + encoded.len() > self.budget {
            self.drain_buffer()?;
        }
        if encoded.len() > self.budget {
            self.writer.write_all(&encoded)?;
        } else {
            self.buf.extend_from_slice(&encoded);
        }
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.drain_buffer()?;
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.drain_buffer()?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Incremental pkt-line parser for transports that deliver arbitrary chunks.
///
/// Complete frames are handed to the handler as soon as they are assembled;
/// an incomplete frame stays in the tail buffer until more bytes arrive.
pub struct PktLineParser<F> {
    buf: Vec<u8>,
    handler: F,
}

impl<F> PktLineParser<F>
where
    F: FnMut(PktLine) -> Result<()>,
{
    /// Creates a parser that calls `handler` once per complete frame.
    pub fn new(handler: F) -> Self {
        Self {
            buf: Vec::new(),
            handler,
        }
    }

    /// Feeds a chunk of bytes.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        let mut pos = 0;
        while self.buf.len() - pos >= 4 {
            let len = parse_len(&self.buf[pos..pos + 4])?;
            if len == 0 {
                pos += 4;
                (self.handler)(PktLine::Flush)?;
                continue;
            }
            if self.buf.len() - pos < len {
                break;
            }
            let payload = self.buf[pos + 4..pos + len].to_vec();
            pos += len;
            (self.handler)(PktLine::Data(payload))?;
        }
        self.buf.drain(..pos);
        Ok(())
    }

    /// Bytes received that do not yet form a complete frame.
    pub fn tail(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the parser and returns the handler.
    pub fn into_handler(self) -> F {
        self.handler
    }
}
