//! Shared helpers for the end-to-end negotiation tests.

#![allow(dead_code)]

use parley_wire::{CommitGraph, ObjectId, Result, WireError};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, Sender};
use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley_wire=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Writing half of an in-memory byte pipe.
pub struct PipeWriter(Sender<Vec<u8>>);

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !buf.is_empty() {
            self.0
                .send(buf.to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reading half of an in-memory byte pipe. Reports end of data once the
/// writer is dropped.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Creates a one-way pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = channel();
    (
        PipeWriter(tx),
        PipeReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

/// One side of a two-way connection.
pub struct Endpoint {
    pub reader: PipeReader,
    pub writer: PipeWriter,
}

/// Creates a connected pair of endpoints.
pub fn connection() -> (Endpoint, Endpoint) {
    let (a_writer, b_reader) = pipe();
    let (b_writer, a_reader) = pipe();
    (
        Endpoint {
            reader: a_reader,
            writer: a_writer,
        },
        Endpoint {
            reader: b_reader,
            writer: b_writer,
        },
    )
}

pub fn oid(byte: u8) -> ObjectId {
    ObjectId::from_bytes([byte; 20])
}

/// In-memory commit graph keyed by id.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    parents: HashMap<ObjectId, Vec<ObjectId>>,
}

impl MemoryGraph {
    /// A linear history `1 <- 2 <- ... <- n`.
    pub fn linear(n: u8) -> Self {
        let mut graph = Self::default();
        for i in 1..=n {
            let parents = if i == 1 { vec![] } else { vec![oid(i - 1)] };
            graph.parents.insert(oid(i), parents);
        }
        graph
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.parents.contains_key(id)
    }
}

impl CommitGraph for MemoryGraph {
    fn parents(&self, id: &ObjectId) -> Result<Vec<ObjectId>> {
        self.parents
            .get(id)
            .cloned()
            .ok_or_else(|| WireError::Protocol(format!("unknown commit {}", id)))
    }
}
