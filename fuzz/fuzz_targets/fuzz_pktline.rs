//! Fuzz target for pkt-line framing.
//!
//! The blocking reader and the incremental parser must agree on every input
//! and never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_wire::{PktLine, PktLineParser, PktLineReader};
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut read = Vec::new();
    let mut reader = PktLineReader::new(Cursor::new(data));
    // bounded so crafted input cannot spin forever
    for _ in 0..1000 {
        match reader.try_read() {
            Ok(Some(pkt)) => read.push(pkt),
            Ok(None) | Err(_) => break,
        }
    }

    let mut parsed = Vec::new();
    let mut parser = PktLineParser::new(|pkt: PktLine| {
        parsed.push(pkt);
        Ok(())
    });
    // split the input to exercise frames spanning chunks
    for chunk in data.chunks(7) {
        if parser.feed(chunk).is_err() {
            break;
        }
    }
    drop(parser);

    let common = read.len().min(parsed.len());
    assert_eq!(read[..common], parsed[..common]);
});
