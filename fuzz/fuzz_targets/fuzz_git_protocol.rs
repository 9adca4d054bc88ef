//! Fuzz target for negotiation line parsing.
//!
//! Feeds arbitrary bytes to every parser a peer can reach: the ref
//! advertisement, want requests, update commands and single ack or shallow
//! lines.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_wire::{
    read_advertisement, read_update_commands, read_want_request, AckLine, PktLineReader, Refs,
    ShallowCommand,
};
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let _ = read_advertisement(&mut PktLineReader::new(Cursor::new(data)));
    let _ = read_want_request(&mut PktLineReader::new(Cursor::new(data)), &Refs::new());
    let _ = read_update_commands(&mut PktLineReader::new(Cursor::new(data)));

    for line in data.split(|&b| b == b'\n') {
        let _ = AckLine::parse(line);
        let _ = ShallowCommand::parse(line);
    }
});
