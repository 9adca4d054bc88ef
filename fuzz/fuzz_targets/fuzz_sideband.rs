//! Fuzz target for sideband demultiplexing.
//!
//! The first byte picks the mode; the rest is the stream.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_wire::{demultiplex, PktLineReader, SidebandHandlers, SidebandMode};
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, stream)) = data.split_first() else {
        return;
    };
    let mode = match selector % 3 {
        0 => SidebandMode::None,
        1 => SidebandMode::Basic,
        _ => SidebandMode::Large,
    };

    let mut pack = 0usize;
    let mut on_pack = |d: &[u8]| {
        pack += d.len();
        Ok(())
    };
    let mut on_progress = |_: &[u8]| {};
    let mut handlers = SidebandHandlers::new(&mut on_pack).with_progress(&mut on_progress);
    let mut reader = PktLineReader::new(Cursor::new(stream));
    let _ = demultiplex(&mut reader, mode, &mut handlers);
    drop(handlers);

    if mode == SidebandMode::None {
        assert_eq!(pack, stream.len());
    }
});
