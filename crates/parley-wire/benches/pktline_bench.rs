//! Pkt-line benchmarks for Parley.
//!
//! Covers the hot paths of a large fetch:
//! - Writing have lines through the batching writer
//! - Reading framed lines back
//! - Incremental parsing of sideband payloads

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parley_wire::{
    BufferedPktLineWriter, ObjectId, PktLine, PktLineParser, PktLineReader, PktLineWriter,
    WritePkt,
};
use std::io::Cursor;

fn have_lines(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let mut bytes = [0u8; 20];
            bytes[..8].copy_from_slice(&(i as u64).to_be_bytes());
            format!("have {}", ObjectId::from_bytes(bytes))
        })
        .collect()
}

fn encoded(lines: &[String]) -> Vec<u8> {
    let mut writer = PktLineWriter::new(Vec::new());
    for line in lines {
        writer.write_line(line).unwrap();
    }
    writer.flush_pkt().unwrap();
    writer.into_inner()
}

/// Benchmark batched writes of have lines
fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("pktline_write");

    for count in [32, 256, 4_096].iter() {
        let lines = have_lines(*count);
        group.throughput(Throughput::Elements(*count as u64));

        group.bench_with_input(BenchmarkId::new("buffered", count), &lines, |b, lines| {
            b.iter(|| {
                let mut writer = BufferedPktLineWriter::new(Vec::with_capacity(lines.len() * 50));
                for line in lines {
                    writer.write_line(line).unwrap();
                }
                writer.flush_pkt().unwrap();
                black_box(writer.into_inner().unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark reading framed lines
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("pktline_read");

    for count in [32, 256, 4_096].iter() {
        let wire = encoded(&have_lines(*count));
        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_with_input(BenchmarkId::new("reader", count), &wire, |b, wire| {
            b.iter(|| {
                let mut reader = PktLineReader::new(Cursor::new(wire.as_slice()));
                black_box(reader.read_until_flush().unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark feeding a stream in sideband-sized pieces
fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("pktline_parser");
    let wire = encoded(&have_lines(4_096));
    group.throughput(Throughput::Bytes(wire.len() as u64));

    for chunk in [995, 65_515].iter() {
        group.bench_with_input(BenchmarkId::new("feed", chunk), chunk, |b, &chunk| {
            b.iter(|| {
                let mut lines = 0usize;
                let mut parser = PktLineParser::new(|pkt: PktLine| {
                    if !pkt.is_flush() {
                        lines += 1;
                    }
                    Ok(())
                });
                for piece in wire.chunks(chunk) {
                    parser.feed(piece).unwrap();
                }
                drop(parser);
                black_box(lines)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write, bench_read, bench_parser);
criterion_main!(benches);
