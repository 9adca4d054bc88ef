//! End-to-end fetch: a requester and a provider talking over an in-memory
//! connection, one on each thread.

mod common;

use common::{connection, init_tracing, oid, Endpoint, MemoryGraph};
use parley_wire::caps::NO_DONE;
use parley_wire::{
    ack_strategy, exchange_haves, handle_shallow_request, read_advertisement, read_want_request,
    write_advertisement, AckStyle, CapabilitySet, FetchNegotiator, FetchState, GraphWalker,
    NegotiationConfig, ObjectId, PktLineReader, PktLineWriter, ProtocolWalker, Refs, Result,
    ShallowUpdate, SidebandHandlers, SidebandMode, SidebandWriter, WireError,
};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::thread;

const PACK: &[u8] = b"PACK\x00\x00\x00\x02fake objects";

/// Provider side of one upload: advertisement, wants, shallow, haves, pack.
fn serve_upload(endpoint: Endpoint, graph: MemoryGraph, refs: Refs, caps: &str) -> Result<bool> {
    let config = NegotiationConfig::default();
    let Endpoint { reader, writer } = endpoint;
    let mut reader = PktLineReader::new(reader);
    let mut writer = config.writer(writer);
    let caps = CapabilitySet::parse(caps)?;

    write_advertisement(&mut writer, &refs, &caps, None)?;

    let request = read_want_request(&mut reader, &refs)?;
    if request.wants.is_empty() {
        return Ok(false);
    }
    if let Some(depth) = request.depth {
        handle_shallow_request(
            &graph,
            &request.wants,
            &request.client_shallow,
            depth,
            &mut writer,
        )?;
    }

    let style = AckStyle::from_capabilities(&request.capabilities);
    let done_required = !request.capabilities.contains(NO_DONE);
    let exchange = {
        let walker = ProtocolWalker::new(
            &mut reader,
            &mut writer,
            Box::new(|common: &[ObjectId]| !common.is_empty()),
            config.stateless,
        );
        let mut strategy = ack_strategy(style, walker);
        exchange_haves(strategy.as_mut(), |id| graph.contains(id), done_required)?
    };
    if !exchange.send_pack {
        return Ok(false);
    }

    let mode = SidebandMode::from_capabilities(&request.capabilities);
    let mut sideband = SidebandWriter::new(&mut writer, mode);
    if mode.is_multiplexed() {
        sideband.progress("Counting objects: 2, done.\n")?;
    }
    sideband.write_all(PACK)?;
    sideband.finish()?;
    writer.into_inner()?;
    Ok(true)
}

/// Local history: announces its commits newest first.
struct LocalHistory {
    haves: Vec<ObjectId>,
    shallow: Vec<ObjectId>,
    acked: Vec<ObjectId>,
    naks: usize,
    update: Option<ShallowUpdate>,
}

impl LocalHistory {
    fn new(haves: Vec<ObjectId>) -> Self {
        Self {
            haves,
            shallow: Vec::new(),
            acked: Vec::new(),
            naks: 0,
            update: None,
        }
    }
}

impl GraphWalker for LocalHistory {
    fn next_have(&mut self) -> Result<Option<ObjectId>> {
        Ok(if self.haves.is_empty() {
            None
        } else {
            Some(self.haves.remove(0))
        })
    }

    fn ack(&mut self, id: &ObjectId) {
        self.acked.push(*id);
    }

    fn nak(&mut self) {
        self.naks += 1;
    }

    fn shallow(&self) -> std::collections::BTreeSet<ObjectId> {
        self.shallow.iter().copied().collect()
    }

    fn update_shallow(&mut self, update: &ShallowUpdate) {
        self.update = Some(update.clone());
    }
}

struct Fetched {
    pack: Vec<u8>,
    progress: Vec<u8>,
    common: Vec<ObjectId>,
    shallow: Option<ShallowUpdate>,
    style: AckStyle,
}

fn fetch(
    caps: &str,
    local: &mut LocalHistory,
    wants: &[ObjectId],
    depth: Option<u32>,
) -> Result<Fetched> {
    init_tracing();
    let graph = MemoryGraph::linear(4);
    let refs = Refs::from([
        ("HEAD".to_string(), oid(4)),
        ("refs/heads/main".to_string(), oid(4)),
    ]);
    let (client, server) = connection();
    let caps = caps.to_string();
    let provider = thread::spawn(move || serve_upload(server, graph, refs, &caps));

    let config = NegotiationConfig::default();
    let Endpoint { reader, writer } = client;
    let mut reader = PktLineReader::new(reader);
    let mut writer = PktLineWriter::new(writer);
    let advertisement = read_advertisement(&mut reader)?;
    let mut negotiator = FetchNegotiator::new(&config, &advertisement)?;

    let mut pack = Vec::new();
    let mut progress = Vec::new();
    let mut on_pack = |data: &[u8]| {
        pack.extend_from_slice(data);
        Ok(())
    };
    let mut on_progress = |data: &[u8]| progress.extend_from_slice(data);
    let mut handlers = SidebandHandlers::new(&mut on_pack).with_progress(&mut on_progress);
    let outcome = negotiator.fetch(
        &mut reader,
        &mut writer,
        local,
        wants,
        depth,
        None,
        &mut handlers,
    )?;
    drop(handlers);
    drop(writer);

    provider.join().expect("provider thread panicked")?;
    assert_eq!(negotiator.state(), FetchState::Finished);
    Ok(Fetched {
        pack,
        progress,
        common: outcome.common,
        shallow: outcome.shallow_update,
        style: negotiator.ack_style(),
    })
}

#[test]
fn test_fetch_multi_ack_detailed() {
    let mut local = LocalHistory::new(vec![oid(2), oid(1)]);
    let fetched = fetch(
        "multi_ack multi_ack_detailed side-band-64k ofs-delta",
        &mut local,
        &[oid(4)],
        None,
    )
    .unwrap();

    assert_eq!(fetched.style, AckStyle::MultiDetailed);
    assert_eq!(fetched.pack, PACK);
    assert_eq!(fetched.progress, b"Counting objects: 2, done.\n");
    assert_eq!(fetched.common, vec![oid(2), oid(1)]);
    assert!(local.acked.contains(&oid(2)));
}

#[test]
fn test_fetch_multi_ack() {
    let mut local = LocalHistory::new(vec![oid(2), oid(1)]);
    let fetched = fetch("multi_ack side-band-64k", &mut local, &[oid(4)], None).unwrap();

    assert_eq!(fetched.style, AckStyle::Multi);
    assert_eq!(fetched.pack, PACK);
    assert_eq!(fetched.common, vec![oid(2), oid(1)]);
}

#[test]
fn test_fetch_plain_ack_basic_sideband() {
    let mut local = LocalHistory::new(vec![oid(2), oid(1)]);
    let fetched = fetch("side-band ofs-delta", &mut local, &[oid(4)], None).unwrap();

    assert_eq!(fetched.style, AckStyle::Plain);
    assert_eq!(fetched.pack, PACK);
    assert_eq!(fetched.common, vec![oid(2)]);
    assert_eq!(local.acked, vec![oid(2)]);
}

#[test]
fn test_fetch_without_sideband_reads_raw_pack() {
    let mut local = LocalHistory::new(vec![oid(9)]);
    let fetched = fetch("multi_ack_detailed", &mut local, &[oid(4)], None).unwrap();

    assert_eq!(fetched.pack, PACK);
    assert!(fetched.progress.is_empty());
    assert!(fetched.common.is_empty());
    assert_eq!(local.naks, 1);
}

#[test]
fn test_fetch_with_depth() {
    let mut local = LocalHistory::new(Vec::new());
    let fetched = fetch(
        "multi_ack_detailed side-band-64k shallow",
        &mut local,
        &[oid(4)],
        Some(2),
    )
    .unwrap();

    let update = fetched.shallow.unwrap();
    assert_eq!(update.shallow, [oid(3)].into_iter().collect());
    assert!(update.unshallow.is_empty());
    assert_eq!(local.update, Some(update));
    assert_eq!(fetched.pack, PACK);
}

#[test]
fn test_deepen_unshallows_client_boundary() {
    let mut local = LocalHistory::new(vec![oid(4)]);
    local.shallow = vec![oid(4)];
    let fetched = fetch(
        "multi_ack_detailed side-band-64k shallow",
        &mut local,
        &[oid(4)],
        Some(3),
    )
    .unwrap();

    let update = fetched.shallow.unwrap();
    assert_eq!(update.shallow, [oid(2)].into_iter().collect());
    assert_eq!(update.unshallow, [oid(4)].into_iter().collect());
}

#[test]
fn test_fetch_unadvertised_want_fails_before_sending() {
    let mut local = LocalHistory::new(Vec::new());
    let result = fetch("multi_ack side-band-64k", &mut local, &[oid(7)], None);
    // nothing was sent; the provider is left waiting on a closed connection
    assert!(matches!(result, Err(WireError::InvalidWants(ids)) if ids == vec![oid(7)]));
}
