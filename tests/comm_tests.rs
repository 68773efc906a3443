//! Two registries talking over an in-memory channel.


use std::sync::Arc;

use dmreg_core::config::RegistryConfig;
use dmreg_core::schema::{Binding, SchemaTree};
use dmreg_core::QueryId;
use dmreg_exec::{Engine, ExecError, Peer};
use dmreg_query::{Ownership, QueryFlags};
use dmreg_reloc::{Channel, MemoryChannel};
use test_fixtures::*;

fn fast_engine() -> Engine {
    let cfg = RegistryConfig {
        comm_poll_interval_ms: 5,
        ..RegistryConfig::default()
    };
    Engine::new(cfg).unwrap()
}

/// The far side's base differs from the local one, so every block is rebased.
const REMOTE_BASE: u64 = 0x40_0000;

#[test]
fn schema_and_queries_cross_the_channel() {
    let (near, far) = MemoryChannel::pair();
    let mut engine = fast_engine();
    let (cb, rx) = channel_callback();
    engine.attach_channel(Arc::new(far), cb).unwrap();
    let peer = Peer::new(Arc::new(near), REMOTE_BASE);

    let providers = NetProviders::default();
    let tree = net_schema(&providers);
    peer.send_schema(&tree).unwrap();
    assert!(wait_until(WAIT, || engine.registry().read_tree(|t| t.resolve(ON_RX).is_some())));

    // callbacks stay on the sending side
    let on_rx = engine.registry().read_tree(|t| {
        let n = t.node(t.resolve(ON_RX).unwrap()).unwrap();
        matches!(&n.payload, dmreg_core::schema::Payload::Event { provider: Binding::Remote, .. })
    });
    assert!(on_rx);

    let mut q = proto_query(42, discard());
    q.id = QueryId::new(77);
    peer.send_queries(&[q]).unwrap();
    assert!(wait_until(WAIT, || engine.registry().query_ids().len() == 1));
    let local = engine.registry().query_ids()[0];
    let received = engine.registry().query(local).unwrap();
    assert_eq!(received.ownership, Ownership::Transferred);
    assert!(received.flags.has(QueryFlags::TRANSFERRED));
    assert!(received.size_bytes > 0);

    engine
        .registry()
        .produce_event(ON_RX, packet(&tree, 42, 60))
        .unwrap();
    let (id, t) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(id, local);
    assert_eq!(t.get_int(&tree, MAC_PROTOCOL).unwrap(), 42);

    // the sender ran stream and filter; resume at the select
    peer.send_continue(&tree, QueryId::new(77), 2, &[packet(&tree, 7, 61), packet(&tree, 8, 62)])
        .unwrap();
    let mut protos = Vec::new();
    for _ in 0..2 {
        let (id, t) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(id, local);
        assert_eq!(t.len(), 1);
        protos.push(t.get_int(&tree, MAC_PROTOCOL).unwrap());
    }
    protos.sort();
    assert_eq!(protos, [7, 8]);

    peer.send_query_delete(&[QueryId::new(77)]).unwrap();
    assert!(wait_until(WAIT, || engine.registry().query_ids().is_empty()));

    peer.send_schema_delete(&tree).unwrap();
    assert!(wait_until(WAIT, || engine.registry().read_tree(SchemaTree::is_empty)));
    assert_eq!(engine.metrics().messages_handled, 5);
    assert_eq!(engine.metrics().messages_failed, 0);
}

#[test]
fn snapshot_request_is_answered_with_the_peer_tree() {
    let (a_end, b_end) = MemoryChannel::pair();
    let mut a = fast_engine();
    let mut b = fast_engine();
    let providers = NetProviders::default();
    a.registry()
        .register_provider(Some(&net_schema(&providers)), Vec::new())
        .unwrap();

    a.attach_channel(Arc::new(a_end), discard()).unwrap();
    let to_a = b.attach_channel(Arc::new(b_end), discard()).unwrap();
    assert!(b.peer_snapshot().is_none());

    to_a.request_snapshot().unwrap();
    assert!(wait_until(WAIT, || b.peer_snapshot().is_some()));

    let theirs = b.peer_snapshot().unwrap();
    let mine = a.registry().snapshot();
    assert!(mine.structurally_eq(mine.root().unwrap(), &theirs, theirs.root().unwrap()));
    // a snapshot is informational; the local tree is untouched
    assert!(b.registry().read_tree(SchemaTree::is_empty));
}

#[test]
fn bad_messages_are_dropped_and_the_link_keeps_running() {
    let (near, far) = MemoryChannel::pair();
    let near = Arc::new(near);
    let mut engine = fast_engine();
    engine.attach_channel(Arc::new(far), discard()).unwrap();
    let raw: Arc<dyn Channel> = near.clone();
    let peer = Peer::new(raw, REMOTE_BASE);

    near.send(vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
    // deleting something the registry never had
    peer.send_schema_delete(&remote_net_schema()).unwrap();
    // a continue for a query nobody registered
    peer.send_continue(&remote_net_schema(), QueryId::new(5), 1, &[])
        .unwrap();
    assert!(wait_until(WAIT, || engine.metrics().messages_failed == 3));

    peer.send_schema(&remote_net_schema()).unwrap();
    assert!(wait_until(WAIT, || engine.metrics().messages_handled == 1));
    assert!(engine.registry().read_tree(|t| t.resolve(PACKET).is_some()));
}

#[test]
fn only_one_channel_per_engine() {
    let (a, b) = MemoryChannel::pair();
    let mut engine = fast_engine();
    engine.attach_channel(Arc::new(a), discard()).unwrap();
    let err = engine.attach_channel(Arc::new(b), discard()).unwrap_err();
    assert!(matches!(err, ExecError::ChannelAttached));
}
