//! Relocatable blocks: schema subtrees, compact tuples, tuple chains and
//! the frames carrying them.


use dmreg_core::schema::{Binding, Node, Payload, Primitive, SchemaTree, TypeRef};
use dmreg_core::tuple::{Tuple, Value};
use dmreg_core::ErrorKind;
use dmreg_reloc::schema_block::{pack_adjacent, pack_adjacent_at, rebase, unpack};
use dmreg_reloc::tuple_block::rebase_chain;
use dmreg_reloc::{pack, pack_chain, split_chain, unpack_chain, CompactTuple, Frame, MessageKind};
use test_fixtures::*;

const ROUTE: &str = "net.route";

/// ```text
/// net
///   hop   { addr: string, ttl: byte }
///   route { dest: string, hops: net.hop[], weights: float[] }
///   router [int]
///     onRoute -> net.route
/// ```
fn route_schema() -> SchemaTree {
    let mut tree = SchemaTree::new();
    let root = tree.root().unwrap();
    let net = tree.add(root, Node::namespace("net")).unwrap();
    let hop = tree.add(net, Node::complex("hop")).unwrap();
    tree.add(hop, Node::primitive("addr", Primitive::String)).unwrap();
    tree.add(hop, Node::primitive("ttl", Primitive::Byte)).unwrap();
    let route = tree.add(net, Node::complex("route")).unwrap();
    tree.add(route, Node::primitive("dest", Primitive::String)).unwrap();
    tree.add(route, Node::reference("hops", "net.hop").as_array()).unwrap();
    tree.add(route, Node::primitive("weights", Primitive::Float).as_array())
        .unwrap();
    let router = tree
        .add(net, Node::object("router", Primitive::Int, Binding::Remote))
        .unwrap();
    tree.add(
        router,
        Node::event("onRoute", TypeRef::complex(ROUTE), Binding::Remote),
    )
    .unwrap();
    tree
}

fn route_tuple(tree: &SchemaTree, dest: &str, hops: &[(&str, u8)]) -> Tuple {
    let hops = hops
        .iter()
        .map(|(addr, ttl)| Value::Complex(vec![Value::Str(addr.to_string()), Value::Byte(*ttl)]))
        .collect();
    let mut t = Tuple::with_timestamp(2, 1_700_000_000_000);
    t.push_item(
        tree,
        ROUTE,
        Value::Complex(vec![
            Value::Str(dest.into()),
            Value::Array(hops),
            Value::Array(vec![Value::Float(0.25), Value::Float(4.0)]),
        ]),
    )
    .unwrap();
    t.push_item(tree, "net.router", Value::Int(3)).unwrap();
    t
}

#[test]
fn schema_block_survives_a_rebase() {
    let providers = NetProviders::default();
    let tree = net_schema(&providers);
    let root = tree.root().unwrap();

    let mut block = pack_adjacent_at(&tree, root, 0x2000).unwrap();
    rebase(&mut block, 0x2000, 0x7f00_0000).unwrap();
    let back = unpack(&block, 0x7f00_0000).unwrap();
    assert!(tree.structurally_eq(root, &back, back.root().unwrap()));
    assert_eq!(back.len(), tree.len());

    // local callbacks come back as remote bindings
    let on_rx = back.node(back.resolve(ON_RX).unwrap()).unwrap();
    assert!(matches!(&on_rx.payload, Payload::Event { provider: Binding::Remote, .. }));
}

#[test]
fn schema_block_of_a_subtree_is_rooted_at_it() {
    let tree = route_schema();
    let route = tree.resolve(ROUTE).unwrap();
    let block = pack_adjacent(&tree, route).unwrap();
    let back = unpack(&block, 0).unwrap();
    let r = back.root().unwrap();
    assert_eq!(back.node(r).unwrap().name, "route");
    assert_eq!(back.children(r).len(), 3);
    let hops = back.resolve_from(r, "hops").unwrap();
    assert!(back.node(hops).unwrap().array);
}

#[test]
fn schema_block_read_at_the_wrong_base_is_rejected() {
    let tree = route_schema();
    let block = pack_adjacent_at(&tree, tree.root().unwrap(), 0x10_0000).unwrap();
    let err = unpack(&block, 0x20_0000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadBlock);
}

#[test]
fn compact_tuple_reads_match_the_expanded_form() {
    let tree = route_schema();
    let t = route_tuple(&tree, "10.0.0.0/8", &[("10.0.0.1", 64), ("10.1.0.1", 63)]);
    let compact = pack(&tree, &t, 0x5000).unwrap();

    assert_eq!(compact.as_bytes().len(), t.size_of(&tree).unwrap());
    let flags = compact.flags().unwrap();
    assert!(flags.is_compact());
    assert_eq!(flags.size(), compact.as_bytes().len());
    assert_eq!(compact.len().unwrap(), 2);
    assert_eq!(compact.item_name(0).unwrap(), ROUTE);
    assert_eq!(compact.timestamp().unwrap(), t.timestamp);

    assert_eq!(compact.get_string(&tree, "net.route.dest").unwrap(), "10.0.0.0/8");
    assert_eq!(compact.get_int(&tree, "net.router").unwrap(), 3);
    assert_eq!(compact.expand(&tree).unwrap(), t);
}

#[test]
fn compact_tuple_moves_between_address_spaces() {
    let tree = route_schema();
    let t = route_tuple(&tree, "192.168.0.0/16", &[("192.168.0.1", 1)]);
    let mut compact = pack(&tree, &t, 0x5000).unwrap();
    compact.rebase(&tree, 0x9_0000).unwrap();
    assert_eq!(compact.base(), 0x9_0000);

    // the receiver adopts the raw bytes at its own base
    let adopted = CompactTuple::from_bytes(compact.into_bytes(), 0x9_0000).unwrap();
    let back = adopted.expand(&tree).unwrap();
    assert_eq!(back, t);
    assert_eq!(
        back.get_array_slot(&tree, "net.route.hops", 0).unwrap(),
        &Value::Complex(vec![Value::Str("192.168.0.1".into()), Value::Byte(1)])
    );
}

#[test]
fn corrupted_compact_header_is_refused() {
    let tree = route_schema();
    let t = route_tuple(&tree, "x", &[]);
    let mut bytes = pack(&tree, &t, 0x5000).unwrap().into_bytes();
    bytes.truncate(bytes.len() - 1);
    let err = CompactTuple::from_bytes(bytes, 0x5000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadBlock);
}

#[test]
fn status_chain_rebases_as_a_unit() {
    let tree = route_schema();
    let tuples = vec![
        route_tuple(&tree, "a", &[("1.1.1.1", 9)]),
        route_tuple(&tree, "b", &[]),
        route_tuple(&tree, "c", &[("2.2.2.2", 8), ("3.3.3.3", 7)]),
    ];
    let mut chain = pack_chain(&tree, &tuples, 0x3000).unwrap();
    assert_eq!(split_chain(&chain, 0x3000).unwrap().len(), 3);

    rebase_chain(&tree, &mut chain, 0x3000, 0xabc_0000).unwrap();
    let back = unpack_chain(&tree, &chain, 0xabc_0000).unwrap();
    assert_eq!(back, tuples);
    assert!(pack_chain(&tree, &[], 0x3000).map(|c| c.len()).unwrap() == 8);
}

#[test]
fn framed_schema_block_round_trips() {
    let tree = route_schema();
    let block = pack_adjacent_at(&tree, tree.root().unwrap(), 0x8000).unwrap();
    let bytes = Frame::new(MessageKind::SchemaAdd, 0x8000, block.clone()).encode();

    let frame = Frame::decode(&bytes, 1 << 20).unwrap();
    assert_eq!(frame.kind, MessageKind::SchemaAdd);
    assert_eq!(frame.base, 0x8000);
    assert_eq!(frame.payload, block);

    let mut payload = frame.payload;
    rebase(&mut payload, frame.base, 0x1000).unwrap();
    let back = unpack(&payload, 0x1000).unwrap();
    assert!(tree.structurally_eq(tree.root().unwrap(), &back, back.root().unwrap()));

    let err = Frame::decode(&bytes[..bytes.len() - 3], 1 << 20).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadBlock);
}
