//! Tuple construction, typed access and packed sizes.


use std::sync::Arc;

use dmreg_core::provider::SourceProvider;
use dmreg_core::schema::{Binding, Node, Primitive, SchemaTree, TypeRef};
use dmreg_core::tuple::{Tuple, Value, ITEM_HEADER_SIZE, TUPLE_HEADER_SIZE};
use dmreg_core::ErrorKind;
use test_fixtures::*;

const SAMPLES: &str = "sys.samples";

/// `sys.samples -> float[]`
fn samples_schema() -> SchemaTree {
    let provider: Arc<dyn SourceProvider> = Arc::new(LoadGauge::default());
    let mut tree = SchemaTree::new();
    let root = tree.root().unwrap();
    let sys = tree.add(root, Node::namespace("sys")).unwrap();
    tree.add(
        sys,
        Node::source(
            "samples",
            TypeRef::primitive(Primitive::Float).array(),
            Binding::Local(provider),
        ),
    )
    .unwrap();
    tree
}

#[test]
fn push_checks_values_against_the_schema() {
    let tree = remote_net_schema();
    let mut t = Tuple::allocate(1);

    let err = t.push_item(&tree, PACKET, Value::Int(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert_eq!(err.location(), Some(PACKET));

    let short = Value::Complex(vec![Value::Int(1)]);
    assert_eq!(t.push_item(&tree, PACKET, short).unwrap_err().kind(), ErrorKind::TypeMismatch);

    let err = t.push_item(&tree, "net.nothing", Value::Int(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(t.is_empty());

    let t = packet(&tree, 6, 40);
    assert_eq!(t.len(), 2);
    assert!(t.capacity() >= 2);
    assert_eq!(t.item("net.device").unwrap().value, Value::Str("eth0".into()));
}

#[test]
fn allocated_items_start_zeroed_and_take_typed_writes() {
    let tree = remote_net_schema();
    let mut t = Tuple::allocate(2);
    t.alloc_item(&tree, 0, PACKET).unwrap();
    t.alloc_item(&tree, 1, "net.device").unwrap();
    assert_eq!(t.get_int(&tree, MAC_PROTOCOL).unwrap(), 0);
    assert_eq!(t.get_string(&tree, "net.device").unwrap(), "");

    t.set_int(&tree, MAC_PROTOCOL, 17).unwrap();
    t.set_string(&tree, "net.device", "wlan0").unwrap();
    assert_eq!(t.get_int(&tree, MAC_PROTOCOL).unwrap(), 17);
    assert_eq!(t.get_string(&tree, "net.device").unwrap(), "wlan0");

    let err = t.set_int(&tree, "net.device", 3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    let err = t.get_float(&tree, MAC_PROTOCOL).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);

    // replacing a slot resets it
    t.alloc_item(&tree, 0, PACKET).unwrap();
    assert_eq!(t.get_int(&tree, MAC_PROTOCOL).unwrap(), 0);
}

#[test]
fn slots_are_bounded_by_length_and_capacity() {
    let tree = remote_net_schema();
    let mut t = Tuple::allocate(1);
    assert_eq!(t.alloc_item(&tree, 1, PACKET).unwrap_err().kind(), ErrorKind::OutOfBounds);
    t.alloc_item(&tree, 0, PACKET).unwrap();
    assert_eq!(t.alloc_item(&tree, 1, PACKET).unwrap_err().kind(), ErrorKind::OutOfBounds);
    assert_eq!(t.alloc_item(&tree, 0, "net.x").unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn packed_size_counts_names_fixed_parts_and_payloads() {
    let tree = remote_net_schema();
    let t = packet(&tree, 42, 1500);
    let expected = TUPLE_HEADER_SIZE
        + 2 * ITEM_HEADER_SIZE
        + PACKET.len()
        + 8 // two ints
        + "net.device".len()
        + 8 // string pointer
        + 4
        + "eth0".len();
    assert_eq!(t.size_of(&tree).unwrap(), expected);
}

#[test]
fn arrays_resize_with_zeroes() {
    let tree = samples_schema();
    let mut t = Tuple::allocate(1);
    t.alloc_item(&tree, 0, SAMPLES).unwrap();
    assert_eq!(t.array_len(&tree, SAMPLES).unwrap(), 0);

    t.resize_array(&tree, SAMPLES, 3).unwrap();
    t.set_array_slot(&tree, SAMPLES, 2, Value::Float(9.5)).unwrap();
    assert_eq!(t.get_array_slot(&tree, SAMPLES, 0).unwrap(), &Value::Float(0.0));
    assert_eq!(t.get_array_slot(&tree, SAMPLES, 2).unwrap(), &Value::Float(9.5));

    let err = t.set_array_slot(&tree, SAMPLES, 1, Value::Int(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    let err = t.get_array_slot(&tree, SAMPLES, 3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfBounds);

    let expected = TUPLE_HEADER_SIZE + ITEM_HEADER_SIZE + SAMPLES.len() + 8 + 4 + 3 * 8;
    assert_eq!(t.size_of(&tree).unwrap(), expected);

    t.resize_array(&tree, SAMPLES, 1).unwrap();
    assert_eq!(t.array_len(&tree, SAMPLES).unwrap(), 1);
}

#[test]
fn retain_keeps_item_order() {
    let tree = remote_net_schema();
    let mut t = packet(&tree, 1, 2);
    t.retain_items(|i| i.name != PACKET);
    assert_eq!(t.len(), 1);
    assert_eq!(t.items()[0].name, "net.device");
    assert!(t.get(&tree, MAC_PROTOCOL).is_err());
}

#[test]
fn tuples_serialize_to_json() {
    let tree = remote_net_schema();
    let t = packet(&tree, 42, 64);
    let json = serde_json::to_string(&t).unwrap();
    let back: Tuple = serde_json::from_str(&json).unwrap();
    assert_eq!(back, t);
}
