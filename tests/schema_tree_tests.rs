//! Schema tree validation, merging, deletion and layout.


use std::sync::Arc;

use dmreg_core::provider::EventProvider;
use dmreg_core::schema::{
    check_syntax, delete_subtree, merge, offset_of, size_of, Binding, Node, Primitive, SchemaTree,
    TypeRef,
};
use dmreg_core::ErrorKind;
use test_fixtures::*;

fn check(tree: &SchemaTree) -> (ErrorKind, Option<String>) {
    let err = check_syntax(None, tree).unwrap_err();
    (err.kind(), err.location().map(str::to_string))
}

fn events() -> Binding<dyn EventProvider> {
    let p: Arc<dyn EventProvider> = Arc::new(CountingEvents::default());
    Binding::Local(p)
}

/// `model > net` plus whatever `build` hangs below `net`.
fn under_net(build: impl FnOnce(&mut SchemaTree, dmreg_core::NodeId)) -> SchemaTree {
    let mut tree = SchemaTree::new();
    let root = tree.root().unwrap();
    let net = tree.add(root, Node::namespace("net")).unwrap();
    build(&mut tree, net);
    tree
}

#[test]
fn well_formed_schema_passes() {
    let providers = NetProviders::default();
    check_syntax(None, &net_schema(&providers)).unwrap();
    check_syntax(None, &remote_net_schema()).unwrap();
}

#[test]
fn structural_errors_name_the_offending_node() {
    let empty_ns = under_net(|_, _| {});
    assert_eq!(check(&empty_ns), (ErrorKind::NoChildren, Some("net".into())));

    let leaf_in_ns = under_net(|t, net| {
        t.add(net, Node::primitive("count", Primitive::Int)).unwrap();
    });
    assert_eq!(check(&leaf_in_ns), (ErrorKind::WrongChildType, Some("net.count".into())));

    let twins = under_net(|t, net| {
        t.add(net, Node::event("tick", TypeRef::primitive(Primitive::Int), events()))
            .unwrap();
        t.add(net, Node::event("tick", TypeRef::primitive(Primitive::Int), events()))
            .unwrap();
    });
    assert_eq!(check(&twins).0, ErrorKind::DuplicateSibling);

    let dotted = under_net(|t, net| {
        t.add(net, Node::event("a.b", TypeRef::primitive(Primitive::Int), events()))
            .unwrap();
    });
    assert_eq!(check(&dotted).0, ErrorKind::BadName);

    let long = under_net(|t, net| {
        t.add(net, Node::event("x".repeat(65), TypeRef::primitive(Primitive::Int), events()))
            .unwrap();
    });
    assert_eq!(check(&long).0, ErrorKind::BadName);

    let leaf_children = under_net(|t, net| {
        let e = t
            .add(net, Node::event("tick", TypeRef::primitive(Primitive::Int), events()))
            .unwrap();
        t.add(e, Node::primitive("extra", Primitive::Int)).unwrap();
    });
    assert_eq!(check(&leaf_children), (ErrorKind::UnexpectedChildren, Some("net.tick".into())));
}

#[test]
fn typing_errors_are_reported() {
    let unbound = under_net(|t, net| {
        t.add(net, Node::event("tick", TypeRef::primitive(Primitive::Int), Binding::Unbound))
            .unwrap();
    });
    assert_eq!(check(&unbound), (ErrorKind::MissingCallback, Some("net.tick".into())));

    let dangling = under_net(|t, net| {
        t.add(net, Node::event("tick", TypeRef::complex("net.missing"), events()))
            .unwrap();
    });
    assert_eq!(check(&dangling).0, ErrorKind::UnresolvedType);

    let not_complex = under_net(|t, net| {
        t.add(net, Node::event("tick", TypeRef::complex("net"), events()))
            .unwrap();
    });
    assert_eq!(check(&not_complex).0, ErrorKind::WrongReturnType);

    let bad_ref = under_net(|t, net| {
        let c = t.add(net, Node::complex("pair")).unwrap();
        t.add(c, Node::reference("other", "net.nothing")).unwrap();
    });
    assert_eq!(check(&bad_ref), (ErrorKind::UnresolvedType, Some("net.pair.other".into())));

    let array_event = under_net(|t, net| {
        t.add(
            net,
            Node::event("tick", TypeRef::primitive(Primitive::Int), events()).as_array(),
        )
        .unwrap();
    });
    assert_eq!(check(&array_event).0, ErrorKind::UnexpectedTypeInfo);
}

#[test]
fn complex_types_cannot_contain_themselves() {
    let direct = under_net(|t, net| {
        let a = t.add(net, Node::complex("a")).unwrap();
        t.add(a, Node::primitive("x", Primitive::Int)).unwrap();
        t.add(a, Node::reference("r", "net.a")).unwrap();
    });
    assert_eq!(check(&direct), (ErrorKind::UnresolvedType, Some("net.a".into())));

    let through_chain = under_net(|t, net| {
        let a = t.add(net, Node::complex("a")).unwrap();
        t.add(a, Node::reference("b", "net.b")).unwrap();
        let b = t.add(net, Node::complex("b")).unwrap();
        let inner = t.add(b, Node::complex("inner")).unwrap();
        t.add(inner, Node::reference("back", "net.a")).unwrap();
    });
    assert_eq!(check(&through_chain).0, ErrorKind::UnresolvedType);

    let linked_list = under_net(|t, net| {
        let a = t.add(net, Node::complex("a")).unwrap();
        t.add(a, Node::primitive("x", Primitive::Int)).unwrap();
        t.add(a, Node::reference("next", "net.a").as_array()).unwrap();
    });
    check_syntax(None, &linked_list).unwrap();
}

#[test]
fn return_types_may_live_in_the_existing_tree() {
    let existing = remote_net_schema();
    let candidate = under_net(|t, net| {
        t.add(net, Node::event("onTx", TypeRef::complex(PACKET), events()))
            .unwrap();
    });
    assert_eq!(check(&candidate).0, ErrorKind::UnresolvedType);
    check_syntax(Some(&existing), &candidate).unwrap();
}

#[test]
fn merge_grafts_new_siblings_under_shared_namespaces() {
    let mut live = remote_net_schema();
    let before = live.len();
    let candidate = under_net(|t, net| {
        let dev = t
            .add(net, Node::object("device", Primitive::String, Binding::Remote))
            .unwrap();
        t.add(dev, Node::event("onTx", TypeRef::complex(PACKET), events()))
            .unwrap();
    });

    merge(true, &mut live, &candidate).unwrap();
    assert_eq!(live.len(), before);
    merge(false, &mut live, &candidate).unwrap();
    assert_eq!(live.len(), before + 1);

    let device = live.resolve("net.device").unwrap();
    let names: Vec<&str> = live
        .children(device)
        .iter()
        .map(|c| live.node(*c).unwrap().name.as_str())
        .collect();
    assert_eq!(names, ["onRx", "onTx"]);
}

#[test]
fn merge_conflicts_are_classified() {
    let live = remote_net_schema();

    let same = remote_net_schema();
    let err = merge(true, &mut live.clone(), &same).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SameNode);

    let other_ident = under_net(|t, net| {
        let dev = t
            .add(net, Node::object("device", Primitive::Int, Binding::Remote))
            .unwrap();
        t.add(dev, Node::event("onErr", TypeRef::primitive(Primitive::Int), events()))
            .unwrap();
    });
    let err = merge(true, &mut live.clone(), &other_ident).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectIdent);
    assert_eq!(err.location(), Some("net.device"));

    let kind_clash = under_net(|t, net| {
        t.add(net, Node::event("packetType", TypeRef::primitive(Primitive::Int), events()))
            .unwrap();
    });
    let err = merge(true, &mut live.clone(), &kind_clash).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DifferentNodeType);

    let retyped = under_net(|t, net| {
        let dev = t
            .add(net, Node::object("device", Primitive::String, Binding::Remote))
            .unwrap();
        t.add(dev, Node::event("onRx", TypeRef::primitive(Primitive::Int), events()))
            .unwrap();
    });
    let err = merge(true, &mut live.clone(), &retyped).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DifferentNodeType);
    assert_eq!(err.location(), Some("net.device.onRx"));
}

#[test]
fn delete_cascades_through_emptied_parents() {
    let mut live = remote_net_schema();
    let doomed = under_net(|t, net| {
        let dev = t
            .add(net, Node::object("device", Primitive::String, Binding::Remote))
            .unwrap();
        t.add(dev, Node::event("onRx", TypeRef::complex(PACKET), Binding::Remote))
            .unwrap();
    });
    delete_subtree(&mut live, &doomed).unwrap();
    assert!(live.resolve("net.device").is_none());
    assert!(live.resolve(PACKET).is_some());

    let rest = under_net(|t, net| {
        t.add(net, Node::complex("packetType")).unwrap();
    });
    delete_subtree(&mut live, &rest).unwrap();
    assert!(live.root().is_none());
    assert!(live.is_empty());
    live.reinit();
    assert_eq!(live.len(), 1);
}

#[test]
fn delete_of_an_unknown_path_changes_nothing() {
    let mut live = remote_net_schema();
    let doomed = under_net(|t, net| {
        t.add(net, Node::complex("packetType")).unwrap();
        t.add(net, Node::complex("nothing")).unwrap();
    });
    let err = delete_subtree(&mut live, &doomed).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let pristine = remote_net_schema();
    assert!(live.structurally_eq(live.root().unwrap(), &pristine, pristine.root().unwrap()));
}

#[test]
fn layout_follows_schema_order() {
    let tree = remote_net_schema();
    let packet = tree.resolve(PACKET).unwrap();
    assert_eq!(size_of(&tree, packet, false).unwrap(), 8);
    assert_eq!(offset_of(&tree, packet, "macProtocol").unwrap(), 0);
    assert_eq!(offset_of(&tree, packet, "length").unwrap(), 4);
    assert_eq!(offset_of(&tree, packet, "crc").unwrap_err().kind(), ErrorKind::NotFound);

    // an event resolves to its return type
    let on_rx = tree.resolve(ON_RX).unwrap();
    assert_eq!(offset_of(&tree, on_rx, "length").unwrap(), 4);
    // objects lay out as their identifier
    assert_eq!(size_of(&tree, tree.resolve("net.device").unwrap(), false).unwrap(), 8);
}

#[test]
fn copy_subtree_drops_query_slots() {
    let mut tree = remote_net_schema();
    let on_rx = tree.resolve(ON_RX).unwrap();
    tree.attach_query(on_rx, dmreg_core::QueryId::new(1), Some(1)).unwrap();
    let err = tree
        .attach_query(on_rx, dmreg_core::QueryId::new(2), Some(1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuerySlotsFull);

    let net = tree.resolve("net").unwrap();
    let copy = tree.copy_subtree(net).unwrap();
    let copied_rx = copy.resolve_from(copy.root().unwrap(), "device.onRx").unwrap();
    assert!(copy.node(copied_rx).unwrap().queries().is_empty());
    assert_eq!(tree.path_of(on_rx), ON_RX);
}
