//! Single-tuple chain execution, without the engine threads.


use dmreg_core::schema::SchemaTree;
use dmreg_core::tuple::Value;
use dmreg_query::{
    execute, run_chain, CmpOp, Operand, Operator, Outcome, Predicate, Query, StreamOp, Window,
    WindowUnit,
};
use test_fixtures::*;

fn chain(ops: Vec<Operator>, on_completed: dmreg_query::CompletionFn) -> Query {
    let mut all = vec![Operator::Stream(StreamOp::event(ON_RX))];
    all.extend(ops);
    Query::new("test", all, on_completed)
}

fn where_(path: &str, cmp: CmpOp, v: Value) -> Operator {
    Operator::Filter {
        predicates: vec![Predicate::element(path, cmp, v)],
    }
}

fn tree() -> SchemaTree {
    remote_net_schema()
}

#[test]
fn rejected_tuple_never_reaches_the_callback() {
    let tree = tree();
    let (cb, seen) = collecting_callback();
    let q = chain(vec![where_(MAC_PROTOCOL, CmpOp::Eq, Value::Int(42))], cb);

    assert_eq!(execute(&tree, &q, packet(&tree, 7, 1), 1), Outcome::Discarded);
    assert_eq!(execute(&tree, &q, packet(&tree, 42, 1), 1), Outcome::Completed);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1.get_int(&tree, MAC_PROTOCOL).unwrap(), 42);
}

#[test]
fn predicates_are_anded() {
    let tree = tree();
    let (cb, count) = counting_callback();
    let q = chain(
        vec![Operator::Filter {
            predicates: vec![
                Predicate::element(MAC_PROTOCOL, CmpOp::Gt, Value::Int(10)),
                Predicate::element("net.packetType.length", CmpOp::Le, Value::Int(1500)),
                Predicate::element("net.device", CmpOp::Ne, Value::Str("lo".into())),
            ],
        }],
        cb,
    );
    assert_eq!(execute(&tree, &q, packet(&tree, 11, 1500), 1), Outcome::Completed);
    assert_eq!(execute(&tree, &q, packet(&tree, 11, 1501), 1), Outcome::Discarded);
    assert_eq!(execute(&tree, &q, packet(&tree, 10, 100), 1), Outcome::Discarded);
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn literal_may_sit_on_either_side() {
    let tree = tree();
    let q = chain(
        vec![Operator::Filter {
            predicates: vec![Predicate::new(
                Operand::Literal(Value::Int(100)),
                CmpOp::Lt,
                Operand::Element("net.packetType.length".into()),
            )],
        }],
        discard(),
    );
    assert!(run_chain(&tree, &q, packet(&tree, 0, 101), 1).is_some());
    assert!(run_chain(&tree, &q, packet(&tree, 0, 100), 1).is_none());
}

#[test]
fn unevaluable_filter_discards() {
    let tree = tree();
    // ordering strings is not supported
    let q = chain(vec![where_("net.device", CmpOp::Lt, Value::Str("z".into()))], discard());
    assert!(run_chain(&tree, &q, packet(&tree, 1, 1), 1).is_none());

    // the element is not in the tuple once the packet is selected away
    let q = chain(
        vec![select_only("net.device"), where_(MAC_PROTOCOL, CmpOp::Eq, Value::Int(1))],
        discard(),
    );
    assert!(run_chain(&tree, &q, packet(&tree, 1, 1), 1).is_none());
}

fn select_only(path: &str) -> Operator {
    Operator::Select {
        elements: vec![path.to_string()],
    }
}

#[test]
fn select_keeps_named_items_and_their_ancestors() {
    let tree = tree();
    let q = chain(vec![select_only("net")], discard());
    let out = run_chain(&tree, &q, packet(&tree, 1, 1), 1).unwrap();
    assert_eq!(out.len(), 2);

    let q = chain(vec![select_only("net.device.onRx")], discard());
    assert!(run_chain(&tree, &q, packet(&tree, 1, 1), 1).is_none());
}

#[test]
fn unexecuted_operators_pass_tuples_through() {
    let tree = tree();
    let q = chain(
        vec![
            Operator::Sort {
                elements: vec![MAC_PROTOCOL.into()],
                window: Window::new(1, WindowUnit::Tuples),
            },
            Operator::Group {
                elements: vec![MAC_PROTOCOL.into()],
            },
        ],
        discard(),
    );
    let input = packet(&tree, 3, 4);
    assert_eq!(run_chain(&tree, &q, input.clone(), 1), Some(input));
}

#[test]
fn resuming_past_a_filter_skips_it() {
    let tree = tree();
    let q = chain(
        vec![where_(MAC_PROTOCOL, CmpOp::Eq, Value::Int(42)), select_only(PACKET)],
        discard(),
    );
    assert!(run_chain(&tree, &q, packet(&tree, 7, 1), 1).is_none());
    let out = run_chain(&tree, &q, packet(&tree, 7, 1), 2).unwrap();
    assert_eq!(out.len(), 1);
    // starting at the end completes the tuple untouched
    assert_eq!(run_chain(&tree, &q, packet(&tree, 7, 1), 3).unwrap().len(), 2);
}
