//! Definition files: parsing, building and registering them.


use dmreg_core::config::RegistryConfig;
use dmreg_core::schema::{NodeKind, Payload, Primitive};
use dmreg_core::tuple::Value;
use dmreg_core::ErrorKind;
use dmreg_exec::Engine;
use dmreg_query::dsl::yaml::{parse_definitions, DslError};
use dmreg_query::{AggFunc, EventMask, Operand, Operator, StreamKind, WindowUnit};
use test_fixtures::*;

const NET: &str = r#"
config:
  max_queries_per_node: 4
  min_source_period_ms: 20
schema:
  - kind: namespace
    name: net
    children:
      - kind: complex
        name: packetType
        children:
          - { kind: int, name: macProtocol }
          - { kind: int, name: length }
      - kind: object
        name: device
        ident: string
        children:
          - { kind: event, name: onRx, returns: net.packetType }
          - { kind: source, name: rxBytes, returns: "int[]" }
queries:
  - name: proto42
    ops:
      - { op: stream, kind: event, path: net.device.onRx }
      - { op: filter, predicates: [ { left: net.packetType.macProtocol, cmp: eq, right: 42 } ] }
      - { op: select, elements: [ net.packetType ] }
  - name: devices
    ops:
      - { op: stream, kind: object, path: net.device, events: [create, delete], selectors: [ { str: eth0 } ] }
  - name: traffic
    ops:
      - { op: stream, kind: source, path: net.device.rxBytes, period_ms: 100 }
      - { op: aggregate, func: avg, elements: [ net.device.rxBytes ], window: { size: 10, unit: s }, advance: { size: 1, unit: s } }
"#;

#[test]
fn definition_file_builds_schema_and_queries() {
    let defs = parse_definitions(NET).unwrap();
    assert_eq!(defs.config.max_queries_per_node, Some(4));

    let tree = defs.build_schema().unwrap();
    let rx_bytes = tree.node(tree.resolve("net.device.rxBytes").unwrap()).unwrap();
    assert_eq!(rx_bytes.kind, NodeKind::Source);
    let returns = rx_bytes.returns().unwrap();
    assert!(returns.array);
    assert!(matches!(&rx_bytes.payload, Payload::Source { .. }));
    assert_eq!(
        tree.node(tree.resolve("net.device").unwrap()).unwrap().ident(),
        Some(Primitive::String)
    );

    let queries = defs.build_queries(discard()).unwrap();
    assert_eq!(queries.len(), 3);
    match &queries[0].ops[1] {
        Operator::Filter { predicates } => {
            assert_eq!(predicates[0].left, Operand::Element(MAC_PROTOCOL.into()));
            assert_eq!(predicates[0].right, Operand::Literal(Value::Int(42)));
        }
        other => panic!("expected filter, got {}", other.name()),
    }
    let devices = queries[1].stream().unwrap();
    assert_eq!(devices.kind, StreamKind::Object);
    assert_eq!(devices.events, EventMask::CREATE | EventMask::DELETE);
    assert_eq!(devices.selectors, [Value::Str("eth0".into())]);
    match &queries[2].ops[1] {
        Operator::Aggregate { func, window, .. } => {
            assert_eq!(*func, AggFunc::Avg);
            assert_eq!(window.unit, WindowUnit::Seconds);
        }
        other => panic!("expected aggregate, got {}", other.name()),
    }
}

#[test]
fn definition_file_registers_into_an_engine() {
    let defs = parse_definitions(NET).unwrap();
    let mut cfg = RegistryConfig::default();
    cfg.apply(&defs.config);
    assert_eq!(cfg.min_source_period_ms, 20);

    let engine = Engine::new(cfg).unwrap();
    let (cb, rx) = channel_callback();
    let ids = engine
        .registry()
        .register_provider(Some(&defs.build_schema().unwrap()), defs.build_queries(cb).unwrap())
        .unwrap();
    assert_eq!(ids.len(), 3);
    // remote sources are polled by their owner
    assert_eq!(engine.registry().active_timers(), 0);

    let tree = engine.registry().snapshot();
    engine
        .registry()
        .produce_event(ON_RX, packet(&tree, 42, 99))
        .unwrap();
    let (id, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(id, ids[0]);
}

#[test]
fn unknown_names_in_definitions_are_reported() {
    let bad_kind = parse_definitions("schema: [ { kind: widget, name: w } ]").unwrap();
    assert!(matches!(bad_kind.build_schema(), Err(DslError::Definition(_))));

    let bad_unit = parse_definitions(
        r#"
queries:
  - name: q
    ops:
      - { op: sort, elements: [ a ], window: { size: 1, unit: fortnight } }
"#,
    )
    .unwrap();
    match bad_unit.build_queries(discard()) {
        Err(DslError::Core(e)) => assert_eq!(e.kind(), ErrorKind::Unit),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("fortnight is not a unit"),
    }

    let bad_cmp = parse_definitions(
        r#"
queries:
  - name: q
    ops:
      - { op: filter, predicates: [ { left: a, cmp: like, right: 1 } ] }
"#,
    )
    .unwrap();
    assert!(matches!(bad_cmp.build_queries(discard()), Err(DslError::Definition(_))));

    assert!(matches!(parse_definitions("schema: 12"), Err(DslError::Yaml(_))));
}

#[test]
fn definition_schema_is_validated_on_registration() {
    let defs = parse_definitions(
        r#"
schema:
  - { kind: namespace, name: empty }
"#,
    )
    .unwrap();
    let engine = Engine::new(RegistryConfig::default()).unwrap();
    let err = engine
        .registry()
        .register_provider(Some(&defs.build_schema().unwrap()), Vec::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoChildren);
    assert_eq!(err.location(), Some("empty"));
}
