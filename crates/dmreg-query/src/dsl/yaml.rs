//! YAML definition files: a schema subtree, queries and config overrides.
//!
//! Example:
//! ```yaml
//! config: { max_queries_per_node: 8 }
//! schema:
//!   - { kind: namespace, name: net, children: [
//!       { kind: complex, name: packetType, children: [
//!           { kind: int, name: macProtocol } ] },
//!       { kind: object, name: device, ident: string, children: [
//!           { kind: event, name: onRx, returns: net.packetType } ] } ] }
//! queries:
//!   - name: proto42
//!     ops:
//!       - { op: stream, kind: event, path: net.device.onRx }
//!       - { op: filter, predicates: [ { left: net.packetType.macProtocol, cmp: eq, right: 42 } ] }
//!       - { op: select, elements: [ net.packetType ] }
//! ```
//!
//! Schema nodes built from a file have no local callbacks; they are bound as
//! remote so the tree validates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dmreg_core::config::ConfigOverrides;
use dmreg_core::schema::{Binding, Node, NodeKind, Primitive, SchemaTree, TypeRef};
use dmreg_core::tuple::Value;
use dmreg_core::NodeId;

use crate::model::{
    AggFunc, CmpOp, CompletionFn, EventMask, Operand, Operator, Predicate, Query, StreamKind,
    StreamOp, Window, WindowUnit,
};

#[derive(Debug, Error)]
pub enum DslError {
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid definition: {0}")]
    Definition(String),

    #[error(transparent)]
    Core(#[from] dmreg_core::Error),
}

pub type Result<T> = std::result::Result<T, DslError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Definitions {
    pub config: ConfigOverrides,
    pub schema: Vec<NodeDef>,
    pub queries: Vec<QueryDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub array: bool,
    /// Return type of a source/event: `int`, `string[]`, `net.packetType`.
    #[serde(default)]
    pub returns: Option<String>,
    /// Identifier type of an object.
    #[serde(default)]
    pub ident: Option<String>,
    /// Target of a reference.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub children: Vec<NodeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDef {
    pub name: String,
    pub ops: Vec<OpDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "op")]
pub enum OpDef {
    Stream {
        kind: StreamKind,
        path: String,
        #[serde(default)]
        selectors: Vec<serde_yaml::Value>,
        #[serde(default)]
        period_ms: u64,
        #[serde(default)]
        events: Vec<String>,
    },
    Filter {
        predicates: Vec<PredicateDef>,
    },
    Select {
        elements: Vec<String>,
    },
    Sort {
        elements: Vec<String>,
        window: WindowDef,
    },
    Group {
        elements: Vec<String>,
    },
    Aggregate {
        func: String,
        elements: Vec<String>,
        window: WindowDef,
        advance: WindowDef,
    },
    Join {
        target: String,
        predicates: Vec<PredicateDef>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowDef {
    pub size: u32,
    pub unit: String,
}

/// `left`/`right` are operands: a number is a literal, a bare string is an
/// element path (`join:` prefix for the joined stream), and a one-key map
/// (`{ str: eth0 }`, `{ byte: 3 }`, `{ int: 7 }`, `{ float: 1.5 }`) is a
/// typed literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateDef {
    pub left: serde_yaml::Value,
    pub cmp: String,
    pub right: serde_yaml::Value,
}

/// Parse a definition file.
pub fn parse_definitions(yaml_src: &str) -> Result<Definitions> {
    Ok(serde_yaml::from_str(yaml_src)?)
}

impl Definitions {
    /// Build the schema subtree under a fresh `Model` root.
    pub fn build_schema(&self) -> Result<SchemaTree> {
        let mut tree = SchemaTree::new();
        let root = tree
            .root()
            .ok_or_else(|| DslError::Definition("tree has no root".into()))?;
        for def in &self.schema {
            add_node(&mut tree, root, def)?;
        }
        Ok(tree)
    }

    /// Build every query, all sharing one completion callback.
    pub fn build_queries(&self, on_completed: CompletionFn) -> Result<Vec<Query>> {
        self.queries
            .iter()
            .map(|q| {
                let ops = q.ops.iter().map(build_op).collect::<Result<Vec<_>>>()?;
                Ok(Query::new(q.name.clone(), ops, on_completed.clone()))
            })
            .collect()
    }
}

fn add_node(tree: &mut SchemaTree, parent: NodeId, def: &NodeDef) -> Result<()> {
    let mut work = vec![(parent, def)];
    while let Some((parent, def)) = work.pop() {
        let node = build_node(def)?;
        let id = tree.add(parent, node)?;
        // children are pushed reversed so they are added in file order
        for c in def.children.iter().rev() {
            work.push((id, c));
        }
    }
    Ok(())
}

fn build_node(def: &NodeDef) -> Result<Node> {
    let name = def.name.clone();
    let node = match def.kind.as_str() {
        "namespace" => Node::namespace(name),
        "complex" => Node::complex(name),
        "source" => match &def.returns {
            Some(r) => Node::source(name, TypeRef::parse(r), Binding::Remote),
            None => Node::new(name, NodeKind::Source),
        },
        "event" => match &def.returns {
            Some(r) => Node::event(name, TypeRef::parse(r), Binding::Remote),
            None => Node::new(name, NodeKind::Event),
        },
        "object" => match &def.ident {
            Some(i) => {
                let ident = Primitive::parse(i)
                    .ok_or_else(|| DslError::Definition(format!("unknown identifier type '{i}'")))?;
                Node::object(name, ident, Binding::Remote)
            }
            None => Node::new(name, NodeKind::Object),
        },
        "reference" => match &def.path {
            Some(p) => Node::reference(name, p.clone()),
            None => Node::new(name, NodeKind::Reference),
        },
        other => match Primitive::parse(other) {
            Some(p) => Node::primitive(name, p),
            None => return Err(DslError::Definition(format!("unknown node kind '{other}'"))),
        },
    };
    Ok(if def.array { node.as_array() } else { node })
}

fn build_op(def: &OpDef) -> Result<Operator> {
    let op = match def {
        OpDef::Stream {
            kind,
            path,
            selectors,
            period_ms,
            events,
        } => {
            let mut mask = EventMask::NONE;
            for e in events {
                mask = mask
                    | EventMask::parse(e)
                        .ok_or_else(|| DslError::Definition(format!("unknown object event '{e}'")))?;
            }
            let selectors = selectors.iter().map(literal).collect::<Result<Vec<_>>>()?;
            Operator::Stream(StreamOp {
                kind: *kind,
                path: path.clone(),
                selectors,
                period_ms: *period_ms,
                events: mask,
            })
        }
        OpDef::Filter { predicates } => Operator::Filter {
            predicates: predicates.iter().map(build_predicate).collect::<Result<_>>()?,
        },
        OpDef::Select { elements } => Operator::Select {
            elements: elements.clone(),
        },
        OpDef::Sort { elements, window } => Operator::Sort {
            elements: elements.clone(),
            window: build_window(window)?,
        },
        OpDef::Group { elements } => Operator::Group {
            elements: elements.clone(),
        },
        OpDef::Aggregate {
            func,
            elements,
            window,
            advance,
        } => Operator::Aggregate {
            func: AggFunc::parse(func)
                .ok_or_else(|| DslError::Definition(format!("unknown aggregate '{func}'")))?,
            elements: elements.clone(),
            window: build_window(window)?,
            advance: build_window(advance)?,
        },
        OpDef::Join { target, predicates } => Operator::Join {
            target: target.clone(),
            predicates: predicates.iter().map(build_predicate).collect::<Result<_>>()?,
        },
    };
    Ok(op)
}

fn build_window(def: &WindowDef) -> Result<Window> {
    let unit = WindowUnit::parse(&def.unit)
        .ok_or_else(|| dmreg_core::Error::at(dmreg_core::ErrorKind::Unit, def.unit.clone()))?;
    Ok(Window::new(def.size, unit))
}

fn build_predicate(def: &PredicateDef) -> Result<Predicate> {
    let cmp = CmpOp::parse(&def.cmp)
        .ok_or_else(|| DslError::Definition(format!("unknown comparison '{}'", def.cmp)))?;
    Ok(Predicate::new(operand(&def.left)?, cmp, operand(&def.right)?))
}

fn operand(v: &serde_yaml::Value) -> Result<Operand> {
    match v {
        serde_yaml::Value::String(s) => Ok(match s.strip_prefix("join:") {
            Some(path) => Operand::Joined(path.to_string()),
            None => Operand::Element(s.clone()),
        }),
        other => Ok(Operand::Literal(literal(other)?)),
    }
}

/// Numbers become int or float literals; `{ str|int|float|byte: v }` picks
/// the type explicitly. Bare strings are strings (used by selectors).
fn literal(v: &serde_yaml::Value) -> Result<Value> {
    use serde_yaml::Value as Y;
    let bad = || DslError::Definition(format!("unsupported literal {v:?}"));
    match v {
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                i32::try_from(i).map(Value::Int).or(Ok(Value::Float(i as f64)))
            } else {
                n.as_f64().map(Value::Float).ok_or_else(bad)
            }
        }
        Y::String(s) => Ok(Value::Str(s.clone())),
        Y::Mapping(m) if m.len() == 1 => {
            let (k, val) = m.iter().next().ok_or_else(bad)?;
            match (k.as_str(), val) {
                (Some("str"), Y::String(s)) => Ok(Value::Str(s.clone())),
                (Some("int"), Y::Number(n)) => n
                    .as_i64()
                    .and_then(|i| i32::try_from(i).ok())
                    .map(Value::Int)
                    .ok_or_else(bad),
                (Some("float"), Y::Number(n)) => n.as_f64().map(Value::Float).ok_or_else(bad),
                (Some("byte"), Y::Number(n)) => n
                    .as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .map(Value::Byte)
                    .ok_or_else(bad),
                _ => Err(bad()),
            }
        }
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_literals_parse() {
        let v: serde_yaml::Value = serde_yaml::from_str("{ byte: 3 }").unwrap();
        assert_eq!(literal(&v).unwrap(), Value::Byte(3));
        let v: serde_yaml::Value = serde_yaml::from_str("{ str: eth0 }").unwrap();
        assert_eq!(literal(&v).unwrap(), Value::Str("eth0".into()));
        let v: serde_yaml::Value = serde_yaml::from_str("2.5").unwrap();
        assert_eq!(literal(&v).unwrap(), Value::Float(2.5));
    }

    #[test]
    fn bare_strings_are_element_references() {
        let v: serde_yaml::Value = serde_yaml::from_str("net.pkt.proto").unwrap();
        assert_eq!(operand(&v).unwrap(), Operand::Element("net.pkt.proto".into()));
        let v: serde_yaml::Value = serde_yaml::from_str("'join:net.other'").unwrap();
        assert_eq!(operand(&v).unwrap(), Operand::Joined("net.other".into()));
    }
}
