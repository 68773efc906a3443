//! Binary layout of schema-described values.
//!
//! Primitive sizes are fixed; a string or array slot holds a pointer-sized
//! field, complex types are the packed concatenation of their fields. Sources
//! and events are laid out as their declared return type, objects as their
//! identifier type, references as their target.

use crate::error::{Error, ErrorKind, Result};
use crate::id::NodeId;

use super::{DataType, NodeKind, Payload, Primitive, SchemaTree, MAX_TYPE_DEPTH};

/// Size of an in-record pointer (strings, arrays).
pub const POINTER_SIZE: usize = 8;

impl Primitive {
    /// Bytes taken by a value of this type inside a record.
    pub const fn size(self) -> usize {
        match self {
            Primitive::Byte => 1,
            Primitive::Int => 4,
            Primitive::Float => 8,
            Primitive::String => POINTER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueBase {
    Primitive(Primitive),
    /// A `Complex` node whose children are the fields.
    Complex(NodeId),
}

/// The concrete value type a node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedType {
    pub base: ValueBase,
    pub array: bool,
}

impl ResolvedType {
    /// Same type without the array flag (the element type of an array).
    pub fn element(self) -> ResolvedType {
        ResolvedType {
            base: self.base,
            array: false,
        }
    }

    /// Fixed in-record size; arrays count as one pointer unless `ignore_array`.
    pub fn fixed_size(self, tree: &SchemaTree, ignore_array: bool) -> Result<usize> {
        fixed_size(tree, self, ignore_array, 0)
    }
}

/// Follow sources/events/objects/references down to a primitive or complex type.
pub fn resolve_type(tree: &SchemaTree, node: NodeId) -> Result<ResolvedType> {
    resolve_at_depth(tree, node, 0)
}

fn resolve_at_depth(tree: &SchemaTree, node: NodeId, depth: usize) -> Result<ResolvedType> {
    if depth > MAX_TYPE_DEPTH {
        return Err(Error::at(ErrorKind::UnresolvedType, tree.path_of(node)));
    }
    let n = tree.expect(node)?;
    let unresolved = || Error::at(ErrorKind::UnresolvedType, tree.path_of(node));

    if let Some(p) = n.kind.as_primitive() {
        return Ok(ResolvedType {
            base: ValueBase::Primitive(p),
            array: n.array,
        });
    }

    match (&n.kind, &n.payload) {
        (NodeKind::Complex, _) => Ok(ResolvedType {
            base: ValueBase::Complex(node),
            array: n.array,
        }),
        (NodeKind::Source, Payload::Source { returns, .. })
        | (NodeKind::Event, Payload::Event { returns, .. }) => match &returns.data {
            DataType::Primitive(p) => Ok(ResolvedType {
                base: ValueBase::Primitive(*p),
                array: returns.array,
            }),
            DataType::Complex(path) => {
                let target = tree.resolve(path).ok_or_else(unresolved)?;
                match tree.expect(target)?.kind {
                    NodeKind::Complex => Ok(ResolvedType {
                        base: ValueBase::Complex(target),
                        array: returns.array,
                    }),
                    _ => Err(unresolved()),
                }
            }
        },
        (NodeKind::Object, Payload::Object { ident, .. }) => Ok(ResolvedType {
            base: ValueBase::Primitive(*ident),
            array: false,
        }),
        (NodeKind::Reference, Payload::Reference { path }) => {
            let target = tree.resolve(path).ok_or_else(unresolved)?;
            let t = resolve_at_depth(tree, target, depth + 1)?;
            Ok(ResolvedType {
                base: t.base,
                array: n.array || t.array,
            })
        }
        _ => Err(Error::at(ErrorKind::WrongReturnType, tree.path_of(node))),
    }
}

fn fixed_size(tree: &SchemaTree, t: ResolvedType, ignore_array: bool, depth: usize) -> Result<usize> {
    if t.array && !ignore_array {
        return Ok(POINTER_SIZE);
    }
    match t.base {
        ValueBase::Primitive(p) => Ok(p.size()),
        ValueBase::Complex(id) => {
            if depth > MAX_TYPE_DEPTH {
                return Err(Error::at(ErrorKind::UnresolvedType, tree.path_of(id)));
            }
            let mut total = 0usize;
            for c in tree.children(id) {
                let ct = resolve_at_depth(tree, *c, depth + 1)?;
                total += fixed_size(tree, ct, false, depth + 1)?;
            }
            Ok(total)
        }
    }
}

/// In-record size of the value described by `node`.
pub fn size_of(tree: &SchemaTree, node: NodeId, ignore_array: bool) -> Result<usize> {
    let t = resolve_type(tree, node)?;
    fixed_size(tree, t, ignore_array, 0)
}

/// Byte offset of field `child_name` inside the complex value described by
/// `parent` (a complex node, or anything resolving to one).
pub fn offset_of(tree: &SchemaTree, parent: NodeId, child_name: &str) -> Result<usize> {
    let t = resolve_type(tree, parent)?;
    let ValueBase::Complex(complex) = t.base else {
        return Err(Error::at(ErrorKind::WrongReturnType, tree.path_of(parent)));
    };
    let mut offset = 0usize;
    for c in tree.children(complex) {
        let n = tree.expect(*c)?;
        if n.name == child_name {
            return Ok(offset);
        }
        offset += size_of(tree, *c, false)?;
    }
    Err(Error::at(
        ErrorKind::NotFound,
        format!("{}.{}", tree.path_of(complex), child_name),
    ))
}
