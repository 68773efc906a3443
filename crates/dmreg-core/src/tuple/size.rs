//! Packed sizes of tuples.
//!
//! The packed form is: tuple header, the item header array, then per item its
//! name bytes, the fixed-size value and any indirect payload (strings and
//! arrays, each prefixed with a 4-byte length).

use crate::error::{Error, ErrorKind, Result};
use crate::schema::{resolve_type, Primitive, ResolvedType, SchemaTree, ValueBase, MAX_TYPE_DEPTH};

use super::{Tuple, Value};

/// timestamp u64, flags u64, item count u32, pad u32, items pointer u64.
pub const TUPLE_HEADER_SIZE: usize = 32;

/// name pointer u64, name length u32, pad u32, value pointer u64.
pub const ITEM_HEADER_SIZE: usize = 24;

/// Length prefix in front of string bytes and array elements.
pub const ARRAY_LEN_PREFIX: usize = 4;

pub(super) fn tuple_size(tree: &SchemaTree, tuple: &Tuple) -> Result<usize> {
    let mut total = TUPLE_HEADER_SIZE + tuple.len() * ITEM_HEADER_SIZE;
    for item in tuple.items() {
        let node = tree
            .resolve(&item.name)
            .ok_or_else(|| Error::at(ErrorKind::NotFound, item.name.clone()))?;
        let t = resolve_type(tree, node)?;
        total += item.name.len();
        total += value_size(tree, t, &item.value).map_err(|e| e.or_at(item.name.clone()))?;
    }
    Ok(total)
}

/// Fixed in-record size of `t` plus everything `value` stores out of line.
pub fn value_size(tree: &SchemaTree, t: ResolvedType, value: &Value) -> Result<usize> {
    Ok(t.fixed_size(tree, false)? + indirect_size(tree, t, value, 0)?)
}

fn indirect_size(tree: &SchemaTree, t: ResolvedType, value: &Value, depth: usize) -> Result<usize> {
    if depth > MAX_TYPE_DEPTH {
        return Err(ErrorKind::UnresolvedType.into());
    }
    if t.array {
        let Value::Array(elems) = value else {
            return Err(ErrorKind::TypeMismatch.into());
        };
        let elem = t.element();
        let mut total = ARRAY_LEN_PREFIX + elem.fixed_size(tree, false)? * elems.len();
        for e in elems {
            total += indirect_size(tree, elem, e, depth + 1)?;
        }
        return Ok(total);
    }
    match (t.base, value) {
        (ValueBase::Primitive(Primitive::String), Value::Str(s)) => Ok(ARRAY_LEN_PREFIX + s.len()),
        (ValueBase::Primitive(p), v) if v.primitive() == Some(p) => Ok(0),
        (ValueBase::Complex(id), Value::Complex(fields)) => {
            let children = tree.children(id);
            if children.len() != fields.len() {
                return Err(ErrorKind::TypeMismatch.into());
            }
            let mut total = 0;
            for (c, f) in children.iter().zip(fields) {
                let ct = resolve_type(tree, *c)?;
                total += indirect_size(tree, ct, f, depth + 1)?;
            }
            Ok(total)
        }
        _ => Err(ErrorKind::TypeMismatch.into()),
    }
}
