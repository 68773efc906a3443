//! Dynamically typed records flowing from providers through queries.
//!
//! A [`Tuple`] is a timestamp plus an ordered list of named [`Item`]s. Every
//! item name is a schema path; the node at that path decides how the value is
//! laid out. This is the expanded form: each value owns its strings and arrays
//! independently. The read-only compact form lives in `dmreg-reloc`.

mod access;
mod size;

pub use size::{value_size, ARRAY_LEN_PREFIX, ITEM_HEADER_SIZE, TUPLE_HEADER_SIZE};

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::schema::{resolve_type, Primitive, ResolvedType, SchemaTree, ValueBase, MAX_TYPE_DEPTH};

/// A typed value. Complex values hold their fields in schema child order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Byte(u8),
    Int(i32),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Complex(Vec<Value>),
}

impl Value {
    /// The primitive this value carries, if it is one.
    pub fn primitive(&self) -> Option<Primitive> {
        match self {
            Value::Byte(_) => Some(Primitive::Byte),
            Value::Int(_) => Some(Primitive::Int),
            Value::Float(_) => Some(Primitive::Float),
            Value::Str(_) => Some(Primitive::String),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> Option<u8> {
        match self {
            Value::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Zero value of a schema type: 0, 0.0, "", empty array, zeroed fields.
    pub fn zero(tree: &SchemaTree, t: ResolvedType) -> Result<Value> {
        zero_at_depth(tree, t, 0)
    }

    /// Compare two values of the same primitive type. Numeric types are
    /// totally ordered (NaN compares equal to itself); strings compare
    /// lexicographically. Mixed or non-primitive pairs yield `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Byte(a), Value::Byte(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

fn zero_at_depth(tree: &SchemaTree, t: ResolvedType, depth: usize) -> Result<Value> {
    if t.array {
        return Ok(Value::Array(Vec::new()));
    }
    match t.base {
        ValueBase::Primitive(Primitive::Byte) => Ok(Value::Byte(0)),
        ValueBase::Primitive(Primitive::Int) => Ok(Value::Int(0)),
        ValueBase::Primitive(Primitive::Float) => Ok(Value::Float(0.0)),
        ValueBase::Primitive(Primitive::String) => Ok(Value::Str(String::new())),
        ValueBase::Complex(id) => {
            if depth > MAX_TYPE_DEPTH {
                return Err(Error::at(ErrorKind::UnresolvedType, tree.path_of(id)));
            }
            let mut fields = Vec::with_capacity(tree.children(id).len());
            for c in tree.children(id) {
                let ct = resolve_type(tree, *c)?;
                fields.push(zero_at_depth(tree, ct, depth + 1)?);
            }
            Ok(Value::Complex(fields))
        }
    }
}

/// Check that `value` has the shape of schema type `t`.
pub fn check_value(tree: &SchemaTree, t: ResolvedType, value: &Value) -> Result<()> {
    check_at_depth(tree, t, value, 0)
}

fn check_at_depth(tree: &SchemaTree, t: ResolvedType, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_TYPE_DEPTH {
        return Err(ErrorKind::UnresolvedType.into());
    }
    if t.array {
        let Value::Array(elems) = value else {
            return Err(ErrorKind::TypeMismatch.into());
        };
        for e in elems {
            check_at_depth(tree, t.element(), e, depth + 1)?;
        }
        return Ok(());
    }
    match (t.base, value) {
        (ValueBase::Primitive(p), v) if v.primitive() == Some(p) => Ok(()),
        (ValueBase::Complex(id), Value::Complex(fields)) => {
            let children = tree.children(id);
            if children.len() != fields.len() {
                return Err(ErrorKind::TypeMismatch.into());
            }
            for (c, f) in children.iter().zip(fields) {
                let ct = resolve_type(tree, *c)?;
                check_at_depth(tree, ct, f, depth + 1)?;
            }
            Ok(())
        }
        _ => Err(ErrorKind::TypeMismatch.into()),
    }
}

/// One named value of a tuple. `name` is the schema path describing `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub value: Value,
}

/// Flags word of a packed tuple: bit 0 marks the compact form, the upper 32
/// bits record the total packed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TupleFlags(pub u64);

impl TupleFlags {
    pub const COMPACT: u64 = 1;

    pub fn compact(size: usize) -> Self {
        TupleFlags(((size as u64) << 32) | Self::COMPACT)
    }

    pub fn is_compact(self) -> bool {
        self.0 & Self::COMPACT != 0
    }

    pub fn size(self) -> usize {
        (self.0 >> 32) as usize
    }
}

/// Expanded tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub timestamp: u64,
    items: Vec<Item>,
    capacity: usize,
}

/// Milliseconds since the epoch; 0 if the clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Tuple {
    /// Empty tuple with room for `capacity` items, stamped now.
    pub fn allocate(capacity: usize) -> Self {
        Self::with_timestamp(capacity, now_millis())
    }

    pub fn with_timestamp(capacity: usize, timestamp: u64) -> Self {
        Self {
            timestamp,
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuild a tuple from already decoded items (used by the compact
    /// expansion path).
    pub fn from_items(timestamp: u64, items: Vec<Item>) -> Self {
        let capacity = items.len();
        Self {
            timestamp,
            items,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn item(&self, name: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.name == name)
    }

    /// Allocate a zero-valued item for `path` at `slot`. A slot equal to the
    /// current length appends; a lower slot replaces the item there.
    pub fn alloc_item(&mut self, tree: &SchemaTree, slot: usize, path: &str) -> Result<()> {
        let node = tree
            .resolve(path)
            .ok_or_else(|| Error::at(ErrorKind::NotFound, path))?;
        if slot > self.items.len() || slot >= self.capacity {
            return Err(Error::at(ErrorKind::OutOfBounds, format!("slot {slot}")));
        }
        let t = resolve_type(tree, node).map_err(|e| e.or_at(path))?;
        let item = Item {
            name: path.to_string(),
            value: Value::zero(tree, t)?,
        };
        if slot == self.items.len() {
            self.items.push(item);
        } else {
            self.items[slot] = item;
        }
        Ok(())
    }

    /// Append an item after checking `value` against the schema type at `path`.
    /// Grows the capacity when full.
    pub fn push_item(&mut self, tree: &SchemaTree, path: &str, value: Value) -> Result<()> {
        let node = tree
            .resolve(path)
            .ok_or_else(|| Error::at(ErrorKind::NotFound, path))?;
        let t = resolve_type(tree, node).map_err(|e| e.or_at(path))?;
        check_value(tree, t, &value).map_err(|e| e.or_at(path))?;
        self.items.push(Item {
            name: path.to_string(),
            value,
        });
        self.capacity = self.capacity.max(self.items.len());
        Ok(())
    }

    /// Keep only the items `keep` accepts, preserving order.
    pub fn retain_items(&mut self, mut keep: impl FnMut(&Item) -> bool) {
        self.items.retain(|i| keep(i));
    }

    /// Total size of the packed form of this tuple.
    pub fn size_of(&self, tree: &SchemaTree) -> Result<usize> {
        size::tuple_size(tree, self)
    }
}
