//! Typed accessors over expanded tuples.
//!
//! An access path is an item name optionally followed by field names of the
//! complex value it holds: with an item `net.packetType`, the path
//! `net.packetType.macProtocol` reads the `macProtocol` field.

use crate::error::{Error, ErrorKind, Result};
use crate::schema::{resolve_type, ResolvedType, SchemaTree, ValueBase};

use super::{check_value, Tuple, Value};

/// Item index, field indices below it, and the type found at the end.
struct Route {
    item: usize,
    fields: Vec<usize>,
    ty: ResolvedType,
}

impl Tuple {
    fn route(&self, tree: &SchemaTree, path: &str) -> Result<Route> {
        let not_found = || Error::at(ErrorKind::NotFound, path);

        // longest item name that prefixes the path on a segment boundary
        let (item, rest) = self
            .items
            .iter()
            .enumerate()
            .filter_map(|(i, it)| {
                if path == it.name {
                    Some((i, ""))
                } else {
                    path.strip_prefix(it.name.as_str())
                        .and_then(|r| r.strip_prefix('.'))
                        .map(|r| (i, r))
                }
            })
            .max_by_key(|(i, _)| self.items[*i].name.len())
            .ok_or_else(not_found)?;

        let node = tree.resolve(&self.items[item].name).ok_or_else(not_found)?;
        let mut ty = resolve_type(tree, node)?;
        let mut fields = Vec::new();
        if !rest.is_empty() {
            for seg in rest.split('.') {
                let ValueBase::Complex(complex) = ty.base else {
                    return Err(not_found());
                };
                if ty.array {
                    return Err(not_found());
                }
                let (idx, child) = tree
                    .children(complex)
                    .iter()
                    .enumerate()
                    .find(|(_, c)| tree.node(**c).map(|n| n.name == seg).unwrap_or(false))
                    .ok_or_else(not_found)?;
                fields.push(idx);
                ty = resolve_type(tree, *child)?;
            }
        }
        Ok(Route { item, fields, ty })
    }

    /// Schema type of the value at `path`.
    pub fn element_type(&self, tree: &SchemaTree, path: &str) -> Result<ResolvedType> {
        Ok(self.route(tree, path)?.ty)
    }

    pub fn get(&self, tree: &SchemaTree, path: &str) -> Result<&Value> {
        let r = self.route(tree, path)?;
        let mut v = &self.items[r.item].value;
        for idx in r.fields {
            v = match v {
                Value::Complex(fields) => fields.get(idx).ok_or(ErrorKind::TypeMismatch)?,
                _ => return Err(ErrorKind::TypeMismatch.into()),
            };
        }
        Ok(v)
    }

    fn get_mut_checked(&mut self, tree: &SchemaTree, path: &str) -> Result<(&mut Value, ResolvedType)> {
        let r = self.route(tree, path)?;
        let mut v = &mut self.items[r.item].value;
        for idx in r.fields {
            v = match v {
                Value::Complex(fields) => fields.get_mut(idx).ok_or(ErrorKind::TypeMismatch)?,
                _ => return Err(ErrorKind::TypeMismatch.into()),
            };
        }
        Ok((v, r.ty))
    }

    /// Overwrite the value at `path` after checking it against the schema.
    pub fn set(&mut self, tree: &SchemaTree, path: &str, value: Value) -> Result<()> {
        let (slot, ty) = self.get_mut_checked(tree, path)?;
        check_value(tree, ty, &value).map_err(|e| e.or_at(path))?;
        *slot = value;
        Ok(())
    }

    pub fn get_int(&self, tree: &SchemaTree, path: &str) -> Result<i32> {
        self.get(tree, path)?
            .as_int()
            .ok_or_else(|| Error::at(ErrorKind::TypeMismatch, path))
    }

    pub fn get_float(&self, tree: &SchemaTree, path: &str) -> Result<f64> {
        self.get(tree, path)?
            .as_float()
            .ok_or_else(|| Error::at(ErrorKind::TypeMismatch, path))
    }

    pub fn get_byte(&self, tree: &SchemaTree, path: &str) -> Result<u8> {
        self.get(tree, path)?
            .as_byte()
            .ok_or_else(|| Error::at(ErrorKind::TypeMismatch, path))
    }

    pub fn get_string(&self, tree: &SchemaTree, path: &str) -> Result<&str> {
        self.get(tree, path)?
            .as_str()
            .ok_or_else(|| Error::at(ErrorKind::TypeMismatch, path))
    }

    pub fn set_int(&mut self, tree: &SchemaTree, path: &str, v: i32) -> Result<()> {
        self.set(tree, path, Value::Int(v))
    }

    pub fn set_float(&mut self, tree: &SchemaTree, path: &str, v: f64) -> Result<()> {
        self.set(tree, path, Value::Float(v))
    }

    pub fn set_byte(&mut self, tree: &SchemaTree, path: &str, v: u8) -> Result<()> {
        self.set(tree, path, Value::Byte(v))
    }

    pub fn set_string(&mut self, tree: &SchemaTree, path: &str, v: impl Into<String>) -> Result<()> {
        self.set(tree, path, Value::Str(v.into()))
    }

    /// Number of elements of the array at `path`.
    pub fn array_len(&self, tree: &SchemaTree, path: &str) -> Result<usize> {
        match self.get(tree, path)? {
            Value::Array(elems) => Ok(elems.len()),
            _ => Err(Error::at(ErrorKind::TypeMismatch, path)),
        }
    }

    /// Resize the array at `path`, zero-filling new elements.
    pub fn resize_array(&mut self, tree: &SchemaTree, path: &str, len: usize) -> Result<()> {
        let (slot, ty) = self.get_mut_checked(tree, path)?;
        let Value::Array(elems) = slot else {
            return Err(Error::at(ErrorKind::TypeMismatch, path));
        };
        let zero = Value::zero(tree, ty.element())?;
        elems.resize(len, zero);
        Ok(())
    }

    pub fn get_array_slot(&self, tree: &SchemaTree, path: &str, index: usize) -> Result<&Value> {
        match self.get(tree, path)? {
            Value::Array(elems) => elems
                .get(index)
                .ok_or_else(|| Error::at(ErrorKind::OutOfBounds, format!("{path}[{index}]"))),
            _ => Err(Error::at(ErrorKind::TypeMismatch, path)),
        }
    }

    pub fn set_array_slot(
        &mut self,
        tree: &SchemaTree,
        path: &str,
        index: usize,
        value: Value,
    ) -> Result<()> {
        let (slot, ty) = self.get_mut_checked(tree, path)?;
        let Value::Array(elems) = slot else {
            return Err(Error::at(ErrorKind::TypeMismatch, path));
        };
        check_value(tree, ty.element(), &value).map_err(|e| e.or_at(path))?;
        let target = elems
            .get_mut(index)
            .ok_or_else(|| Error::at(ErrorKind::OutOfBounds, format!("{path}[{index}]")))?;
        *target = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Node, Primitive};

    fn tree() -> SchemaTree {
        let mut t = SchemaTree::new();
        let root = t.root().unwrap();
        let net = t.add(root, Node::namespace("net")).unwrap();
        let pkt = t.add(net, Node::complex("packetType")).unwrap();
        t.add(pkt, Node::primitive("macProtocol", Primitive::Int)).unwrap();
        t.add(pkt, Node::primitive("name", Primitive::String)).unwrap();
        t.add(pkt, Node::primitive("hops", Primitive::Byte).as_array())
            .unwrap();
        t
    }

    #[test]
    fn dotted_access_reaches_complex_fields() {
        let t = tree();
        let mut tup = Tuple::allocate(1);
        tup.alloc_item(&t, 0, "net.packetType").unwrap();
        tup.set_int(&t, "net.packetType.macProtocol", 42).unwrap();
        tup.set_string(&t, "net.packetType.name", "eth0").unwrap();
        assert_eq!(tup.get_int(&t, "net.packetType.macProtocol").unwrap(), 42);
        assert_eq!(tup.get_string(&t, "net.packetType.name").unwrap(), "eth0");
        assert_eq!(
            tup.get_int(&t, "net.packetType.name").unwrap_err().kind(),
            ErrorKind::TypeMismatch
        );
    }

    #[test]
    fn array_slots_are_bounds_checked() {
        let t = tree();
        let mut tup = Tuple::allocate(1);
        tup.alloc_item(&t, 0, "net.packetType").unwrap();
        tup.resize_array(&t, "net.packetType.hops", 2).unwrap();
        tup.set_array_slot(&t, "net.packetType.hops", 1, Value::Byte(7))
            .unwrap();
        assert_eq!(tup.array_len(&t, "net.packetType.hops").unwrap(), 2);
        assert_eq!(
            tup.get_array_slot(&t, "net.packetType.hops", 1).unwrap(),
            &Value::Byte(7)
        );
        let err = tup
            .set_array_slot(&t, "net.packetType.hops", 2, Value::Byte(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
    }
}
