//! Compact (single-buffer, relocatable) tuples.
//!
//! ```text
//! header (32)   timestamp u64, flags u64, item count u32, pad u32, items ptr u64
//! items  (24 each) name ptr u64, name len u32, pad u32, value ptr u64
//! per item: name bytes, fixed value, out-of-line payloads
//! ```
//! Fixed values follow the schema layout (`size_of`/`offset_of`); strings and
//! arrays are pointers to a `u32` length followed by the bytes/elements.
//! The buffer length always equals `Tuple::size_of`.

use tracing::trace;

use dmreg_core::error::{Error, ErrorKind, Result};
use dmreg_core::schema::{
    offset_of, resolve_type, Primitive, ResolvedType, SchemaTree, ValueBase, MAX_TYPE_DEPTH,
};
use dmreg_core::tuple::{Item, Tuple, TupleFlags, Value, ITEM_HEADER_SIZE, TUPLE_HEADER_SIZE};

use crate::cursor::{rebase_ptr, Reader, Writer};

const H_TIMESTAMP: usize = 0;
const H_FLAGS: usize = 8;
const H_COUNT: usize = 16;
const H_ITEMS: usize = 24;

const I_NAME_PTR: usize = 0;
const I_NAME_LEN: usize = 8;
const I_VALUE_PTR: usize = 16;

fn bad(what: &str) -> Error {
    Error::at(ErrorKind::BadBlock, what)
}

/// Pack `tuple` into one buffer addressed from `base`.
pub fn pack(tree: &SchemaTree, tuple: &Tuple, base: u64) -> Result<CompactTuple> {
    let size = tuple.size_of(tree)?;
    let mut w = Writer::with_capacity(base, size);

    let header = w.reserve(TUPLE_HEADER_SIZE);
    w.set_u64(header + H_TIMESTAMP, tuple.timestamp);
    w.set_u64(header + H_FLAGS, TupleFlags::compact(size).0);
    w.set_u32(header + H_COUNT, tuple.len() as u32);

    let items = w.reserve(tuple.len() * ITEM_HEADER_SIZE);
    if !tuple.is_empty() {
        w.set_u64(header + H_ITEMS, w.ptr(items));
    }

    for (i, item) in tuple.items().iter().enumerate() {
        let slot = items + i * ITEM_HEADER_SIZE;
        let node = tree
            .resolve(&item.name)
            .ok_or_else(|| Error::at(ErrorKind::NotFound, item.name.clone()))?;
        let t = resolve_type(tree, node)?;

        let name_at = w.len();
        w.put_bytes(item.name.as_bytes());
        w.set_u64(slot + I_NAME_PTR, w.ptr(name_at));
        w.set_u32(slot + I_NAME_LEN, item.name.len() as u32);

        let value_at = w.reserve(t.fixed_size(tree, false)?);
        w.set_u64(slot + I_VALUE_PTR, w.ptr(value_at));
        write_fixed(&mut w, tree, value_at, t, &item.value, 0)
            .map_err(|e| e.or_at(item.name.clone()))?;
    }

    if w.len() != size {
        return Err(Error::at(
            ErrorKind::BadBlock,
            format!("packed {} bytes, expected {size}", w.len()),
        ));
    }
    trace!(bytes = size, items = tuple.len(), "packed tuple");
    Ok(CompactTuple {
        buf: w.into_inner(),
        base,
    })
}

/// Write `value` into the fixed region at `at`, appending out-of-line payloads.
fn write_fixed(
    w: &mut Writer,
    tree: &SchemaTree,
    at: usize,
    t: ResolvedType,
    value: &Value,
    depth: usize,
) -> Result<()> {
    if depth > MAX_TYPE_DEPTH {
        return Err(ErrorKind::UnresolvedType.into());
    }
    if t.array {
        let Value::Array(elems) = value else {
            return Err(ErrorKind::TypeMismatch.into());
        };
        let elem = t.element();
        let elem_size = elem.fixed_size(tree, false)?;
        let payload = w.len();
        w.put_u32(elems.len() as u32);
        let first = w.reserve(elem_size * elems.len());
        w.set_u64(at, w.ptr(payload));
        for (i, e) in elems.iter().enumerate() {
            write_fixed(w, tree, first + i * elem_size, elem, e, depth + 1)?;
        }
        return Ok(());
    }
    match (t.base, value) {
        (ValueBase::Primitive(Primitive::Byte), Value::Byte(v)) => w.set_u8(at, *v),
        (ValueBase::Primitive(Primitive::Int), Value::Int(v)) => {
            w.set_u32(at, *v as u32)
        }
        (ValueBase::Primitive(Primitive::Float), Value::Float(v)) => {
            w.set_u64(at, v.to_bits())
        }
        (ValueBase::Primitive(Primitive::String), Value::Str(s)) => {
            let payload = w.len();
            w.put_str(s);
            w.set_u64(at, w.ptr(payload));
        }
        (ValueBase::Complex(id), Value::Complex(fields)) => {
            let children = tree.children(id);
            if children.len() != fields.len() {
                return Err(ErrorKind::TypeMismatch.into());
            }
            let mut off = at;
            for (c, f) in children.iter().zip(fields) {
                let ct = resolve_type(tree, *c)?;
                write_fixed(w, tree, off, ct, f, depth + 1)?;
                off += ct.fixed_size(tree, false)?;
            }
        }
        _ => return Err(ErrorKind::TypeMismatch.into()),
    }
    Ok(())
}

/// Read-only tuple backed by a single relocatable buffer.
///
/// There are no mutators: a compact tuple is expanded before anything
/// modifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactTuple {
    buf: Vec<u8>,
    base: u64,
}

impl CompactTuple {
    /// Adopt a buffer received from elsewhere, checking the header.
    pub fn from_bytes(buf: Vec<u8>, base: u64) -> Result<Self> {
        let t = CompactTuple { buf, base };
        let flags = t.flags()?;
        if !flags.is_compact() {
            return Err(bad("compact flag not set"));
        }
        if flags.size() != t.buf.len() {
            return Err(bad("size in flags does not match buffer"));
        }
        let count = t.len()?;
        if TUPLE_HEADER_SIZE + count * ITEM_HEADER_SIZE > t.buf.len() {
            return Err(bad("item table past end of block"));
        }
        Ok(t)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    fn reader(&self) -> Reader<'_> {
        Reader::new(&self.buf, self.base)
    }

    pub fn timestamp(&self) -> Result<u64> {
        self.reader().u64(H_TIMESTAMP)
    }

    pub fn flags(&self) -> Result<TupleFlags> {
        Ok(TupleFlags(self.reader().u64(H_FLAGS)?))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.reader().u32(H_COUNT)? as usize)
    }

    fn item_slot(&self, index: usize) -> Result<usize> {
        let r = self.reader();
        let items = r.deref(r.u64(H_ITEMS)?)?;
        Ok(items + index * ITEM_HEADER_SIZE)
    }

    pub fn item_name(&self, index: usize) -> Result<&str> {
        if index >= self.len()? {
            return Err(Error::at(ErrorKind::OutOfBounds, format!("item {index}")));
        }
        let r = self.reader();
        let slot = self.item_slot(index)?;
        let at = r.deref(r.u64(slot + I_NAME_PTR)?)?;
        r.str(at, r.u32(slot + I_NAME_LEN)? as usize)
    }

    /// Read the value at `path` (item name plus optional field names).
    pub fn get(&self, tree: &SchemaTree, path: &str) -> Result<Value> {
        let (at, t) = self.locate(tree, path)?;
        read_fixed(&self.reader(), tree, at, t, 0)
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

    pub fn get_string(&self, tree: &SchemaTree, path: &str) -> Result<String> {
        match self.get(tree, path)? {
            Value::Str(s) => Ok(s),
            _ => Err(Error::at(ErrorKind::TypeMismatch, path)),
        }
    }

    /// Offset of the fixed value at `path` and its type. Complex fields are
    /// reached through `offset_of`.
    fn locate(&self, tree: &SchemaTree, path: &str) -> Result<(usize, ResolvedType)> {
        let not_found = || Error::at(ErrorKind::NotFound, path);
        let r = self.reader();

        // longest item name that prefixes the path on a segment boundary
        let mut best: Option<(usize, usize, &str)> = None;
        for i in 0..self.len()? {
            let name = self.item_name(i)?;
            let rest = if path == name {
                Some("")
            } else {
                path.strip_prefix(name).and_then(|r| r.strip_prefix('.'))
            };
            if let Some(rest) = rest {
                if best.map_or(true, |(_, len, _)| name.len() > len) {
                    best = Some((i, name.len(), rest));
                }
            }
        }
        let (index, _, rest) = best.ok_or_else(not_found)?;

        let slot = self.item_slot(index)?;
        let mut at = r.deref(r.u64(slot + I_VALUE_PTR)?)?;
        let node = tree.resolve(self.item_name(index)?).ok_or_else(not_found)?;
        let mut t = resolve_type(tree, node)?;
        if !rest.is_empty() {
            for seg in rest.split('.') {
                let ValueBase::Complex(complex) = t.base else {
                    return Err(not_found());
                };
                if t.array {
                    return Err(not_found());
                }
                at += offset_of(tree, complex, seg)?;
                let child = tree.child_by_name(complex, seg).ok_or_else(not_found)?;
                t = resolve_type(tree, child)?;
            }
        }
        Ok((at, t))
    }

    /// Schema-aware deep copy back into an independently owned tuple.
    pub fn expand(&self, tree: &SchemaTree) -> Result<Tuple> {
        let r = self.reader();
        let count = self.len()?;
        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            let name = self.item_name(i)?.to_string();
            let node = tree
                .resolve(&name)
                .ok_or_else(|| Error::at(ErrorKind::NotFound, name.clone()))?;
            let t = resolve_type(tree, node)?;
            let slot = self.item_slot(i)?;
            let at = r.deref(r.u64(slot + I_VALUE_PTR)?)?;
            let value = read_fixed(&r, tree, at, t, 0).map_err(|e| e.or_at(name.clone()))?;
            items.push(Item { name, value });
        }
        Ok(Tuple::from_items(self.timestamp()?, items))
    }

    /// Move the buffer into `new_base`'s address space.
    pub fn rebase(&mut self, tree: &SchemaTree, new_base: u64) -> Result<()> {
        if new_base == self.base {
            return Ok(());
        }
        let mut slots = vec![H_ITEMS];
        {
            let r = self.reader();
            for i in 0..self.len()? {
                let slot = self.item_slot(i)?;
                slots.push(slot + I_NAME_PTR);
                slots.push(slot + I_VALUE_PTR);
                let name = self.item_name(i)?;
                let node = tree
                    .resolve(name)
                    .ok_or_else(|| Error::at(ErrorKind::NotFound, name.to_string()))?;
                let t = resolve_type(tree, node)?;
                let at = r.deref(r.u64(slot + I_VALUE_PTR)?)?;
                collect_value_ptrs(&r, tree, at, t, &mut slots, 0)?;
            }
        }
        let old = self.base;
        for s in slots {
            rebase_ptr(&mut self.buf, s, old, new_base)?;
        }
        self.base = new_base;
        Ok(())
    }
}

fn read_fixed(r: &Reader<'_>, tree: &SchemaTree, at: usize, t: ResolvedType, depth: usize) -> Result<Value> {
    if depth > MAX_TYPE_DEPTH {
        return Err(ErrorKind::UnresolvedType.into());
    }
    if t.array {
        let payload = r.deref(r.u64(at)?)?;
        let len = r.u32(payload)? as usize;
        let elem = t.element();
        let elem_size = elem.fixed_size(tree, false)?;
        if len.saturating_mul(elem_size) > r.len() {
            return Err(bad("array length exceeds block"));
        }
        let first = payload + 4;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(read_fixed(r, tree, first + i * elem_size, elem, depth + 1)?);
        }
        return Ok(Value::Array(out));
    }
    Ok(match t.base {
        ValueBase::Primitive(Primitive::Byte) => Value::Byte(r.u8(at)?),
        ValueBase::Primitive(Primitive::Int) => Value::Int(r.u32(at)? as i32),
        ValueBase::Primitive(Primitive::Float) => Value::Float(f64::from_bits(r.u64(at)?)),
        ValueBase::Primitive(Primitive::String) => {
            let payload = r.deref(r.u64(at)?)?;
            let len = r.u32(payload)? as usize;
            Value::Str(r.str(payload + 4, len)?.to_string())
        }
        ValueBase::Complex(id) => {
            let mut fields = Vec::with_capacity(tree.children(id).len());
            let mut off = at;
            for c in tree.children(id) {
                let ct = resolve_type(tree, *c)?;
                fields.push(read_fixed(r, tree, off, ct, depth + 1)?);
                off += ct.fixed_size(tree, false)?;
            }
            Value::Complex(fields)
        }
    })
}

fn collect_value_ptrs(
    r: &Reader<'_>,
    tree: &SchemaTree,
    at: usize,
    t: ResolvedType,
    out: &mut Vec<usize>,
    depth: usize,
) -> Result<()> {
    if depth > MAX_TYPE_DEPTH {
        return Err(ErrorKind::UnresolvedType.into());
    }
    if t.array {
        out.push(at);
        let payload = r.deref(r.u64(at)?)?;
        let len = r.u32(payload)? as usize;
        let elem = t.element();
        let elem_size = elem.fixed_size(tree, false)?;
        for i in 0..len {
            collect_value_ptrs(r, tree, payload + 4 + i * elem_size, elem, out, depth + 1)?;
        }
        return Ok(());
    }
    match t.base {
        ValueBase::Primitive(Primitive::String) => out.push(at),
        ValueBase::Primitive(_) => {}
        ValueBase::Complex(id) => {
            let mut off = at;
            for c in tree.children(id) {
                let ct = resolve_type(tree, *c)?;
                collect_value_ptrs(r, tree, off, ct, out, depth + 1)?;
                off += ct.fixed_size(tree, false)?;
            }
        }
    }
    Ok(())
}

/// Pack several tuples (an object status dump) into one block.
///
/// `count u32, pad u32`, then per tuple `size u64` and its compact bytes,
/// each addressed from `base` plus its own offset.
pub fn pack_chain(tree: &SchemaTree, tuples: &[Tuple], base: u64) -> Result<Vec<u8>> {
    let mut w = Writer::new(base);
    w.put_u32(tuples.len() as u32);
    w.put_u32(0);
    for t in tuples {
        let size_at = w.reserve(8);
        let packed = pack(tree, t, w.ptr(w.len()))?;
        w.set_u64(size_at, packed.as_bytes().len() as u64);
        w.put_bytes(packed.as_bytes());
    }
    Ok(w.into_inner())
}

/// Split a chain block into compact tuples still addressed from `base`.
pub fn split_chain(buf: &[u8], base: u64) -> Result<Vec<CompactTuple>> {
    let r = Reader::new(buf, base);
    let count = r.u32(0)? as usize;
    let mut at = 8usize;
    let mut out = Vec::with_capacity(count.min(buf.len() / TUPLE_HEADER_SIZE + 1));
    for _ in 0..count {
        let size = r.u64(at)? as usize;
        let bytes = r.bytes(at + 8, size)?;
        out.push(CompactTuple::from_bytes(bytes.to_vec(), base + (at + 8) as u64)?);
        at += 8 + size;
    }
    if at != buf.len() {
        return Err(bad("trailing bytes after tuple chain"));
    }
    Ok(out)
}

/// Decode a chain block and expand every tuple.
pub fn unpack_chain(tree: &SchemaTree, buf: &[u8], base: u64) -> Result<Vec<Tuple>> {
    split_chain(buf, base)?
        .iter()
        .map(|c| c.expand(tree))
        .collect()
}

/// Move every tuple of a chain block from `old_base` to `new_base`.
pub fn rebase_chain(tree: &SchemaTree, buf: &mut [u8], old_base: u64, new_base: u64) -> Result<()> {
    let parts = split_chain(buf, old_base)?;
    let mut at = 8usize;
    for mut part in parts {
        let len = part.as_bytes().len();
        part.rebase(tree, new_base + (at + 8) as u64)?;
        buf[at + 8..at + 8 + len].copy_from_slice(part.as_bytes());
        at += 8 + len;
    }
    Ok(())
}
