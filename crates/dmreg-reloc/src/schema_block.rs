//! Relocatable encoding of schema subtrees.
//!
//! Layout, in pre-order per node:
//! ```text
//! node record (88 bytes)
//!   name      [u8; 64]  zero padded
//!   kind      u8
//!   array     u8
//!   pad       [u8; 2]
//!   children  u32       count
//!   child_ptr u64       -> children pointer array (null when no children)
//!   payload   u64       -> payload record (null for kinds without one)
//! children pointer array (count x u64)
//! payload record (24 bytes)
//!   tag u8, primitive u8, flags u8, binding u8, pad [u8; 4],
//!   str_ptr u64, str_len u32, pad [u8; 4]
//! payload string bytes
//! ...children, recursively
//! ```
//! The subtree root sits at offset 0.

use std::collections::HashSet;

use tracing::trace;

use dmreg_core::error::{Error, ErrorKind, Result};
use dmreg_core::schema::{
    Binding, DataType, Node, NodeKind, Payload, Primitive, SchemaTree, TypeRef, MAX_NAME_LEN,
};
use dmreg_core::NodeId;

use crate::cursor::{rebase_ptr, Reader, Writer};

pub const NODE_RECORD_SIZE: usize = 88;
pub const PAYLOAD_RECORD_SIZE: usize = 24;

const OFF_KIND: usize = 64;
const OFF_ARRAY: usize = 65;
const OFF_CHILD_COUNT: usize = 68;
const OFF_CHILD_PTR: usize = 72;
const OFF_PAYLOAD_PTR: usize = 80;

const P_TAG: usize = 0;
const P_PRIM: usize = 1;
const P_FLAGS: usize = 2;
const P_BINDING: usize = 3;
const P_STR_PTR: usize = 8;
const P_STR_LEN: usize = 16;

const TAG_SOURCE: u8 = 1;
const TAG_EVENT: u8 = 2;
const TAG_OBJECT: u8 = 3;
const TAG_REFERENCE: u8 = 4;

const FLAG_ARRAY: u8 = 1;
const FLAG_COMPLEX: u8 = 2;

/// Pack the subtree at `node` with pointers relative to the start of the
/// allocation (base 0).
pub fn pack_adjacent(tree: &SchemaTree, node: NodeId) -> Result<Vec<u8>> {
    pack_adjacent_at(tree, node, 0)
}

/// Pack the subtree at `node` with pointers in `base`'s address space.
pub fn pack_adjacent_at(tree: &SchemaTree, node: NodeId, base: u64) -> Result<Vec<u8>> {
    let mut w = Writer::with_capacity(base, tree.len() * (NODE_RECORD_SIZE + 8));
    write_node(&mut w, tree, node)?;
    trace!(bytes = w.len(), base, "packed schema subtree");
    Ok(w.into_inner())
}

fn write_node(w: &mut Writer, tree: &SchemaTree, id: NodeId) -> Result<usize> {
    let n = tree
        .node(id)
        .ok_or_else(|| Error::at(ErrorKind::NotFound, id.to_string()))?;
    if n.name.len() > MAX_NAME_LEN {
        return Err(Error::at(ErrorKind::BadName, tree.path_of(id)));
    }

    let at = w.reserve(NODE_RECORD_SIZE);
    w.set_bytes(at, n.name.as_bytes());
    w.set_u8(at + OFF_KIND, n.kind.code());
    w.set_u8(at + OFF_ARRAY, n.array as u8);
    w.set_u32(at + OFF_CHILD_COUNT, n.children().len() as u32);

    let children = n.children();
    let array_at = if children.is_empty() {
        None
    } else {
        let arr = w.reserve(8 * children.len());
        w.set_u64(at + OFF_CHILD_PTR, w.ptr(arr));
        Some(arr)
    };

    if let Some(p) = write_payload(w, &n.payload) {
        w.set_u64(at + OFF_PAYLOAD_PTR, w.ptr(p));
    }

    if let Some(arr) = array_at {
        for (i, c) in children.iter().enumerate() {
            let child_at = write_node(w, tree, *c)?;
            w.set_u64(arr + 8 * i, w.ptr(child_at));
        }
    }
    Ok(at)
}

fn binding_code<P: ?Sized>(b: &Binding<P>) -> u8 {
    match b {
        Binding::Unbound => 0,
        // callbacks never cross the boundary
        Binding::Remote | Binding::Local(_) => 1,
    }
}

fn write_payload(w: &mut Writer, payload: &Payload) -> Option<usize> {
    let (tag, prim, flags, binding, text): (u8, u8, u8, u8, Option<&str>) = match payload {
        Payload::None => return None,
        Payload::Source { returns, provider } => {
            let (prim, flags, text) = typeref_fields(returns);
            (TAG_SOURCE, prim, flags, binding_code(provider), text)
        }
        Payload::Event { returns, provider } => {
            let (prim, flags, text) = typeref_fields(returns);
            (TAG_EVENT, prim, flags, binding_code(provider), text)
        }
        Payload::Object { ident, provider } => {
            (TAG_OBJECT, ident.code(), 0, binding_code(provider), None)
        }
        Payload::Reference { path } => (TAG_REFERENCE, 0, 0, 0, Some(path.as_str())),
    };

    let at = w.reserve(PAYLOAD_RECORD_SIZE);
    w.set_u8(at + P_TAG, tag);
    w.set_u8(at + P_PRIM, prim);
    w.set_u8(at + P_FLAGS, flags);
    w.set_u8(at + P_BINDING, binding);
    if let Some(s) = text.filter(|s| !s.is_empty()) {
        let s_at = w.len();
        w.put_bytes(s.as_bytes());
        w.set_u64(at + P_STR_PTR, w.ptr(s_at));
        w.set_u32(at + P_STR_LEN, s.len() as u32);
    }
    Some(at)
}

fn typeref_fields(t: &TypeRef) -> (u8, u8, Option<&str>) {
    let array = if t.array { FLAG_ARRAY } else { 0 };
    match &t.data {
        DataType::Primitive(p) => (p.code(), array, None),
        DataType::Complex(path) => (0, array | FLAG_COMPLEX, Some(path.as_str())),
    }
}

fn bad(what: &str) -> Error {
    Error::at(ErrorKind::BadBlock, what)
}

/// Decode a packed subtree whose pointers live in `base`'s space. Provider
/// callbacks come back as [`Binding::Remote`].
pub fn unpack(buf: &[u8], base: u64) -> Result<SchemaTree> {
    let r = Reader::new(buf, base);
    if r.len() < NODE_RECORD_SIZE {
        return Err(bad("block shorter than one node record"));
    }
    let mut tree = SchemaTree::with_root(read_node(&r, 0)?);
    let root = tree.root().ok_or_else(|| bad("no root"))?;

    let mut seen = HashSet::from([0usize]);
    let mut work = vec![(root, 0usize)];
    while let Some((id, at)) = work.pop() {
        for child_at in child_offsets(&r, at)? {
            if !seen.insert(child_at) {
                return Err(bad("node reachable twice"));
            }
            let child = tree.add(id, read_node(&r, child_at)?)?;
            work.push((child, child_at));
        }
    }
    Ok(tree)
}

fn child_offsets(r: &Reader<'_>, at: usize) -> Result<Vec<usize>> {
    let count = r.u32(at + OFF_CHILD_COUNT)? as usize;
    let ptr = r.u64(at + OFF_CHILD_PTR)?;
    let Some(arr) = r.offset_of_ptr(ptr)? else {
        return if count == 0 {
            Ok(Vec::new())
        } else {
            Err(bad("children count without array"))
        };
    };
    if count.saturating_mul(8) > r.len() {
        return Err(bad("children count exceeds block"));
    }
    (0..count)
        .map(|i| {
            let off = r.deref(r.u64(arr + 8 * i)?)?;
            if off + NODE_RECORD_SIZE > r.len() {
                return Err(bad("node record past end of block"));
            }
            Ok(off)
        })
        .collect()
}

fn read_node(r: &Reader<'_>, at: usize) -> Result<Node> {
    let raw = r.bytes(at, MAX_NAME_LEN)?;
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let name = std::str::from_utf8(&raw[..end]).map_err(|_| bad("node name is not utf-8"))?;
    let kind = NodeKind::from_code(r.u8(at + OFF_KIND)?).ok_or_else(|| bad("unknown node kind"))?;
    let array = r.u8(at + OFF_ARRAY)? != 0;

    let mut node = Node::new(name, kind);
    node.array = array;
    if let Some(p) = r.offset_of_ptr(r.u64(at + OFF_PAYLOAD_PTR)?)? {
        node.payload = read_payload(r, p)?;
    }
    Ok(node)
}

fn read_payload(r: &Reader<'_>, at: usize) -> Result<Payload> {
    let tag = r.u8(at + P_TAG)?;
    let prim = r.u8(at + P_PRIM)?;
    let flags = r.u8(at + P_FLAGS)?;
    let bound = r.u8(at + P_BINDING)? != 0;
    let text = match r.offset_of_ptr(r.u64(at + P_STR_PTR)?)? {
        Some(s) => r.str(s, r.u32(at + P_STR_LEN)? as usize)?.to_string(),
        None => String::new(),
    };

    Ok(match tag {
        TAG_SOURCE => Payload::Source {
            returns: read_typeref(prim, flags, &text)?,
            provider: if bound { Binding::Remote } else { Binding::Unbound },
        },
        TAG_EVENT => Payload::Event {
            returns: read_typeref(prim, flags, &text)?,
            provider: if bound { Binding::Remote } else { Binding::Unbound },
        },
        TAG_OBJECT => Payload::Object {
            ident: Primitive::from_code(prim).ok_or_else(|| bad("unknown identifier type"))?,
            provider: if bound { Binding::Remote } else { Binding::Unbound },
        },
        TAG_REFERENCE => Payload::Reference { path: text },
        _ => return Err(bad("unknown payload tag")),
    })
}

fn read_typeref(prim: u8, flags: u8, text: &str) -> Result<TypeRef> {
    let data = if flags & FLAG_COMPLEX != 0 {
        DataType::Complex(text.to_string())
    } else {
        DataType::Primitive(Primitive::from_code(prim).ok_or_else(|| bad("unknown primitive"))?)
    };
    Ok(TypeRef {
        data,
        array: flags & FLAG_ARRAY != 0,
    })
}

/// Rewrite every pointer of a packed subtree from `old_base` to `new_base`.
///
/// Every pointer slot is located and checked before the first one is
/// rewritten, so a malformed block is rejected with the buffer untouched.
pub fn rebase(buf: &mut [u8], old_base: u64, new_base: u64) -> Result<()> {
    if old_base == new_base {
        return Ok(());
    }
    let mut slots = Vec::new();
    {
        let r = Reader::new(buf, old_base);
        if r.len() < NODE_RECORD_SIZE {
            return Err(bad("block shorter than one node record"));
        }
        let mut seen = HashSet::from([0usize]);
        let mut work = vec![0usize];
        while let Some(at) = work.pop() {
            slots.push(at + OFF_CHILD_PTR);
            slots.push(at + OFF_PAYLOAD_PTR);
            if let Some(p) = r.offset_of_ptr(r.u64(at + OFF_PAYLOAD_PTR)?)? {
                if p + PAYLOAD_RECORD_SIZE > r.len() {
                    return Err(bad("payload record past end of block"));
                }
                if let Some(text) = r.offset_of_ptr(r.u64(p + P_STR_PTR)?)? {
                    r.bytes(text, r.u32(p + P_STR_LEN)? as usize)?;
                }
                slots.push(p + P_STR_PTR);
            }
            if let Some(arr) = r.offset_of_ptr(r.u64(at + OFF_CHILD_PTR)?)? {
                let count = r.u32(at + OFF_CHILD_COUNT)? as usize;
                slots.extend((0..count).map(|i| arr + 8 * i));
            }
            for c in child_offsets(&r, at)? {
                if !seen.insert(c) {
                    return Err(bad("node reachable twice"));
                }
                work.push(c);
            }
        }
        for slot in &slots {
            r.offset_of_ptr(r.u64(*slot)?)?;
        }
        let top = new_base
            .checked_add(r.len() as u64)
            .ok_or_else(|| bad("block does not fit above the new base"))?;
        trace!(slots = slots.len(), top, "schema block validated for rebase");
    }
    for s in slots {
        rebase_ptr(buf, s, old_base, new_base)?;
    }
    Ok(())
}
