//! The typed datamodel tree.
//!
//! Providers describe what they publish as a tree of namespaces, sources,
//! events, stateful objects and composite types. The registry keeps one global
//! tree; providers submit candidate trees that are validated (`check_syntax`)
//! and merged into it (`merge`). Nodes live in an arena and reference each other
//! by [`NodeId`]; parents own the ordered list of their children.

mod check;
mod layout;
mod merge;

pub use check::check_syntax;
pub use layout::{offset_of, resolve_type, size_of, ResolvedType, ValueBase};
pub use merge::{delete_subtree, merge};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::id::{NodeId, QueryId};
use crate::provider::{EventProvider, ObjectProvider, SourceProvider};

/// Longest node name accepted by `check_syntax`.
pub const MAX_NAME_LEN: usize = 64;

/// Name given to the `Model` root of a fresh tree.
pub const ROOT_NAME: &str = "model";

/// Deepest nesting that type resolution will follow before giving up
/// (guards against self-referencing complex types).
pub const MAX_TYPE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Model,
    Namespace,
    Source,
    Event,
    Object,
    Complex,
    Reference,
    String,
    Int,
    Float,
    Byte,
}

impl NodeKind {
    pub const ALL: [NodeKind; 11] = [
        NodeKind::Model,
        NodeKind::Namespace,
        NodeKind::Source,
        NodeKind::Event,
        NodeKind::Object,
        NodeKind::Complex,
        NodeKind::Reference,
        NodeKind::String,
        NodeKind::Int,
        NodeKind::Float,
        NodeKind::Byte,
    ];

    pub const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Stable wire code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn as_primitive(self) -> Option<Primitive> {
        match self {
            NodeKind::String => Some(Primitive::String),
            NodeKind::Int => Some(Primitive::Int),
            NodeKind::Float => Some(Primitive::Float),
            NodeKind::Byte => Some(Primitive::Byte),
            _ => None,
        }
    }

    pub fn is_primitive(self) -> bool {
        self.as_primitive().is_some()
    }

    /// Kinds that describe data layout and may carry the array flag.
    pub fn is_data(self) -> bool {
        self.is_primitive() || matches!(self, NodeKind::Complex | NodeKind::Reference)
    }

    /// Kinds a query stream can be rooted at.
    pub fn is_stream(self) -> bool {
        matches!(self, NodeKind::Source | NodeKind::Event | NodeKind::Object)
    }

    pub(crate) fn child_rule(self) -> ChildRule {
        match self {
            NodeKind::Model | NodeKind::Namespace | NodeKind::Complex => ChildRule::AtLeastOne,
            NodeKind::Object => ChildRule::Any,
            _ => ChildRule::None,
        }
    }

    pub(crate) fn permitted_children(self) -> KindSet {
        match self {
            NodeKind::Model => KindSet::of(&[NodeKind::Namespace]),
            NodeKind::Namespace => KindSet::of(&[
                NodeKind::Namespace,
                NodeKind::Source,
                NodeKind::Event,
                NodeKind::Object,
                NodeKind::Complex,
            ]),
            NodeKind::Object => KindSet::of(&[NodeKind::Source, NodeKind::Event]),
            NodeKind::Complex => KindSet::of(&[
                NodeKind::Complex,
                NodeKind::Reference,
                NodeKind::String,
                NodeKind::Int,
                NodeKind::Float,
                NodeKind::Byte,
            ]),
            _ => KindSet::EMPTY,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Model => "model",
            NodeKind::Namespace => "namespace",
            NodeKind::Source => "source",
            NodeKind::Event => "event",
            NodeKind::Object => "object",
            NodeKind::Complex => "complex",
            NodeKind::Reference => "reference",
            NodeKind::String => "string",
            NodeKind::Int => "int",
            NodeKind::Float => "float",
            NodeKind::Byte => "byte",
        };
        f.write_str(s)
    }
}

/// Bitmask over [`NodeKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSet(u16);

impl KindSet {
    pub const EMPTY: KindSet = KindSet(0);

    pub const fn of(kinds: &[NodeKind]) -> Self {
        let mut bits = 0u16;
        let mut i = 0;
        while i < kinds.len() {
            bits |= kinds[i].bit();
            i += 1;
        }
        KindSet(bits)
    }

    pub const fn contains(self, kind: NodeKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildRule {
    None,
    AtLeastOne,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    Byte,
    Int,
    Float,
    String,
}

impl Primitive {
    pub const ALL: [Primitive; 4] = [
        Primitive::Byte,
        Primitive::Int,
        Primitive::Float,
        Primitive::String,
    ];

    /// Stable wire code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn kind(self) -> NodeKind {
        match self {
            Primitive::Byte => NodeKind::Byte,
            Primitive::Int => NodeKind::Int,
            Primitive::Float => NodeKind::Float,
            Primitive::String => NodeKind::String,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "byte" | "u8" => Some(Primitive::Byte),
            "int" | "i32" => Some(Primitive::Int),
            "float" | "f64" => Some(Primitive::Float),
            "string" | "str" => Some(Primitive::String),
            _ => None,
        }
    }
}

/// Base of a declared return type: a primitive or the dotted path of a
/// complex type somewhere in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Primitive(Primitive),
    Complex(String),
}

/// Declared return type of a source or event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    pub data: DataType,
    pub array: bool,
}

impl TypeRef {
    pub fn primitive(p: Primitive) -> Self {
        Self {
            data: DataType::Primitive(p),
            array: false,
        }
    }

    pub fn complex(path: impl Into<String>) -> Self {
        Self {
            data: DataType::Complex(path.into()),
            array: false,
        }
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    /// `int`, `string[]`, `net.packetType`, `net.packetType[]`.
    pub fn parse(s: &str) -> Self {
        let (base, array) = match s.strip_suffix("[]") {
            Some(b) => (b, true),
            None => (s, false),
        };
        let data = match Primitive::parse(base) {
            Some(p) => DataType::Primitive(p),
            None => DataType::Complex(base.to_string()),
        };
        Self { data, array }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            DataType::Primitive(p) => write!(f, "{}", p.kind())?,
            DataType::Complex(path) => f.write_str(path)?,
        }
        if self.array {
            f.write_str("[]")?;
        }
        Ok(())
    }
}

/// Where the callbacks of a source/event/object live.
///
/// `Remote` marks nodes whose provider sits on the other side of the
/// cross-boundary channel (or in a definition file): they validate, but the
/// registry never calls into them.
pub enum Binding<P: ?Sized> {
    Unbound,
    Remote,
    Local(Arc<P>),
}

impl<P: ?Sized> Binding<P> {
    pub fn is_bound(&self) -> bool {
        !matches!(self, Binding::Unbound)
    }

    pub fn local(&self) -> Option<&Arc<P>> {
        match self {
            Binding::Local(p) => Some(p),
            _ => None,
        }
    }
}

impl<P: ?Sized> Clone for Binding<P> {
    fn clone(&self) -> Self {
        match self {
            Binding::Unbound => Binding::Unbound,
            Binding::Remote => Binding::Remote,
            Binding::Local(p) => Binding::Local(Arc::clone(p)),
        }
    }
}

impl<P: ?Sized> fmt::Debug for Binding<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Unbound => f.write_str("Unbound"),
            Binding::Remote => f.write_str("Remote"),
            Binding::Local(_) => f.write_str("Local(..)"),
        }
    }
}

/// Kind-specific node payload.
#[derive(Debug, Clone)]
pub enum Payload {
    None,
    Source {
        returns: TypeRef,
        provider: Binding<dyn SourceProvider>,
    },
    Event {
        returns: TypeRef,
        provider: Binding<dyn EventProvider>,
    },
    Object {
        ident: Primitive,
        provider: Binding<dyn ObjectProvider>,
    },
    Reference {
        path: String,
    },
}

impl Payload {
    /// Payload equality ignoring provider identity.
    pub fn same_shape(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::None, Payload::None) => true,
            (Payload::Source { returns: a, .. }, Payload::Source { returns: b, .. }) => a == b,
            (Payload::Event { returns: a, .. }, Payload::Event { returns: b, .. }) => a == b,
            (Payload::Object { ident: a, .. }, Payload::Object { ident: b, .. }) => a == b,
            (Payload::Reference { path: a }, Payload::Reference { path: b }) => a == b,
            _ => false,
        }
    }
}

/// One entry of the datamodel.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Array flag; only meaningful on data kinds.
    pub array: bool,
    pub payload: Payload,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    queries: Vec<QueryId>,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            array: false,
            payload: Payload::None,
            parent: None,
            children: Vec::new(),
            queries: Vec::new(),
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Namespace)
    }

    pub fn complex(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Complex)
    }

    pub fn primitive(name: impl Into<String>, p: Primitive) -> Self {
        Self::new(name, p.kind())
    }

    pub fn reference(name: impl Into<String>, path: impl Into<String>) -> Self {
        let mut n = Self::new(name, NodeKind::Reference);
        n.payload = Payload::Reference { path: path.into() };
        n
    }

    pub fn source(
        name: impl Into<String>,
        returns: TypeRef,
        provider: Binding<dyn SourceProvider>,
    ) -> Self {
        let mut n = Self::new(name, NodeKind::Source);
        n.payload = Payload::Source { returns, provider };
        n
    }

    pub fn event(
        name: impl Into<String>,
        returns: TypeRef,
        provider: Binding<dyn EventProvider>,
    ) -> Self {
        let mut n = Self::new(name, NodeKind::Event);
        n.payload = Payload::Event { returns, provider };
        n
    }

    pub fn object(
        name: impl Into<String>,
        ident: Primitive,
        provider: Binding<dyn ObjectProvider>,
    ) -> Self {
        let mut n = Self::new(name, NodeKind::Object);
        n.payload = Payload::Object { ident, provider };
        n
    }

    pub fn as_array(mut self) -> Self {
        self.array = true;
        self
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Ids of the queries registered on this node.
    pub fn queries(&self) -> &[QueryId] {
        &self.queries
    }

    pub fn returns(&self) -> Option<&TypeRef> {
        match &self.payload {
            Payload::Source { returns, .. } | Payload::Event { returns, .. } => Some(returns),
            _ => None,
        }
    }

    pub fn ident(&self) -> Option<Primitive> {
        match &self.payload {
            Payload::Object { ident, .. } => Some(*ident),
            _ => None,
        }
    }

    /// Copy of the node without its structural links and query slots.
    fn detached_copy(&self) -> Node {
        Node {
            name: self.name.clone(),
            kind: self.kind,
            array: self.array,
            payload: self.payload.clone(),
            parent: None,
            children: Vec::new(),
            queries: Vec::new(),
        }
    }
}

/// Arena-backed schema tree with a single `Model` root.
#[derive(Debug, Clone)]
pub struct SchemaTree {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    root: Option<NodeId>,
}

impl Default for SchemaTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaTree {
    /// A tree holding only an empty `Model` root.
    pub fn new() -> Self {
        let mut t = Self::empty();
        t.reinit();
        t
    }

    /// A tree with no root at all (the state after the root was deleted).
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
        }
    }

    /// A tree rooted at `node` (any kind). Used when decoding subtrees.
    pub fn with_root(node: Node) -> Self {
        let mut t = Self::empty();
        let mut node = node;
        node.parent = None;
        node.children.clear();
        let root = t.alloc(node);
        t.root = Some(root);
        t
    }

    /// Drop everything and install a fresh, childless `Model` root.
    pub fn reinit(&mut self) {
        self.nodes.clear();
        self.free.clear();
        let root = self.alloc(Node::new(ROOT_NAME, NodeKind::Model));
        self.root = Some(root);
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// True when there is no root or the root has no children.
    pub fn is_empty(&self) -> bool {
        match self.root.and_then(|r| self.node(r)) {
            Some(root) => root.children.is_empty(),
            None => true,
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(|n| n.as_mut())
    }

    pub(crate) fn expect(&self, id: NodeId) -> Result<&Node> {
        self.node(id).ok_or_else(|| Error::at(ErrorKind::NotFound, id.to_string()))
    }

    fn expect_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.node_mut(id)
            .ok_or_else(|| Error::at(ErrorKind::NotFound, id.to_string()))
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId::new(slot as u64)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId::new((self.nodes.len() - 1) as u64)
            }
        }
    }

    /// Append `node` as the last child of `parent`. No validation happens here;
    /// run [`check_syntax`] before submitting the tree.
    pub fn add(&mut self, parent: NodeId, node: Node) -> Result<NodeId> {
        self.expect(parent)?;
        let mut node = node;
        node.parent = Some(parent);
        node.children.clear();
        let id = self.alloc(node);
        self.expect_mut(parent)?.children.push(id);
        Ok(id)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.node(*c).map(|n| n.name == name).unwrap_or(false))
    }

    /// Resolve a dotted path (`net.device.onRx`) starting below the root.
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        let root = self.root?;
        self.resolve_from(root, path)
    }

    /// Resolve a dotted path relative to `start`.
    pub fn resolve_from(&self, start: NodeId, path: &str) -> Option<NodeId> {
        if path.is_empty() {
            return None;
        }
        let mut cur = start;
        for seg in path.split('.') {
            cur = self.child_by_name(cur, seg)?;
        }
        Some(cur)
    }

    /// Dotted path of `id` below the root; the root itself maps to "".
    pub fn path_of(&self, id: NodeId) -> String {
        let mut segs = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let Some(n) = self.node(c) else { break };
            if n.parent.is_none() {
                break;
            }
            segs.push(n.name.as_str());
            cur = n.parent;
        }
        segs.reverse();
        segs.join(".")
    }

    /// Pre-order listing of the subtree at `start`.
    pub fn preorder(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let Some(n) = self.node(id) else { continue };
            out.push(id);
            for c in n.children.iter().rev() {
                stack.push(*c);
            }
        }
        out
    }

    /// Deep copy of the subtree at `node` as a standalone tree rooted at the copy.
    /// Query slots are not copied.
    pub fn copy_subtree(&self, node: NodeId) -> Result<SchemaTree> {
        let mut out = SchemaTree::empty();
        let top = self.expect(node)?.detached_copy();
        let root = out.alloc(top);
        out.root = Some(root);
        out.copy_children(root, self, node)?;
        Ok(out)
    }

    /// Deep copy the subtree at `src_node` of `src` and append it under `parent`.
    pub fn graft(&mut self, parent: NodeId, src: &SchemaTree, src_node: NodeId) -> Result<NodeId> {
        let copy = src.expect(src_node)?.detached_copy();
        let id = self.add(parent, copy)?;
        self.copy_children(id, src, src_node)?;
        Ok(id)
    }

    fn copy_children(&mut self, dst: NodeId, src: &SchemaTree, src_node: NodeId) -> Result<()> {
        let mut work = vec![(dst, src_node)];
        while let Some((d, s)) = work.pop() {
            for c in src.children(s).to_vec() {
                let copy = src.expect(c)?.detached_copy();
                let id = self.add(d, copy)?;
                work.push((id, c));
            }
        }
        Ok(())
    }

    /// Free every descendant of `node`. With `free_node_itself` the node is
    /// also unlinked from its parent and released; otherwise only its payload
    /// and children are cleared in place.
    pub fn free_subtree(&mut self, node: NodeId, free_node_itself: bool) -> Result<()> {
        self.expect(node)?;
        let descendants: Vec<NodeId> = self.preorder(node).into_iter().skip(1).collect();
        for d in descendants {
            self.release(d);
        }
        if free_node_itself {
            self.detach(node);
            self.release(node);
            if self.root == Some(node) {
                self.root = None;
            }
        } else {
            let n = self.expect_mut(node)?;
            n.children.clear();
            n.payload = Payload::None;
        }
        Ok(())
    }

    fn release(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id.index()) {
            if slot.take().is_some() {
                self.free.push(id.index());
            }
        }
    }

    /// Unlink `id` from its parent's children list (compacting it).
    pub(crate) fn detach(&mut self, id: NodeId) {
        let parent = self.node(id).and_then(|n| n.parent);
        if let Some(p) = parent.and_then(|p| self.node_mut(p)) {
            p.children.retain(|c| *c != id);
        }
    }

    /// Canonical deep-equality walk: names, kinds, array flags, child order
    /// and payload shapes must all agree.
    pub fn structurally_eq(&self, a: NodeId, other: &SchemaTree, b: NodeId) -> bool {
        let mut work = vec![(a, b)];
        while let Some((x, y)) = work.pop() {
            let (Some(nx), Some(ny)) = (self.node(x), other.node(y)) else {
                return false;
            };
            if nx.name != ny.name
                || nx.kind != ny.kind
                || nx.array != ny.array
                || !nx.payload.same_shape(&ny.payload)
                || nx.children.len() != ny.children.len()
            {
                return false;
            }
            work.extend(nx.children.iter().copied().zip(ny.children.iter().copied()));
        }
        true
    }

    /// Register `query` in the slot table of `node`.
    pub fn attach_query(&mut self, node: NodeId, query: QueryId, cap: Option<usize>) -> Result<()> {
        let path = self.path_of(node);
        let n = self.expect_mut(node)?;
        if let Some(cap) = cap {
            if n.queries.len() >= cap {
                return Err(Error::at(ErrorKind::QuerySlotsFull, path));
            }
        }
        n.queries.push(query);
        Ok(())
    }

    /// Remove `query` from the slot table of `node`; returns whether it was there.
    pub fn detach_query(&mut self, node: NodeId, query: QueryId) -> bool {
        match self.node_mut(node) {
            Some(n) => {
                let before = n.queries.len();
                n.queries.retain(|q| *q != query);
                n.queries.len() != before
            }
            None => false,
        }
    }
}
