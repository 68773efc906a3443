//! Structural and type validation of candidate trees.

use std::collections::HashSet;

use crate::error::{Error, ErrorKind, Result};
use crate::id::NodeId;

use super::{
    ChildRule, DataType, NodeKind, Payload, SchemaTree, TypeRef, MAX_NAME_LEN, MAX_TYPE_DEPTH,
};

/// Validate `candidate` before it is merged into `existing`.
///
/// Pre-order over the candidate. Per node: name, payload presence, child count
/// class, permitted child kinds, callbacks and declared types. Complex return
/// types and references must resolve in the candidate itself or in `existing`.
/// A complex type may not contain itself through non-array references.
/// The error carries the dotted path of the first offending node.
pub fn check_syntax(existing: Option<&SchemaTree>, candidate: &SchemaTree) -> Result<()> {
    let root = candidate.root().ok_or(ErrorKind::NullArgument)?;
    let root_node = candidate.expect(root)?;
    if root_node.kind != NodeKind::Model {
        return Err(Error::at(ErrorKind::WrongChildType, root_node.name.clone()));
    }

    for id in candidate.preorder(root) {
        check_node(existing, candidate, id).map_err(|e| e.or_at(display_path(candidate, id)))?;
    }
    for id in candidate.preorder(root) {
        let node = candidate.expect(id)?;
        if node.kind != NodeKind::Complex || node.array {
            continue;
        }
        let mut on_path = Vec::new();
        expand_complex(existing, candidate, candidate, id, &mut on_path)
            .map_err(|e| e.or_at(display_path(candidate, id)))?;
    }
    Ok(())
}

/// Walk the inline fields of a complex. Array slots are pointers and end the walk.
fn expand_complex(
    existing: Option<&SchemaTree>,
    candidate: &SchemaTree,
    tree: &SchemaTree,
    id: NodeId,
    on_path: &mut Vec<String>,
) -> Result<()> {
    let path = tree.path_of(id);
    if on_path.len() > MAX_TYPE_DEPTH || on_path.contains(&path) {
        return Err(ErrorKind::UnresolvedType.into());
    }
    on_path.push(path);
    for c in tree.expect(id)?.children() {
        let child = tree.expect(*c)?;
        if child.array {
            continue;
        }
        match child.kind {
            NodeKind::Complex => expand_complex(existing, candidate, tree, *c, on_path)?,
            NodeKind::Reference => {
                if let Some((t, target)) = follow_reference(existing, candidate, tree, *c)? {
                    expand_complex(existing, candidate, t, target, on_path)?;
                }
            }
            _ => {}
        }
    }
    on_path.pop();
    Ok(())
}

/// Complex a reference chain ends at, if it is laid out inline.
fn follow_reference<'a>(
    existing: Option<&'a SchemaTree>,
    candidate: &'a SchemaTree,
    tree: &'a SchemaTree,
    id: NodeId,
) -> Result<Option<(&'a SchemaTree, NodeId)>> {
    let (mut tree, mut id) = (tree, id);
    for _ in 0..=MAX_TYPE_DEPTH {
        let Payload::Reference { path } = &tree.expect(id)?.payload else {
            return Ok(None);
        };
        let Some((t, target)) = find(existing, candidate, path) else {
            return Ok(None);
        };
        let node = t.expect(target)?;
        if node.array {
            return Ok(None);
        }
        match node.kind {
            NodeKind::Complex => return Ok(Some((t, target))),
            NodeKind::Reference => (tree, id) = (t, target),
            _ => return Ok(None),
        }
    }
    Err(ErrorKind::UnresolvedType.into())
}

fn find<'a>(
    existing: Option<&'a SchemaTree>,
    candidate: &'a SchemaTree,
    path: &str,
) -> Option<(&'a SchemaTree, NodeId)> {
    if let Some(id) = candidate.resolve(path) {
        return Some((candidate, id));
    }
    let tree = existing?;
    tree.resolve(path).map(|id| (tree, id))
}

fn display_path(tree: &SchemaTree, id: NodeId) -> String {
    let p = tree.path_of(id);
    if p.is_empty() {
        tree.node(id).map(|n| n.name.clone()).unwrap_or_default()
    } else {
        p
    }
}

fn check_node(existing: Option<&SchemaTree>, candidate: &SchemaTree, id: NodeId) -> Result<()> {
    let node = candidate.expect(id)?;

    if node.kind != NodeKind::Model || node.parent().is_some() {
        check_name(&node.name)?;
    }
    if node.kind == NodeKind::Model && node.parent().is_some() {
        return Err(ErrorKind::WrongChildType.into());
    }
    if node.array && !node.kind.is_data() {
        return Err(ErrorKind::UnexpectedTypeInfo.into());
    }

    check_payload(existing, candidate, node.kind, &node.payload)?;

    let children = node.children();
    match node.kind.child_rule() {
        ChildRule::None if !children.is_empty() => {
            return Err(ErrorKind::UnexpectedChildren.into());
        }
        ChildRule::AtLeastOne if children.is_empty() => {
            return Err(ErrorKind::NoChildren.into());
        }
        _ => {}
    }

    let permitted = node.kind.permitted_children();
    let mut seen = HashSet::with_capacity(children.len());
    for c in children {
        let child = candidate.expect(*c)?;
        if !permitted.contains(child.kind) {
            return Err(Error::at(
                ErrorKind::WrongChildType,
                display_path(candidate, *c),
            ));
        }
        if !seen.insert(child.name.as_str()) {
            return Err(Error::at(
                ErrorKind::DuplicateSibling,
                display_path(candidate, *c),
            ));
        }
    }
    Ok(())
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('.') {
        return Err(ErrorKind::BadName.into());
    }
    Ok(())
}

fn check_payload(
    existing: Option<&SchemaTree>,
    candidate: &SchemaTree,
    kind: NodeKind,
    payload: &Payload,
) -> Result<()> {
    match (kind, payload) {
        (NodeKind::Source, Payload::Source { returns, provider }) => {
            if !provider.is_bound() {
                return Err(ErrorKind::MissingCallback.into());
            }
            check_return_type(existing, candidate, returns)
        }
        (NodeKind::Event, Payload::Event { returns, provider }) => {
            if !provider.is_bound() {
                return Err(ErrorKind::MissingCallback.into());
            }
            check_return_type(existing, candidate, returns)
        }
        (NodeKind::Object, Payload::Object { provider, .. }) => {
            // every primitive is a valid identifier type
            if !provider.is_bound() {
                return Err(ErrorKind::MissingCallback.into());
            }
            Ok(())
        }
        (NodeKind::Reference, Payload::Reference { path }) => {
            let target = lookup(existing, candidate, path).ok_or(ErrorKind::UnresolvedType)?;
            if !target.is_data() {
                return Err(ErrorKind::WrongReturnType.into());
            }
            Ok(())
        }
        (NodeKind::Source | NodeKind::Event | NodeKind::Object | NodeKind::Reference, _) => {
            Err(ErrorKind::MissingTypeInfo.into())
        }
        (_, Payload::None) => Ok(()),
        _ => Err(ErrorKind::UnexpectedTypeInfo.into()),
    }
}

fn check_return_type(
    existing: Option<&SchemaTree>,
    candidate: &SchemaTree,
    returns: &TypeRef,
) -> Result<()> {
    match &returns.data {
        DataType::Primitive(_) => Ok(()),
        DataType::Complex(path) => {
            match lookup(existing, candidate, path).ok_or(ErrorKind::UnresolvedType)? {
                NodeKind::Complex => Ok(()),
                _ => Err(ErrorKind::WrongReturnType.into()),
            }
        }
    }
}

/// Kind of the node at `path`, looked up in the candidate first.
fn lookup(existing: Option<&SchemaTree>, candidate: &SchemaTree, path: &str) -> Option<NodeKind> {
    let (tree, id) = find(existing, candidate, path)?;
    tree.node(id).map(|n| n.kind)
}
