//! Merging candidate trees into the global tree, and removing them again.

use tracing::{debug, trace};

use crate::error::{Error, ErrorKind, Result};
use crate::id::NodeId;

use super::{NodeKind, Payload, SchemaTree};

/// Merge `from` into `into`, walking both in lockstep from their roots.
///
/// Same-named siblings must agree on kind: sources, events, complex types and
/// leaves can never be merged (`SameNode`, or `DifferentNodeType` when their
/// declared types differ); objects must carry the same identifier type
/// (`ObjectIdent`); namespaces recurse. Unmatched candidate subtrees are
/// deep-copied under the matching parent.
///
/// With `dry_run` nothing is mutated. The real merge may stop half way on a
/// conflict, so callers run the dry run first while holding the registry lock
/// across both calls.
pub fn merge(dry_run: bool, into: &mut SchemaTree, from: &SchemaTree) -> Result<()> {
    let into_root = into.root().ok_or(ErrorKind::NullArgument)?;
    let from_root = from.root().ok_or(ErrorKind::NullArgument)?;

    let mut work = vec![(into_root, from_root)];
    while let Some((dst, src)) = work.pop() {
        for c in from.children(src).to_vec() {
            let cand = from.expect(c)?;
            match into.child_by_name(dst, &cand.name) {
                Some(existing) => {
                    let live = into.expect(existing)?;
                    conflict(live.kind, &live.payload, live.array, cand.kind, &cand.payload, cand.array)
                        .map_err(|k| Error::at(k, from.path_of(c)))?;
                    trace!(path = %from.path_of(c), "merge: descending into existing node");
                    work.push((existing, c));
                }
                None if dry_run => {}
                None => {
                    debug!(path = %from.path_of(c), kind = %cand.kind, "merge: grafting subtree");
                    into.graft(dst, from, c)?;
                }
            }
        }
    }
    Ok(())
}

/// Decide whether a candidate node may share a name with a live sibling.
fn conflict(
    live_kind: NodeKind,
    live_payload: &Payload,
    live_array: bool,
    kind: NodeKind,
    payload: &Payload,
    array: bool,
) -> std::result::Result<(), ErrorKind> {
    if live_kind != kind || live_array != array {
        return Err(ErrorKind::DifferentNodeType);
    }
    match kind {
        NodeKind::Model | NodeKind::Namespace => Ok(()),
        NodeKind::Object => {
            if live_payload.same_shape(payload) {
                Ok(())
            } else {
                Err(ErrorKind::ObjectIdent)
            }
        }
        NodeKind::Source | NodeKind::Event | NodeKind::Reference => {
            if live_payload.same_shape(payload) {
                Err(ErrorKind::SameNode)
            } else {
                Err(ErrorKind::DifferentNodeType)
            }
        }
        _ => Err(ErrorKind::SameNode),
    }
}

/// Remove the nodes named by `doomed` from `root`.
///
/// `doomed` is walked in lockstep with the live tree. Every doomed leaf removes the
/// matching live subtree; a live node left without children by the removal is
/// removed as well, cascading upwards. If the root itself ends up childless the
/// whole tree is freed and the root cleared; callers must `reinit` before the
/// next registration.
///
/// Every doomed path is resolved before anything is removed, so a `NotFound`
/// leaves the tree untouched.
pub fn delete_subtree(root: &mut SchemaTree, doomed: &SchemaTree) -> Result<()> {
    let live_root = root.root().ok_or(ErrorKind::NullArgument)?;
    let doomed_root = doomed.root().ok_or(ErrorKind::NullArgument)?;

    // Pair every doomed node with its live counterpart first.
    let mut leaves = Vec::new();
    let mut work = vec![(live_root, doomed_root)];
    while let Some((live, s)) = work.pop() {
        for c in doomed.children(s) {
            let name = &doomed.expect(*c)?.name;
            let matched = root
                .child_by_name(live, name)
                .ok_or_else(|| Error::at(ErrorKind::NotFound, doomed.path_of(*c)))?;
            if doomed.children(*c).is_empty() {
                leaves.push(matched);
            } else {
                work.push((matched, *c));
            }
        }
    }

    for leaf in leaves {
        if root.node(leaf).is_none() {
            continue;
        }
        debug!(path = %root.path_of(leaf), "delete: removing subtree");
        let parent = root.node(leaf).and_then(|n| n.parent());
        root.free_subtree(leaf, true)?;
        cascade(root, parent)?;
    }

    if root.is_empty() {
        debug!("delete: root left without children, freeing tree");
        if let Some(r) = root.root() {
            root.free_subtree(r, true)?;
        }
    }
    Ok(())
}

/// Remove `start` and its ancestors while they are childless (stops at the root).
fn cascade(tree: &mut SchemaTree, start: Option<NodeId>) -> Result<()> {
    let mut cur = start;
    while let Some(id) = cur {
        let Some(node) = tree.node(id) else { break };
        if !node.children().is_empty() || node.parent().is_none() {
            break;
        }
        let parent = node.parent();
        trace!(path = %tree.path_of(id), "delete: cascading to childless parent");
        tree.free_subtree(id, true)?;
        cur = parent;
    }
    Ok(())
}
