//! Syntax check of operator chains against the schema tree.

use dmreg_core::error::{Error, ErrorKind, Result};
use dmreg_core::schema::{NodeKind, SchemaTree};

use crate::model::{Operand, Operator, Predicate, StreamKind, Window};

/// Walk the chain once and reject the first malformed operator.
///
/// The error location is `op[i]`, the index of the offending operator.
pub fn check_query_syntax(tree: &SchemaTree, ops: &[Operator]) -> Result<()> {
    if ops.is_empty() {
        return Err(Error::at(ErrorKind::WrongOrder, "op[0]"));
    }
    for (i, op) in ops.iter().enumerate() {
        check_operator(tree, i, op).map_err(|e| e.or_at(format!("op[{i}]")))?;
    }
    Ok(())
}

fn check_operator(tree: &SchemaTree, position: usize, op: &Operator) -> Result<()> {
    match op {
        Operator::Stream(_) if position != 0 => Err(ErrorKind::WrongOrder.into()),
        _ if position == 0 && !matches!(op, Operator::Stream(_)) => Err(ErrorKind::WrongOrder.into()),
        Operator::Stream(s) => {
            let node = tree.resolve(&s.path).ok_or(ErrorKind::StreamNotFound)?;
            let kind = tree.node(node).map(|n| n.kind).ok_or(ErrorKind::StreamNotFound)?;
            if kind != s.kind.node_kind() {
                return Err(ErrorKind::WrongStreamType.into());
            }
            match s.kind {
                StreamKind::Source if s.period_ms == 0 => Err(ErrorKind::NoFrequency.into()),
                StreamKind::Object if s.events.is_empty() || !s.events.is_valid() => {
                    Err(ErrorKind::NoObjectStatus.into())
                }
                _ => Ok(()),
            }
        }
        Operator::Filter { predicates } => {
            if predicates.is_empty() {
                return Err(ErrorKind::NoPredicates.into());
            }
            for p in predicates {
                check_predicate(tree, p, false)?;
            }
            Ok(())
        }
        Operator::Select { elements } | Operator::Group { elements } => check_elements(tree, elements),
        Operator::Sort { elements, window } => {
            check_elements(tree, elements)?;
            check_window(window)
        }
        Operator::Aggregate {
            elements,
            window,
            advance,
            ..
        } => {
            check_elements(tree, elements)?;
            check_window(window)?;
            check_window(advance)
        }
        Operator::Join { target, predicates } => {
            let kind = tree
                .resolve(target)
                .and_then(|id| tree.node(id))
                .map(|n| n.kind)
                .ok_or(ErrorKind::JoinType)?;
            if !matches!(kind, NodeKind::Source | NodeKind::Object) {
                return Err(ErrorKind::JoinType.into());
            }
            if predicates.is_empty() {
                return Err(ErrorKind::NoPredicates.into());
            }
            for p in predicates {
                check_predicate(tree, p, true)?;
            }
            Ok(())
        }
    }
}

fn check_elements(tree: &SchemaTree, elements: &[String]) -> Result<()> {
    if elements.is_empty() {
        return Err(ErrorKind::NoElements.into());
    }
    for e in elements {
        if tree.resolve(e).is_none() {
            return Err(ErrorKind::NoElement.into());
        }
    }
    Ok(())
}

fn check_window(w: &Window) -> Result<()> {
    if w.size == 0 {
        return Err(ErrorKind::Size.into());
    }
    Ok(())
}

fn check_predicate(tree: &SchemaTree, p: &Predicate, joined_allowed: bool) -> Result<()> {
    for operand in [&p.left, &p.right] {
        match operand {
            Operand::Literal(_) => {}
            Operand::Element(path) => {
                if tree.resolve(path).is_none() {
                    return Err(ErrorKind::NoElement.into());
                }
            }
            Operand::Joined(path) => {
                if !joined_allowed || tree.resolve(path).is_none() {
                    return Err(ErrorKind::NoElement.into());
                }
            }
        }
    }
    Ok(())
}
