//! Runs a tuple through a query's operator chain.
//!
//! `Pending -> Running -> {Completed, Discarded}`. A completed tuple is handed
//! to the query's completion callback, which owns it from then on; a discarded
//! tuple is dropped here. Rejection is normal control flow, not an error.

use tracing::{debug, trace};

use dmreg_core::schema::SchemaTree;
use dmreg_core::tuple::Tuple;

use crate::filter::eval_all;
use crate::model::{Operator, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The callback fired with the surviving tuple.
    Completed,
    /// A filter or select rejected the tuple.
    Discarded,
}

/// Execute `query` on `tuple`, starting at operator `start_step`.
///
/// A non-zero `start_step` resumes a chain that a remote peer already ran
/// partially.
pub fn execute(tree: &SchemaTree, query: &Query, tuple: Tuple, start_step: usize) -> Outcome {
    match run_chain(tree, query, tuple, start_step) {
        Some(tuple) => {
            query.complete(tuple);
            Outcome::Completed
        }
        None => Outcome::Discarded,
    }
}

/// The operator walk of [`execute`] without the callback: `None` when the
/// tuple was discarded. Lets a caller release its locks before completing.
pub fn run_chain(tree: &SchemaTree, query: &Query, mut tuple: Tuple, start_step: usize) -> Option<Tuple> {
    for (i, op) in query.ops.iter().enumerate().skip(start_step) {
        match op {
            // already consumed to produce the tuple
            Operator::Stream(_) => {}
            Operator::Filter { predicates } => match eval_all(tree, &tuple, predicates) {
                Ok(true) => {}
                Ok(false) => {
                    trace!(query = %query.id, step = i, "filter rejected tuple");
                    return None;
                }
                Err(e) => {
                    debug!(query = %query.id, step = i, error = %e, "filter could not evaluate tuple");
                    return None;
                }
            },
            Operator::Select { elements } => {
                tuple.retain_items(|item| elements.iter().any(|e| selects(e, &item.name)));
                if tuple.is_empty() {
                    trace!(query = %query.id, step = i, "select left no items");
                    return None;
                }
            }
            Operator::Sort { .. }
            | Operator::Group { .. }
            | Operator::Aggregate { .. }
            | Operator::Join { .. } => {
                trace!(query = %query.id, step = i, op = op.name(), "operator not executed, passing through");
            }
        }
    }
    Some(tuple)
}

/// `element` keeps `item` when it names it or one of its ancestors.
fn selects(element: &str, item: &str) -> bool {
    item == element
        || item
            .strip_prefix(element)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::selects;

    #[test]
    fn select_matches_on_segment_boundaries() {
        assert!(selects("net.pkt", "net.pkt"));
        assert!(selects("net", "net.pkt"));
        assert!(!selects("net.pk", "net.pkt"));
        assert!(!selects("net.pkt.len", "net.pkt"));
    }
}
