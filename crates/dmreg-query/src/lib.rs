#![forbid(unsafe_code)]
//! dmreg-query: operator chains registered against the datamodel.
//!
//! - `model`: stream root + filter/select/sort/group/aggregate/join operators.
//! - `validate`: the syntax checker run before a query is attached to a node.
//! - `executor`: runs one tuple through a chain and fires the completion callback.
//! - `dsl::yaml`: definition files (schema + queries + config overrides).
//!
//! Sort, group, aggregate and join are checked against the schema but not
//! executed; tuples pass through them unchanged.

pub mod dsl;
pub mod executor;
pub mod filter;
pub mod model;
pub mod validate;

pub use executor::{execute, run_chain, Outcome};
pub use model::{
    AggFunc, CmpOp, CompletionFn, EventMask, Operand, Operator, Ownership, Predicate, Query,
    QueryFlags, StreamKind, StreamOp, Window, WindowUnit,
};
pub use validate::check_query_syntax;
