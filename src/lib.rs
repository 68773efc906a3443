#![forbid(unsafe_code)]
//! dmreg: a typed datamodel registry with a continuous query engine.
//!
//! Umbrella over the workspace crates. Most users want [`Engine`], the
//! provider traits and the schema builders from [`prelude`].

pub use dmreg_core as model;
pub use dmreg_exec as exec;
pub use dmreg_query as query;
pub use dmreg_reloc as reloc;

pub use dmreg_exec::{Engine, ExecError, Peer, Registry};

pub mod prelude {
    pub use dmreg_core::prelude::*;
    pub use dmreg_exec::{Engine, ExecError, MetricsSnapshot, Peer, Registry};
    pub use dmreg_query::{
        CmpOp, CompletionFn, EventMask, Operator, Predicate, Query, StreamOp,
    };
    pub use dmreg_reloc::{Channel, MemoryChannel};
}
