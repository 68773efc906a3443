#![forbid(unsafe_code)]
//! dmreg-core: the typed datamodel (schema tree) and the tuple records that
//! flow through registered queries.
//!
//! Nothing in here spawns threads or touches IO. The registry/executor live in
//! `dmreg-exec`, relocatable encodings in `dmreg-reloc`.

pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod prelude;
pub mod provider;
pub mod schema;
pub mod tuple;

pub use error::{Error, ErrorKind, Result};
pub use id::{NodeId, QueryId};

/// Crate version, stamped into relocatable block headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
