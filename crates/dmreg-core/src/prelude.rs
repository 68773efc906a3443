//! Convenient re-exports for downstream crates.

pub use crate::config::{ConfigOverrides, RegistryConfig};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::id::{NodeId, QueryId};
pub use crate::provider::{EventProvider, ObjectProvider, SourceProvider};
pub use crate::schema::{
    check_syntax, delete_subtree, merge, resolve_type, Binding, DataType, Node, NodeKind, Payload,
    Primitive, ResolvedType, SchemaTree, TypeRef, ValueBase,
};
pub use crate::tuple::{Item, Tuple, TupleFlags, Value};
