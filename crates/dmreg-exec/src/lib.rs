#![forbid(unsafe_code)]
//! dmreg-exec: the registry and the threads around it.
//!
//! - `registry`: provider/query registration, event and object fan-out.
//! - `worker`: the single query executor thread.
//! - `timer`: per-query source polling.
//! - `status`: object status dumps.
//! - `comm`: the cross-boundary communication thread and its sender.
//! - `engine`: start-up and ordered shutdown of all of the above.

pub mod comm;
pub mod engine;
pub mod failpoints;
pub mod metrics;
pub mod registry;
mod status;
mod timer;
mod worker;

pub use comm::{CommLink, Peer};
pub use engine::{Engine, ExecError};
pub use metrics::MetricsSnapshot;
pub use registry::Registry;
