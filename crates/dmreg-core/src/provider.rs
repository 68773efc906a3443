//! Callback interfaces implemented by data providers.
//!
//! The registry calls into these; it never implements them. Every method gets
//! the dotted schema path of the node it was registered on, so one provider
//! object may back several nodes.

use crate::tuple::{Tuple, Value};

/// A periodically polled source.
pub trait SourceProvider: Send + Sync {
    /// Produce the current reading. `None` skips this tick.
    fn poll(&self, path: &str, selectors: &[Value]) -> Option<Tuple>;
}

/// An event emitter. Events are pushed through `Registry::produce_event`;
/// the lifecycle hooks tell the provider whether anyone is listening.
pub trait EventProvider: Send + Sync {
    /// Called when the first query is attached to the event.
    fn activate(&self, _path: &str) {}

    /// Called when the last query is removed from the event.
    fn deactivate(&self, _path: &str) {}
}

/// A stateful object whose instances are created, deleted and dumped.
pub trait ObjectProvider: Send + Sync {
    fn activate(&self, _path: &str) {}

    fn deactivate(&self, _path: &str) {}

    /// Snapshot of every live instance matching `selectors` (one tuple each).
    fn status(&self, path: &str, selectors: &[Value]) -> Vec<Tuple>;
}
