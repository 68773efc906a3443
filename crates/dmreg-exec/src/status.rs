//! Object status dumps.
//!
//! Registering a query that listens for object status asks the provider for
//! every live instance. Each dump runs on its own short-lived thread so the
//! registering caller never waits on the provider.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use dmreg_core::provider::ObjectProvider;
use dmreg_core::tuple::Value;
use dmreg_core::QueryId;

use crate::registry::Shared;
use crate::worker::FIRST_STEP;

pub(crate) struct StatusDump {
    pub(crate) query: QueryId,
    pub(crate) path: String,
    pub(crate) provider: Arc<dyn ObjectProvider>,
    pub(crate) selectors: Vec<Value>,
}

pub(crate) fn spawn_dump(shared: Arc<Shared>, dump: StatusDump) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("dmreg-status-{}", dump.query.get()))
        .spawn(move || {
            let tuples = dump.provider.status(&dump.path, &dump.selectors);
            debug!(query = %dump.query, path = %dump.path, count = tuples.len(), "object status dump");
            for t in tuples {
                shared.dispatch(dump.query, t, FIRST_STEP);
            }
        })
}
