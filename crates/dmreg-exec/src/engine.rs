//! Engine: owns the registry and the threads that serve it.
//!
//! Start-up spawns the executor. A channel to a peer registry can be
//! attached afterwards, which spawns the communication thread. Shutdown
//! runs in dependency order: source timers, status dumps, communication,
//! then the executor after it drained every queued job.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{debug, warn};

use dmreg_core::config::RegistryConfig;
use dmreg_core::schema::SchemaTree;
use dmreg_query::CompletionFn;
use dmreg_reloc::Channel;

use crate::comm::{CommLink, Peer};
use crate::metrics::{emit_span, MetricsSnapshot};
use crate::registry::Registry;
use crate::worker::{spawn_executor, Work};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("registry: {0}")]
    Registry(#[from] dmreg_core::Error),
    #[error("thread spawn: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("a channel is already attached")]
    ChannelAttached,
    #[error("executor is not running")]
    Stopped,
}

pub struct Engine {
    registry: Arc<Registry>,
    jobs: Sender<Work>,
    executor: Option<JoinHandle<()>>,
    comm: Option<CommLink>,
}

impl Engine {
    pub fn new(cfg: RegistryConfig) -> Result<Self, ExecError> {
        cfg.validate()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let registry = Arc::new(Registry::new(cfg, tx.clone()));
        let executor = spawn_executor(registry.shared(), rx)?;
        debug!("engine started");
        Ok(Self {
            registry,
            jobs: tx,
            executor: Some(executor),
            comm: None,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Start applying messages from `channel`. Queries the peer transfers
    /// complete through `on_transferred`.
    pub fn attach_channel(
        &mut self,
        channel: Arc<dyn Channel>,
        on_transferred: CompletionFn,
    ) -> Result<Peer, ExecError> {
        if self.comm.is_some() {
            return Err(ExecError::ChannelAttached);
        }
        let base = self.registry.config().block_base;
        let link = CommLink::spawn(Arc::clone(&self.registry), Arc::clone(&channel), on_transferred)?;
        self.comm = Some(link);
        Ok(Peer::new(channel, base))
    }

    /// Latest tree received from the peer, if any.
    pub fn peer_snapshot(&self) -> Option<SchemaTree> {
        self.comm.as_ref().and_then(CommLink::peer_snapshot)
    }

    /// Block until every job queued before this call has run.
    pub fn flush(&self) -> Result<(), ExecError> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.jobs
            .send(Work::Flush(ack_tx))
            .map_err(|_| ExecError::Stopped)?;
        ack_rx.recv().map_err(|_| ExecError::Stopped)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.registry.metrics()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(executor) = self.executor.take() else {
            return;
        };
        self.registry.stop_timers();
        self.registry.join_status_workers();
        if let Some(mut comm) = self.comm.take() {
            comm.stop();
        }
        // Stop queues behind everything already submitted
        if self.jobs.send(Work::Stop).is_ok() && executor.join().is_err() {
            warn!("executor thread panicked");
        }
        emit_span("shutdown", &self.registry.metrics().key_values());
        debug!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
