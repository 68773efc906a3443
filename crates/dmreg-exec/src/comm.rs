//! The cross-boundary communication thread and its outbound counterpart.
//!
//! The thread polls a [`Channel`] for frames, rebases each payload from the
//! sender's base to the local `block_base` and applies it to the registry.
//! A message that fails to decode or apply is logged and dropped; the
//! thread keeps running until it is stopped or the peer hangs up.
//!
//! Queries arriving in `QueryAdd` get fresh local ids. The mapping from the
//! sender's ids is kept here so later `QueryDelete`/`QueryContinue` messages
//! can refer to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use dmreg_core::error::{Error, ErrorKind, Result};
use dmreg_core::schema::SchemaTree;
use dmreg_core::tuple::Tuple;
use dmreg_core::QueryId;
use dmreg_query::{CompletionFn, Query};
use dmreg_reloc::query_block::{
    decode_continue, decode_queries, decode_query_ids, encode_continue, encode_queries,
    encode_query_ids,
};
use dmreg_reloc::schema_block::{pack_adjacent_at, rebase, unpack};
use dmreg_reloc::tuple_block::{pack_chain, rebase_chain, unpack_chain};
use dmreg_reloc::{Channel, Frame, MessageKind};

use crate::fail_point;
use crate::registry::Registry;

/// Handle to a running communication thread.
pub struct CommLink {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    peer_snapshot: Arc<Mutex<Option<SchemaTree>>>,
}

impl CommLink {
    pub(crate) fn spawn(
        registry: Arc<Registry>,
        channel: Arc<dyn Channel>,
        on_transferred: CompletionFn,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let peer_snapshot = Arc::new(Mutex::new(None));
        let poll = Duration::from_millis(registry.config().comm_poll_interval_ms.max(1));
        let mut inbound = Inbound {
            registry,
            channel,
            on_transferred,
            remote_ids: HashMap::new(),
            peer_snapshot: Arc::clone(&peer_snapshot),
        };
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("dmreg-comm".into())
            .spawn(move || inbound.run(&stop_flag, poll))?;
        Ok(Self {
            stop,
            handle: Some(handle),
            peer_snapshot,
        })
    }

    /// Most recent tree the peer sent in answer to a snapshot request.
    pub fn peer_snapshot(&self) -> Option<SchemaTree> {
        self.peer_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop polling and join the thread. It exits within one poll interval.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("communication thread panicked");
            }
        }
    }
}

impl Drop for CommLink {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Inbound {
    registry: Arc<Registry>,
    channel: Arc<dyn Channel>,
    on_transferred: CompletionFn,
    remote_ids: HashMap<QueryId, QueryId>,
    peer_snapshot: Arc<Mutex<Option<SchemaTree>>>,
}

impl Inbound {
    fn run(&mut self, stop: &AtomicBool, poll: Duration) {
        debug!("communication thread started");
        while !stop.load(Ordering::Acquire) {
            match self.channel.recv_timeout(poll) {
                Ok(Some(bytes)) => {
                    fail_point!("panic_comm_message");
                    let ok = match self.handle(&bytes) {
                        Ok(kind) => {
                            trace!(?kind, "applied inbound message");
                            true
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping inbound message");
                            false
                        }
                    };
                    self.registry.record_message(ok);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "channel closed, communication thread exiting");
                    break;
                }
            }
        }
    }

    fn handle(&mut self, bytes: &[u8]) -> Result<MessageKind> {
        let frame = Frame::decode(bytes, self.registry.config().max_block_bytes)?;
        let local_base = self.registry.config().block_base;
        let kind = frame.kind;
        let mut payload = frame.payload;
        match kind {
            MessageKind::SchemaAdd => {
                let tree = relocate_schema(&mut payload, frame.base, local_base)?;
                self.registry.register_provider(Some(&tree), Vec::new())?;
            }
            MessageKind::SchemaDelete => {
                let tree = relocate_schema(&mut payload, frame.base, local_base)?;
                self.registry.unregister_provider(Some(&tree), &[])?;
            }
            MessageKind::SchemaSnapshot if payload.is_empty() => {
                let snapshot = self.registry.snapshot();
                Peer::new(Arc::clone(&self.channel), local_base).send_snapshot(&snapshot)?;
            }
            MessageKind::SchemaSnapshot => {
                let tree = relocate_schema(&mut payload, frame.base, local_base)?;
                debug!(nodes = tree.len(), "received peer snapshot");
                *self.peer_snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(tree);
            }
            MessageKind::QueryAdd => {
                let records = decode_queries(&payload)?;
                let remote: Vec<QueryId> = records.iter().map(|r| r.id).collect();
                let queries = records
                    .into_iter()
                    .map(|r| r.into_query(Arc::clone(&self.on_transferred)))
                    .collect();
                let local = self.registry.register_query(queries)?;
                self.remote_ids.extend(remote.into_iter().zip(local));
            }
            MessageKind::QueryDelete => {
                let remote = decode_query_ids(&payload)?;
                let local = remote
                    .iter()
                    .map(|id| {
                        self.remote_ids
                            .get(id)
                            .copied()
                            .ok_or_else(|| Error::at(ErrorKind::QueryNotFound, id.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.registry.unregister_query(&local)?;
                for id in remote {
                    self.remote_ids.remove(&id);
                }
            }
            MessageKind::QueryContinue => {
                let (remote, step, chain) = decode_continue(&payload)?;
                // queries registered on this side continue under their own id
                let query = self.remote_ids.get(&remote).copied().unwrap_or(remote);
                let mut chain = chain.to_vec();
                let tuples = self.registry.read_tree(|tree| -> Result<Vec<Tuple>> {
                    rebase_chain(tree, &mut chain, frame.base, local_base)?;
                    unpack_chain(tree, &chain, local_base)
                })?;
                debug!(%query, step, tuples = tuples.len(), "continuing query");
                self.registry.continue_query(query, step as usize, tuples)?;
            }
        }
        Ok(kind)
    }
}

fn relocate_schema(payload: &mut [u8], from: u64, to: u64) -> Result<SchemaTree> {
    rebase(payload, from, to)?;
    unpack(payload, to)
}

/// Sending side of a channel. Blocks are laid out at `base`.
pub struct Peer {
    channel: Arc<dyn Channel>,
    base: u64,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("base", &self.base).finish_non_exhaustive()
    }
}

impl Peer {
    pub fn new(channel: Arc<dyn Channel>, base: u64) -> Self {
        Self { channel, base }
    }

    /// Ask the peer for its whole tree; the answer shows up in
    /// [`CommLink::peer_snapshot`].
    pub fn request_snapshot(&self) -> Result<()> {
        self.send(MessageKind::SchemaSnapshot, Vec::new())
    }

    pub fn send_schema(&self, tree: &SchemaTree) -> Result<()> {
        self.send_tree(MessageKind::SchemaAdd, tree)
    }

    pub fn send_schema_delete(&self, tree: &SchemaTree) -> Result<()> {
        self.send_tree(MessageKind::SchemaDelete, tree)
    }

    fn send_snapshot(&self, tree: &SchemaTree) -> Result<()> {
        self.send_tree(MessageKind::SchemaSnapshot, tree)
    }

    /// Queries keep their local ids on the wire; the peer answers nothing
    /// but remembers them for later deletes and continues.
    pub fn send_queries(&self, queries: &[Query]) -> Result<()> {
        self.send(MessageKind::QueryAdd, encode_queries(queries))
    }

    pub fn send_query_delete(&self, ids: &[QueryId]) -> Result<()> {
        self.send(MessageKind::QueryDelete, encode_query_ids(ids))
    }

    /// Hand `tuples` to the peer's copy of `query`, to resume at `step`.
    pub fn send_continue(
        &self,
        tree: &SchemaTree,
        query: QueryId,
        step: u32,
        tuples: &[Tuple],
    ) -> Result<()> {
        let chain = pack_chain(tree, tuples, self.base)?;
        self.send(MessageKind::QueryContinue, encode_continue(query, step, &chain))
    }

    fn send_tree(&self, kind: MessageKind, tree: &SchemaTree) -> Result<()> {
        let root = tree.root().ok_or(ErrorKind::NullArgument)?;
        let block = pack_adjacent_at(tree, root, self.base)?;
        self.send(kind, block)
    }

    fn send(&self, kind: MessageKind, payload: Vec<u8>) -> Result<()> {
        trace!(?kind, bytes = payload.len(), "sending frame");
        self.channel.send_frame(&Frame::new(kind, self.base, payload))
    }
}
