//! The registry: one schema tree, the queries attached to it, and the entry
//! points providers call.
//!
//! All state sits behind a single reader/writer lock. Registration and
//! deletion take it in write mode for their whole duration and stage their
//! changes on a copy of the tree, which replaces the live one only once
//! every step succeeded; a failed call leaves nothing behind. Fan-out and
//! query execution only read the tree and take the lock in read mode.
//!
//! Provider callbacks (`activate`, `deactivate`, timers, status dumps) are
//! collected while the lock is held and run after it is released, in the
//! order the changes were committed. A provider must not register or
//! unregister from inside `activate` or `deactivate`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

use dmreg_core::config::RegistryConfig;
use dmreg_core::error::{Error, ErrorKind, Result};
use dmreg_core::hash::namespace_tag;
use dmreg_core::provider::{EventProvider, ObjectProvider};
use dmreg_core::schema::{check_syntax, delete_subtree, merge, NodeKind, Payload, SchemaTree};
use dmreg_core::tuple::Tuple;
use dmreg_core::QueryId;
use dmreg_query::{check_query_syntax, EventMask, Query};

use crate::metrics::{MetricsSnapshot, RegistryMetrics};
use crate::status::{spawn_dump, StatusDump};
use crate::timer::{SourcePoll, SourceTimer};
use crate::worker::{Job, Work, FIRST_STEP};

pub(crate) struct State {
    pub(crate) tree: SchemaTree,
    pub(crate) queries: HashMap<QueryId, Query>,
}

/// The part of the registry the worker threads hold on to.
pub(crate) struct Shared {
    pub(crate) cfg: RegistryConfig,
    state: RwLock<State>,
    jobs: Sender<Work>,
    pub(crate) metrics: RegistryMetrics,
}

impl Shared {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read access without waiting; `None` while a writer holds the lock.
    pub(crate) fn try_read(&self) -> Option<RwLockReadGuard<'_, State>> {
        match self.state.try_read() {
            Ok(g) => Some(g),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
        }
    }

    /// Queue one tuple for one query.
    pub(crate) fn dispatch(&self, query: QueryId, tuple: Tuple, step: usize) {
        self.metrics.tuple_produced();
        self.enqueue(Job { query, tuple, step });
    }

    /// Queue `tuple` for every query in `targets`. Each target gets its own
    /// copy; the last one takes the original.
    fn fan_out(&self, targets: &[QueryId], tuple: Tuple) -> usize {
        self.metrics.tuple_produced();
        let Some((last, rest)) = targets.split_last() else {
            trace!("no query listening, dropping tuple");
            return 0;
        };
        for q in rest {
            self.metrics.fanout_copy();
            self.enqueue(Job {
                query: *q,
                tuple: tuple.clone(),
                step: FIRST_STEP,
            });
        }
        self.enqueue(Job {
            query: *last,
            tuple,
            step: FIRST_STEP,
        });
        targets.len()
    }

    fn enqueue(&self, job: Job) {
        let query = job.query;
        if self.jobs.send(Work::Run(job)).is_err() {
            debug!(%query, "executor stopped, dropping tuple");
        }
    }
}

/// Lifecycle hooks of the provider behind an event or object node.
#[derive(Clone)]
enum Lifecycle {
    Event(Arc<dyn EventProvider>),
    Object(Arc<dyn ObjectProvider>),
}

impl Lifecycle {
    fn of(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::Event { provider, .. } => provider.local().cloned().map(Lifecycle::Event),
            Payload::Object { provider, .. } => provider.local().cloned().map(Lifecycle::Object),
            _ => None,
        }
    }

    fn activate(&self, path: &str) {
        match self {
            Lifecycle::Event(p) => p.activate(path),
            Lifecycle::Object(p) => p.activate(path),
        }
    }

    fn deactivate(&self, path: &str) {
        match self {
            Lifecycle::Event(p) => p.deactivate(path),
            Lifecycle::Object(p) => p.deactivate(path),
        }
    }
}

/// Deferred provider-facing work, run once the lock is released.
enum Effect {
    Activate(Lifecycle, String),
    Deactivate(Lifecycle, String),
    StartTimer(SourcePoll, u64),
    StopTimer(QueryId),
    Status(StatusDump),
}

/// Turns for running effects. Tickets are drawn under the write lock, so
/// effects run in commit order even though they run unlocked.
#[derive(Default)]
struct EffectOrder {
    next: AtomicU64,
    serving: Mutex<u64>,
    turn: Condvar,
}

impl EffectOrder {
    /// Only call with the state lock held in write mode.
    fn ticket(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn wait_turn(&self, ticket: u64) -> Turn<'_> {
        let mut serving = self.serving.lock().unwrap_or_else(PoisonError::into_inner);
        while *serving != ticket {
            serving = self.turn.wait(serving).unwrap_or_else(PoisonError::into_inner);
        }
        Turn { order: self }
    }
}

/// Hands the turn to the next ticket when dropped, unwinding included.
struct Turn<'a> {
    order: &'a EffectOrder,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut serving = self.order.serving.lock().unwrap_or_else(PoisonError::into_inner);
        *serving += 1;
        self.order.turn.notify_all();
    }
}

pub struct Registry {
    shared: Arc<Shared>,
    next_seq: AtomicU32,
    timers: Mutex<HashMap<QueryId, SourceTimer>>,
    source_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    status_workers: Mutex<Vec<JoinHandle<()>>>,
    effect_order: EffectOrder,
}

impl Registry {
    pub(crate) fn new(cfg: RegistryConfig, jobs: Sender<Work>) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                state: RwLock::new(State {
                    tree: SchemaTree::new(),
                    queries: HashMap::new(),
                }),
                jobs,
                metrics: RegistryMetrics::new(),
            }),
            next_seq: AtomicU32::new(1),
            timers: Mutex::new(HashMap::new()),
            source_gates: Mutex::new(HashMap::new()),
            status_workers: Mutex::new(Vec::new()),
            effect_order: EffectOrder::default(),
        }
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.cfg
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub(crate) fn record_message(&self, ok: bool) {
        self.shared.metrics.message(ok);
    }

    /// Merge `schema` into the tree and attach `queries`. Either may be
    /// empty. Returns the ids assigned to the queries, in order.
    pub fn register_provider(
        &self,
        schema: Option<&SchemaTree>,
        queries: Vec<Query>,
    ) -> Result<Vec<QueryId>> {
        let mut effects = Vec::new();
        let (ids, ticket) = {
            let mut state = self.shared.write();
            let mut staged = state.tree.clone();
            if staged.root().is_none() {
                staged.reinit();
            }
            if let Some(schema) = schema {
                check_syntax(Some(&staged), schema)?;
                merge(true, &mut staged, schema)?;
                merge(false, &mut staged, schema)?;
                debug!(nodes = schema.len(), "provider schema merged");
            }
            let accepted = self.stage_queries(&mut staged, queries, &mut effects)?;
            let ids: Vec<QueryId> = accepted.iter().map(|q| q.id).collect();
            state.tree = staged;
            state.queries.extend(accepted.into_iter().map(|q| (q.id, q)));
            (ids, self.effect_order.ticket())
        };
        self.apply(ticket, effects);
        Ok(ids)
    }

    /// Attach queries without touching the schema.
    pub fn register_query(&self, queries: Vec<Query>) -> Result<Vec<QueryId>> {
        self.register_provider(None, queries)
    }

    /// Detach `queries`, then delete the nodes named by `schema`. Queries go
    /// first so the nodes they reference still exist while detaching. Any
    /// other query left attached to a deleted node is dropped with it.
    pub fn unregister_provider(&self, schema: Option<&SchemaTree>, queries: &[QueryId]) -> Result<()> {
        let mut effects = Vec::new();
        let (removed, ticket) = {
            let mut state = self.shared.write();
            check_known(&state, queries)?;
            let mut staged = state.tree.clone();
            for id in queries {
                if let Some(q) = state.queries.get(id) {
                    detach(&mut staged, q, &mut effects);
                }
            }

            let mut gone: HashSet<QueryId> = queries.iter().copied().collect();
            if let Some(schema) = schema {
                delete_subtree(&mut staged, schema)?;
                if staged.root().is_none() {
                    debug!("registry emptied, reinitializing root");
                    staged.reinit();
                }
                for (id, q) in &state.queries {
                    let attached = q.stream().and_then(|s| staged.resolve(&s.path)).is_some();
                    if !gone.contains(id) && !attached {
                        warn!(query = %id, name = %q.name, "query lost its stream node, dropping it");
                        effects.push(Effect::StopTimer(*id));
                        gone.insert(*id);
                    }
                }
            }

            state.tree = staged;
            let removed = gone
                .iter()
                .filter_map(|id| state.queries.remove(id))
                .collect::<Vec<_>>();
            (removed, self.effect_order.ticket())
        };
        debug!(queries = removed.len(), "provider unregistered");
        self.apply(ticket, effects);
        // queries (and their callbacks) are released outside the lock
        drop(removed);
        Ok(())
    }

    pub fn unregister_query(&self, queries: &[QueryId]) -> Result<()> {
        self.unregister_provider(None, queries)
    }

    /// Push an event tuple to every query on the event node at `path`.
    /// Returns how many queries received it.
    pub fn produce_event(&self, path: &str, tuple: Tuple) -> Result<usize> {
        let targets = {
            let state = self.shared.read();
            let id = state
                .tree
                .resolve(path)
                .ok_or_else(|| Error::at(ErrorKind::NotFound, path))?;
            let node = state.tree.node(id).ok_or(ErrorKind::NotFound)?;
            if node.kind != NodeKind::Event {
                return Err(Error::at(ErrorKind::WrongStreamType, path));
            }
            node.queries().to_vec()
        };
        trace!(path, targets = targets.len(), "event produced");
        Ok(self.shared.fan_out(&targets, tuple))
    }

    /// Push an object change to the queries on `path` whose event mask
    /// intersects `events`.
    pub fn produce_object_change(&self, path: &str, tuple: Tuple, events: EventMask) -> Result<usize> {
        let targets = {
            let state = self.shared.read();
            let id = state
                .tree
                .resolve(path)
                .ok_or_else(|| Error::at(ErrorKind::NotFound, path))?;
            let node = state.tree.node(id).ok_or(ErrorKind::NotFound)?;
            if node.kind != NodeKind::Object {
                return Err(Error::at(ErrorKind::WrongStreamType, path));
            }
            node.queries()
                .iter()
                .copied()
                .filter(|q| {
                    state
                        .queries
                        .get(q)
                        .and_then(Query::stream)
                        .map_or(false, |s| s.events.intersects(events))
                })
                .collect::<Vec<_>>()
        };
        trace!(path, targets = targets.len(), "object change produced");
        Ok(self.shared.fan_out(&targets, tuple))
    }

    /// Resume `query` at operator `step` for each tuple, e.g. after a peer
    /// ran the head of the chain.
    pub fn continue_query(&self, query: QueryId, step: usize, tuples: Vec<Tuple>) -> Result<()> {
        {
            let state = self.shared.read();
            let q = state
                .queries
                .get(&query)
                .ok_or_else(|| Error::at(ErrorKind::QueryNotFound, query.to_string()))?;
            if step > q.ops.len() {
                return Err(Error::at(ErrorKind::OutOfBounds, format!("step {step}")));
            }
        }
        for t in tuples {
            self.shared.dispatch(query, t, step);
        }
        Ok(())
    }

    /// Run `f` against the live tree under the read lock.
    pub fn read_tree<R>(&self, f: impl FnOnce(&SchemaTree) -> R) -> R {
        f(&self.shared.read().tree)
    }

    /// Copy of the current tree.
    pub fn snapshot(&self) -> SchemaTree {
        self.shared.read().tree.clone()
    }

    pub fn query_ids(&self) -> Vec<QueryId> {
        let mut ids: Vec<QueryId> = self.shared.read().queries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn query(&self, id: QueryId) -> Option<Query> {
        self.shared.read().queries.get(&id).cloned()
    }

    pub fn active_timers(&self) -> usize {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn next_id(&self, stream_path: &str) -> QueryId {
        let namespace = stream_path.split('.').next().unwrap_or_default();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        QueryId::compose(namespace_tag(namespace), seq)
    }

    /// Validate, number and attach `queries` to `staged`.
    fn stage_queries(
        &self,
        staged: &mut SchemaTree,
        queries: Vec<Query>,
        effects: &mut Vec<Effect>,
    ) -> Result<Vec<Query>> {
        let mut accepted = Vec::with_capacity(queries.len());
        for mut q in queries {
            check_query_syntax(staged, &q.ops).map_err(|e| {
                debug!(name = %q.name, error = %e, "query rejected");
                e
            })?;
            let stream = q.stream().cloned().ok_or(ErrorKind::WrongOrder)?;
            let node_id = staged
                .resolve(&stream.path)
                .ok_or_else(|| Error::at(ErrorKind::StreamNotFound, stream.path.clone()))?;
            q.id = self.next_id(&stream.path);
            let first = staged.node(node_id).map_or(true, |n| n.queries().is_empty());
            staged.attach_query(node_id, q.id, self.shared.cfg.max_queries_per_node)?;

            let node = staged.node(node_id).ok_or(ErrorKind::NotFound)?;
            if first {
                if let Some(l) = Lifecycle::of(&node.payload) {
                    effects.push(Effect::Activate(l, stream.path.clone()));
                }
            }
            match &node.payload {
                Payload::Source { provider, .. } => match provider.local() {
                    Some(p) => effects.push(Effect::StartTimer(
                        SourcePoll {
                            query: q.id,
                            path: stream.path.clone(),
                            provider: Arc::clone(p),
                            selectors: stream.selectors.clone(),
                            gate: self.gate(&stream.path),
                        },
                        stream.period_ms,
                    )),
                    None => trace!(path = %stream.path, "remote source, polled by its owner"),
                },
                Payload::Object { provider, .. } if stream.events.contains(EventMask::STATUS) => {
                    if let Some(p) = provider.local() {
                        effects.push(Effect::Status(StatusDump {
                            query: q.id,
                            path: stream.path.clone(),
                            provider: Arc::clone(p),
                            selectors: stream.selectors.clone(),
                        }));
                    }
                }
                _ => {}
            }
            debug!(query = %q.id, name = %q.name, path = %stream.path, "query attached");
            accepted.push(q);
        }
        Ok(accepted)
    }

    fn gate(&self, path: &str) -> Arc<Mutex<()>> {
        let mut gates = self.source_gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(path.to_string()).or_default())
    }

    /// Run `effects` once every earlier ticket has run its own.
    fn apply(&self, ticket: u64, effects: Vec<Effect>) {
        let _turn = self.effect_order.wait_turn(ticket);
        trace!(ticket, effects = effects.len(), "applying effects");
        for e in effects {
            match e {
                Effect::Activate(l, path) => {
                    debug!(%path, "activating provider");
                    l.activate(&path);
                }
                Effect::Deactivate(l, path) => {
                    debug!(%path, "deactivating provider");
                    l.deactivate(&path);
                }
                Effect::StartTimer(poll, period_ms) => {
                    let period =
                        Duration::from_millis(period_ms.max(self.shared.cfg.min_source_period_ms).max(1));
                    let query = poll.query;
                    match SourceTimer::start(self.shared(), poll, period) {
                        Ok(t) => {
                            self.timers
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(query, t);
                        }
                        Err(e) => warn!(%query, error = %e, "could not start source timer"),
                    }
                }
                Effect::StopTimer(query) => {
                    let timer = self
                        .timers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&query);
                    if let Some(t) = timer {
                        t.cancel();
                    }
                }
                Effect::Status(dump) => {
                    let query = dump.query;
                    match spawn_dump(self.shared(), dump) {
                        Ok(h) => {
                            let mut workers =
                                self.status_workers.lock().unwrap_or_else(PoisonError::into_inner);
                            workers.retain(|w| !w.is_finished());
                            workers.push(h);
                        }
                        Err(e) => warn!(%query, error = %e, "could not start status dump"),
                    }
                }
            }
        }
    }

    /// Cancel and join every source timer.
    pub(crate) fn stop_timers(&self) {
        let timers: Vec<SourceTimer> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, t)| t)
            .collect();
        debug!(count = timers.len(), "stopping source timers");
        for t in timers {
            t.cancel();
        }
    }

    pub(crate) fn join_status_workers(&self) {
        let workers: Vec<JoinHandle<()>> = self
            .status_workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for w in workers {
            if w.join().is_err() {
                warn!("status dump thread panicked");
            }
        }
    }
}

fn check_known(state: &State, queries: &[QueryId]) -> Result<()> {
    match queries.iter().find(|id| !state.queries.contains_key(id)) {
        Some(id) => Err(Error::at(ErrorKind::QueryNotFound, id.to_string())),
        None => Ok(()),
    }
}

/// Remove `q` from its stream node in `staged`.
fn detach(staged: &mut SchemaTree, q: &Query, effects: &mut Vec<Effect>) {
    effects.push(Effect::StopTimer(q.id));
    let Some(path) = q.stream().map(|s| s.path.as_str()) else {
        return;
    };
    let Some(node_id) = staged.resolve(path) else {
        return;
    };
    staged.detach_query(node_id, q.id);
    if let Some(node) = staged.node(node_id) {
        if node.queries().is_empty() {
            if let Some(l) = Lifecycle::of(&node.payload) {
                effects.push(Effect::Deactivate(l, path.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use dmreg_core::provider::SourceProvider;
    use dmreg_core::schema::{Binding, Node, Primitive, TypeRef};
    use dmreg_core::tuple::{Item, Value};
    use dmreg_query::{Operator, StreamOp};

    use super::*;

    #[derive(Default)]
    struct Uptime {
        polls: AtomicUsize,
    }

    impl SourceProvider for Uptime {
        fn poll(&self, path: &str, _selectors: &[Value]) -> Option<Tuple> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            Some(Tuple::from_items(
                n as u64,
                vec![Item {
                    name: path.to_string(),
                    value: Value::Int(n as i32),
                }],
            ))
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn ticks_under_a_writer_are_missed_instead_of_polled() {
        let (jobs, _queued) = crossbeam_channel::unbounded();
        let reg = Registry::new(RegistryConfig::default(), jobs);
        let uptime = Arc::new(Uptime::default());
        let provider: Arc<dyn SourceProvider> = uptime.clone();

        let mut schema = SchemaTree::new();
        let root = schema.root().unwrap();
        let sys = schema.add(root, Node::namespace("sys")).unwrap();
        schema
            .add(
                sys,
                Node::source(
                    "uptime",
                    TypeRef::primitive(Primitive::Int),
                    Binding::Local(provider),
                ),
            )
            .unwrap();
        let query = Query::new(
            "uptime",
            vec![Operator::Stream(StreamOp::source("sys.uptime", 5))],
            Arc::new(|_, _| {}),
        );
        reg.register_provider(Some(&schema), vec![query]).unwrap();
        assert!(wait_for(|| uptime.polls.load(Ordering::SeqCst) > 0));

        let held = {
            let _writer = reg.shared.write();
            let polls = uptime.polls.load(Ordering::SeqCst);
            let missed = reg.metrics().missed_ticks;
            std::thread::sleep(Duration::from_millis(60));
            assert_eq!(uptime.polls.load(Ordering::SeqCst), polls);
            assert!(reg.metrics().missed_ticks > missed);
            polls
        };

        assert!(wait_for(|| uptime.polls.load(Ordering::SeqCst) > held));
        reg.stop_timers();
    }
}
