//! The query executor thread.
//!
//! Producers push jobs into an unbounded FIFO; the executor blocks until work
//! arrives, then drains up to `executor_batch_limit` jobs before blocking
//! again. The schema lock is taken in read mode around each job, never
//! across a batch, so registration is not starved under heavy tuple load.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace};

use dmreg_core::tuple::Tuple;
use dmreg_core::QueryId;
use dmreg_query::run_chain;

use crate::fail_point;
use crate::registry::Shared;

/// Step at which tuples produced by a stream enter the chain: the root
/// stream operator already ran by producing them.
pub(crate) const FIRST_STEP: usize = 1;

pub(crate) struct Job {
    pub(crate) query: QueryId,
    pub(crate) tuple: Tuple,
    pub(crate) step: usize,
}

pub(crate) enum Work {
    Run(Job),
    /// Acknowledged once everything queued before it has run.
    Flush(Sender<()>),
    Stop,
}

pub(crate) fn spawn_executor(
    shared: Arc<Shared>,
    rx: Receiver<Work>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("dmreg-executor".into())
        .spawn(move || executor_loop(&shared, &rx))
}

fn executor_loop(shared: &Shared, rx: &Receiver<Work>) {
    let limit = shared.cfg.executor_batch_limit.max(1);
    while let Ok(first) = rx.recv() {
        let mut next = Some(first);
        let mut drained = 0usize;
        while let Some(work) = next.take() {
            match work {
                Work::Run(job) => run_job(shared, job),
                Work::Flush(ack) => {
                    let _ = ack.send(());
                }
                Work::Stop => {
                    debug!("executor stopping");
                    return;
                }
            }
            drained += 1;
            if drained >= limit {
                trace!(drained, "executor batch limit reached");
                break;
            }
            next = rx.try_recv().ok();
        }
    }
}

fn run_job(shared: &Shared, job: Job) {
    fail_point!("panic_executor_job");
    let Job { query, tuple, step } = job;
    let finished = {
        let state = shared.read();
        let Some(q) = state.queries.get(&query) else {
            trace!(%query, "query gone before its job ran; dropping tuple");
            shared.metrics.job_finished(false);
            return;
        };
        run_chain(&state.tree, q, tuple, step).map(|t| (t, Arc::clone(q.on_completed())))
    };
    // callback runs outside the schema lock so it may call back into the registry
    match finished {
        Some((tuple, on_completed)) => {
            on_completed(query, tuple);
            shared.metrics.job_finished(true);
        }
        None => shared.metrics.job_finished(false),
    }
}
