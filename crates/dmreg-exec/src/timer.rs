//! Periodic polling of source nodes, one thread per source query.
//!
//! A tick never blocks on the schema lock: if a writer holds it the tick is
//! counted as missed and skipped. Ticks against the same source path are
//! serialized by a per-source gate. Cancelling a timer joins its thread, so
//! no tick can be in flight once `cancel` returns.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use dmreg_core::provider::SourceProvider;
use dmreg_core::tuple::Value;
use dmreg_core::QueryId;

use crate::fail_point;
use crate::registry::Shared;
use crate::worker::FIRST_STEP;

pub(crate) struct SourceTimer {
    query: QueryId,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct SourcePoll {
    pub(crate) query: QueryId,
    pub(crate) path: String,
    pub(crate) provider: Arc<dyn SourceProvider>,
    pub(crate) selectors: Vec<Value>,
    pub(crate) gate: Arc<Mutex<()>>,
}

impl SourceTimer {
    pub(crate) fn start(
        shared: Arc<Shared>,
        poll: SourcePoll,
        period: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let query = poll.query;
        let handle = thread::Builder::new()
            .name(format!("dmreg-timer-{}", query.get()))
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => tick(&shared, &poll),
                    // explicit stop or the timer handle was dropped
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        debug!(%query, period_ms = period.as_millis() as u64, "source timer armed");
        Ok(Self {
            query,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Disarm and wait for an in-flight tick to finish.
    pub(crate) fn cancel(mut self) {
        self.disarm();
    }

    fn disarm(&mut self) {
        self.stop.take();
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!(query = %self.query, "source timer thread panicked");
            }
            trace!(query = %self.query, "source timer joined");
        }
    }
}

impl Drop for SourceTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn tick(shared: &Shared, poll: &SourcePoll) {
    let Some(state) = shared.try_read() else {
        shared.metrics.missed_tick();
        debug!(query = %poll.query, path = %poll.path, "schema lock busy, missed timer tick");
        return;
    };
    if !state.queries.contains_key(&poll.query) {
        return;
    }
    let tuple = {
        let _serial = poll.gate.lock().unwrap_or_else(PoisonError::into_inner);
        fail_point!("delay_source_poll");
        poll.provider.poll(&poll.path, &poll.selectors)
    };
    drop(state);
    match tuple {
        Some(t) => shared.dispatch(poll.query, t, FIRST_STEP),
        None => trace!(query = %poll.query, "source produced nothing this tick"),
    }
}
