//! Registry counters and tracing hooks.
//!
//! Plain atomics; wire them to a real telemetry stack in the binary layer.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct RegistryMetrics {
    tuples_produced: AtomicU64,
    fanout_copies: AtomicU64,
    jobs_executed: AtomicU64,
    completed: AtomicU64,
    discarded: AtomicU64,
    missed_ticks: AtomicU64,
    messages_handled: AtomicU64,
    messages_failed: AtomicU64,
}

/// Point-in-time copy of [`RegistryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tuples_produced: u64,
    /// Extra copies made because more than one query matched.
    pub fanout_copies: u64,
    pub jobs_executed: u64,
    pub completed: u64,
    pub discarded: u64,
    /// Source ticks skipped because the schema lock was held.
    pub missed_ticks: u64,
    pub messages_handled: u64,
    pub messages_failed: u64,
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tuple_produced(&self) {
        self.tuples_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fanout_copy(&self) {
        self.fanout_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self, completed: bool) {
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
        if completed {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn missed_tick(&self) {
        self.missed_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message(&self, ok: bool) {
        if ok {
            self.messages_handled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tuples_produced: self.tuples_produced.load(Ordering::Relaxed),
            fanout_copies: self.fanout_copies.load(Ordering::Relaxed),
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            missed_ticks: self.missed_ticks.load(Ordering::Relaxed),
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    pub fn key_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("tuples_produced", self.tuples_produced.to_string()),
            ("fanout_copies", self.fanout_copies.to_string()),
            ("jobs_executed", self.jobs_executed.to_string()),
            ("completed", self.completed.to_string()),
            ("discarded", self.discarded.to_string()),
            ("missed_ticks", self.missed_ticks.to_string()),
            ("messages_handled", self.messages_handled.to_string()),
            ("messages_failed", self.messages_failed.to_string()),
        ]
    }
}

pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::TRACE, "dmreg", event);
    let _enter = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = RegistryMetrics::new();
        m.tuple_produced();
        m.job_finished(true);
        m.job_finished(false);
        m.missed_tick();
        let s = m.snapshot();
        assert_eq!(s.tuples_produced, 1);
        assert_eq!(s.jobs_executed, 2);
        assert_eq!((s.completed, s.discarded), (1, 1));
        assert_eq!(s.missed_ticks, 1);
        assert_eq!(s.key_values().len(), 8);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"missed_ticks\":1"));
    }
}
