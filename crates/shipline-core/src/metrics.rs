//! Process-wide deployment counters.
//!
//! Incremented at the call site; [`Metrics::flush`] emits the current values as
//! one `info!` event at the end of each run.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    attempts_recorded: AtomicU64,
    retries_scheduled: AtomicU64,
    rollbacks_executed: AtomicU64,
    runs_finished: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            attempts_recorded: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            rollbacks_executed: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
        }
    }

    pub fn inc_attempts(&self) {
        self.attempts_recorded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "attempts_recorded", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries_scheduled", "counter incremented");
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rollbacks_executed", "counter incremented");
    }

    pub fn inc_runs_finished(&self) {
        self.runs_finished.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_finished", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            attempts_recorded = self.attempts_recorded(),
            retries_scheduled = self.retries_scheduled(),
            rollbacks_executed = self.rollbacks_executed(),
            runs_finished = self.runs_finished(),
        );
    }

    pub fn attempts_recorded(&self) -> u64 {
        self.attempts_recorded.load(Ordering::Relaxed)
    }

    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled.load(Ordering::Relaxed)
    }

    pub fn rollbacks_executed(&self) -> u64 {
        self.rollbacks_executed.load(Ordering::Relaxed)
    }

    pub fn runs_finished(&self) -> u64 {
        self.runs_finished.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.attempts_recorded.store(0, Ordering::Relaxed);
        self.retries_scheduled.store(0, Ordering::Relaxed);
        self.rollbacks_executed.store(0, Ordering::Relaxed);
        self.runs_finished.store(0, Ordering::Relaxed);
    }
}
