//! Global atomic counters for Gatekeep.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a CLI invocation).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    runs_created: AtomicU64,
    clearances_requested: AtomicU64,
    clearances_rejected: AtomicU64,
    jobs_executed: AtomicU64,
    jobs_failed: AtomicU64,
    publishes: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_created: AtomicU64::new(0),
            clearances_requested: AtomicU64::new(0),
            clearances_rejected: AtomicU64::new(0),
            jobs_executed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_created(&self) {
        self.runs_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_created", "counter incremented");
    }

    pub fn inc_clearances_requested(&self) {
        self.clearances_requested.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "clearances_requested", "counter incremented");
    }

    pub fn inc_clearances_rejected(&self) {
        self.clearances_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "clearances_rejected", "counter incremented");
    }

    pub fn inc_jobs_executed(&self) {
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_executed", "counter incremented");
    }

    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_failed", "counter incremented");
    }

    pub fn inc_publishes(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "publishes", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_created = self.runs_created(),
            clearances_requested = self.clearances_requested(),
            clearances_rejected = self.clearances_rejected(),
            jobs_executed = self.jobs_executed(),
            jobs_failed = self.jobs_failed(),
            publishes = self.publishes(),
        );
    }

    pub fn runs_created(&self) -> u64 {
        self.runs_created.load(Ordering::Relaxed)
    }

    pub fn clearances_requested(&self) -> u64 {
        self.clearances_requested.load(Ordering::Relaxed)
    }

    pub fn clearances_rejected(&self) -> u64 {
        self.clearances_rejected.load(Ordering::Relaxed)
    }

    pub fn jobs_executed(&self) -> u64 {
        self.jobs_executed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn publishes(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.runs_created.store(0, Ordering::Relaxed);
        self.clearances_requested.store(0, Ordering::Relaxed);
        self.clearances_rejected.store(0, Ordering::Relaxed);
        self.jobs_executed.store(0, Ordering::Relaxed);
        self.jobs_failed.store(0, Ordering::Relaxed);
        self.publishes.store(0, Ordering::Relaxed);
    }
}
