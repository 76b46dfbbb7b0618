//! Process-wide execution counters.
//!
//! Incremented at the call site; [`Metrics::flush`] emits all values as one
//! `info!` event, e.g. when an evaluation finishes or the worker shuts down.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    agents_executed: AtomicU64,
    agents_failed: AtomicU64,
    degraded_completions: AtomicU64,
    breaker_trips: AtomicU64,
    jobs_dispatched: AtomicU64,
    persistence_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            agents_executed: AtomicU64::new(0),
            agents_failed: AtomicU64::new(0),
            degraded_completions: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
            jobs_dispatched: AtomicU64::new(0),
            persistence_errors: AtomicU64::new(0),
        }
    }

    pub fn inc_agents_executed(&self) {
        self.agents_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agents_executed", "counter incremented");
    }

    pub fn inc_agents_failed(&self) {
        self.agents_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agents_failed", "counter incremented");
    }

    /// Output served by a tier other than the first.
    pub fn inc_degraded(&self) {
        self.degraded_completions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "degraded_completions", "counter incremented");
    }

    pub fn inc_breaker_trips(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "breaker_trips", "counter incremented");
    }

    pub fn inc_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_dispatched", "counter incremented");
    }

    pub fn inc_persistence_errors(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "persistence_errors", "counter incremented");
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            agents_executed = self.agents_executed(),
            agents_failed = self.agents_failed(),
            degraded_completions = self.degraded_completions(),
            breaker_trips = self.breaker_trips(),
            jobs_dispatched = self.jobs_dispatched(),
            persistence_errors = self.persistence_errors(),
        );
    }

    pub fn agents_executed(&self) -> u64 {
        self.agents_executed.load(Ordering::Relaxed)
    }

    pub fn agents_failed(&self) -> u64 {
        self.agents_failed.load(Ordering::Relaxed)
    }

    pub fn degraded_completions(&self) -> u64 {
        self.degraded_completions.load(Ordering::Relaxed)
    }

    pub fn breaker_trips(&self) -> u64 {
        self.breaker_trips.load(Ordering::Relaxed)
    }

    pub fn jobs_dispatched(&self) -> u64 {
        self.jobs_dispatched.load(Ordering::Relaxed)
    }

    pub fn persistence_errors(&self) -> u64 {
        self.persistence_errors.load(Ordering::Relaxed)
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        self.agents_executed.store(0, Ordering::Relaxed);
        self.agents_failed.store(0, Ordering::Relaxed);
        self.degraded_completions.store(0, Ordering::Relaxed);
        self.breaker_trips.store(0, Ordering::Relaxed);
        self.jobs_dispatched.store(0, Ordering::Relaxed);
        self.persistence_errors.store(0, Ordering::Relaxed);
    }
}
