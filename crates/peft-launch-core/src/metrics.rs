//! Atomic counters for one launch.
//!
//! Counters are incremented silently at the call site. Call
//! [`LaunchMetrics::flush`] to emit current values as a single
//! `tracing::info!` event (the orchestrator does so at exit).

use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight atomic counters owned by a [`crate::RuntimeContext`].
#[derive(Debug, Default)]
pub struct LaunchMetrics {
    checkpoint_restores: AtomicU64,
    fresh_builds: AtomicU64,
    adapters_attached: AtomicU64,
    teardown_unregistrations: AtomicU64,
}

impl LaunchMetrics {
    pub const fn new() -> Self {
        Self {
            checkpoint_restores: AtomicU64::new(0),
            fresh_builds: AtomicU64::new(0),
            adapters_attached: AtomicU64::new(0),
            teardown_unregistrations: AtomicU64::new(0),
        }
    }

    pub fn inc_checkpoint_restores(&self) {
        self.checkpoint_restores.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "checkpoint_restores", "counter incremented");
    }

    pub fn inc_fresh_builds(&self) {
        self.fresh_builds.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "fresh_builds", "counter incremented");
    }

    pub fn inc_adapters_attached(&self) {
        self.adapters_attached.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "adapters_attached", "counter incremented");
    }

    pub fn inc_teardown_unregistrations(&self) {
        self.teardown_unregistrations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "teardown_unregistrations", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            checkpoint_restores = self.checkpoint_restores(),
            fresh_builds = self.fresh_builds(),
            adapters_attached = self.adapters_attached(),
            teardown_unregistrations = self.teardown_unregistrations(),
        );
    }

    pub fn checkpoint_restores(&self) -> u64 {
        self.checkpoint_restores.load(Ordering::Relaxed)
    }

    pub fn fresh_builds(&self) -> u64 {
        self.fresh_builds.load(Ordering::Relaxed)
    }

    pub fn adapters_attached(&self) -> u64 {
        self.adapters_attached.load(Ordering::Relaxed)
    }

    pub fn teardown_unregistrations(&self) -> u64 {
        self.teardown_unregistrations.load(Ordering::Relaxed)
    }
}
