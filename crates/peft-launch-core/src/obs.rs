//! Structured observability hooks for the launch lifecycle.
//!
//! This module provides:
//! - a launch-scoped tracing span, as a [`tracing::Span`] for async code and
//!   via the `LaunchSpan` RAII guard for synchronous code
//! - emission functions for key lifecycle events: state transitions, config
//!   resolution, model and trainer readiness, runtime tuning, finish
//!
//! Events are emitted at `info!` level; swallowed teardown errors at `warn!`.

use tracing::info;

use crate::identity::Rank;

/// Span tagged with the run id and rank. Attach it to futures with
/// `tracing::Instrument`.
pub fn launch_span(run_id: &str, rank: Rank) -> tracing::Span {
    tracing::info_span!("peft.launch", run_id = %run_id, rank = rank.0)
}

/// RAII guard that enters a launch-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = LaunchSpan::enter("run-12345", Rank(0));
/// // All tracing calls are now associated with run_id and rank.
/// ```
pub struct LaunchSpan {
    _span: tracing::span::EnteredSpan,
}

impl LaunchSpan {
    /// Create and enter a span tagged with the run id and rank.
    pub fn enter(run_id: &str, rank: Rank) -> Self {
        Self {
            _span: launch_span(run_id, rank).entered(),
        }
    }
}

/// Emit event: the orchestrator entered a new state.
pub fn emit_state(state: &str) {
    info!(event = "launch.state", state = %state);
}

/// Emit event: config resolved, tagged with its digest.
pub fn emit_config_resolved(digest: &str, echoed: bool) {
    info!(event = "launch.config_resolved", digest = %digest, echoed = echoed);
}

/// Emit event: model built and adapter attached.
pub fn emit_model_ready(source: &str, scheme: &str) {
    info!(event = "model.ready", source = %source, peft_scheme = %scheme);
}

/// Emit event: trainer assembled with observers and reporters.
pub fn emit_trainer_assembled(precision: &str, observers: usize, reporters: usize) {
    info!(
        event = "trainer.assembled",
        precision = %precision,
        observers = observers,
        reporters = reporters,
    );
}

/// Emit event: runtime tuning applied.
pub fn emit_runtime_tuned(stream: u64) {
    info!(event = "runtime.tuned", stream = stream);
}

/// Emit event: launch finished with duration and outcome.
pub fn emit_launch_finished(duration_ms: u64, success: bool) {
    info!(
        event = "launch.finished",
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: teardown-hook correction failed (warning level, never raised).
pub fn emit_teardown_error(error: &dyn std::fmt::Display) {
    tracing::warn!(event = "shutdown.teardown_error", error = %error);
}
