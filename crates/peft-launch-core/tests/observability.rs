//! Observability tests for the launch lifecycle tracing.
//!
//! These tests verify that structured tracing events and spans are emitted
//! without panicking under a capturing subscriber.

use std::sync::Arc;

use peft_launch_core::fakes::{dry_run_collaborators, FakeModelFactory, FakeTrainerBuilder};
use peft_launch_core::mllog::keys;
use peft_launch_core::obs::{
    emit_config_resolved, emit_launch_finished, emit_model_ready, emit_runtime_tuned,
    emit_state, emit_teardown_error, emit_trainer_assembled,
};
use peft_launch_core::telemetry::{default_directives, is_ignored};
use peft_launch_core::{LaunchOptions, LaunchSpan, Launcher, MlLogger, Rank, RuntimeContext};
use serde_json::json;
use tracing::Level;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_lifecycle_events_emit() {
    emit_state("config_resolved");
    emit_config_resolved("abc123", true);
    emit_model_ready("scratch", "lora");
    emit_trainer_assembled("bf16", 1, 1);
    emit_runtime_tuned(1);
    emit_launch_finished(1200, true);
}

/// Swallowed teardown failures are reported at warn level.
#[traced_test]
#[test]
fn test_emit_teardown_error_logs_warning() {
    let err = "exit hook registry poisoned";
    emit_teardown_error(&err);
}

#[traced_test]
#[test]
fn test_launch_span_enter_creates_span() {
    let span = LaunchSpan::enter("test-run", Rank(0));
    drop(span);
}

#[traced_test]
#[test]
fn test_mllogger_counts_only_primary_events() {
    let primary = MlLogger::new(Rank(0));
    let secondary = MlLogger::new(Rank(1));
    for logger in [&primary, &secondary] {
        logger.start(keys::RUN_START, json!({}));
        logger.event(keys::TRAIN_LOSS, json!(0.5), json!({"step": 1}));
        logger.end(keys::RUN_STOP, json!({"status": "success"}));
    }
    assert_eq!(primary.emitted(), 3);
    assert_eq!(secondary.emitted(), 0);
}

#[test]
fn test_default_filter_quiets_collaborators() {
    let directives = default_directives(Level::DEBUG);
    assert!(directives.starts_with("debug,"));
    assert!(directives.contains("distributed=warn"));
    assert!(is_ignored("running build_ext"));
}

/// A full dry launch emits state, model and finish events inside the launch span.
#[traced_test]
#[tokio::test]
async fn test_launch_emits_lifecycle_events() {
    let raw = json!({
        "trainer": {"precision": "bf16", "max_steps": 2, "val_check_interval": 1},
        "model": {"peft": {"peft_scheme": "ia3"}},
    });
    let ctx = Arc::new(RuntimeContext::detached());
    let mut launcher = Launcher::new(
        LaunchOptions::default()
            .with_rank(Rank(0))
            .with_load_checkpoint(false)
            .with_echo_config(false),
        dry_run_collaborators(FakeTrainerBuilder::new(), FakeModelFactory::new()),
        ctx.clone(),
    );
    let report = launcher.run(&raw).await.unwrap();
    assert_eq!(report.fit.steps, 2);
    assert_eq!(ctx.metrics().adapters_attached(), 1);
}
