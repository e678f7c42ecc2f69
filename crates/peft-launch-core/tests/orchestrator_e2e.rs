//! Whole launches against the in-memory collaborators.

use std::path::PathBuf;
use std::sync::Arc;

use peft_launch_core::fakes::{dry_run_collaborators, FakeModelFactory, FakeTrainerBuilder};
use peft_launch_core::{
    AdapterConfig, LaunchError, LaunchOptions, LaunchState, Launcher, ModelSource, Rank,
    RuntimeContext, StartMethod, DIST_TEARDOWN_HOOK,
};
use serde_json::{json, Value};

use LaunchState::*;

fn raw() -> Value {
    json!({
        "trainer": {
            "devices": 8,
            "precision": "bf16",
            "max_steps": 6,
            "val_check_interval": 3,
        },
        "model": {
            "restore_from_path": "/ckpt/llama2-70b",
            "tensor_model_parallel_size": 4,
            "data_parallel_size": "${floor_div:${trainer.devices},${model.tensor_model_parallel_size}}",
            "global_batch_size": 8,
            "peft": {"peft_scheme": "lora", "lora_tuning": {"adapter_dim": 16}},
        },
    })
}

fn options(load_checkpoint: bool) -> LaunchOptions {
    LaunchOptions::default()
        .with_rank(Rank(0))
        .with_load_checkpoint(load_checkpoint)
        .with_echo_config(false)
}

const HAPPY_PATH: [LaunchState; 11] = [
    Start,
    IdentityResolved,
    ConfigResolved,
    TrainerPreBuilt,
    ModelReady,
    TrainerFinalized,
    RuntimeTuned,
    TrainingRunning,
    Completed,
    ShutdownGuarded,
    Exit,
];

#[tokio::test]
async fn fresh_launch_walks_every_state() {
    let builder = FakeTrainerBuilder::new().with_engine_precision(json!(32));
    let factory = FakeModelFactory::new();
    let calls = factory.calls();
    let comm = builder.communicator().clone();
    let ctx = Arc::new(RuntimeContext::detached());

    let mut launcher = Launcher::new(
        options(false),
        dry_run_collaborators(builder, factory),
        ctx.clone(),
    );
    let report = launcher.run(&raw()).await.unwrap();

    assert_eq!(report.states, HAPPY_PATH.to_vec());
    assert_eq!(launcher.states(), &HAPPY_PATH);
    assert_eq!(report.model_source, ModelSource::FromScratch);
    assert_eq!(report.precision, Some(json!("bf16")));
    assert_eq!(report.start_method, StartMethod::Spawn);
    assert_eq!(report.fit.steps, 6);
    assert!(report.fit.final_metrics.contains_key("val_loss"));
    assert!(matches!(report.adapter, Some(AdapterConfig::Lora(_))));
    assert_eq!(report.rank, 0);
    assert!(!report.config_echoed);
    assert_eq!(report.run_id, launcher.run_id());

    assert_eq!(calls.constructs(), 1);
    assert_eq!(calls.restores(), 0);
    assert_eq!(calls.adapters_attached(), 1);

    assert!(ctx.tuning().is_some());
    assert!(!ctx.exit_hooks().is_registered(DIST_TEARDOWN_HOOK));
    assert!(ctx.exit_hooks().run_pending().is_empty());
    assert_eq!(comm.destroy_calls(), 1);
}

#[tokio::test]
async fn checkpoint_launch_restores() {
    let factory = FakeModelFactory::new();
    let calls = factory.calls();
    let ctx = Arc::new(RuntimeContext::detached());

    let mut launcher = Launcher::new(
        options(true),
        dry_run_collaborators(FakeTrainerBuilder::new(), factory),
        ctx,
    );
    let report = launcher.run(&raw()).await.unwrap();

    assert_eq!(
        report.model_source,
        ModelSource::FromCheckpoint {
            path: PathBuf::from("/ckpt/llama2-70b")
        }
    );
    assert_eq!(calls.restores(), 1);
    assert_eq!(calls.constructs(), 0);
}

#[tokio::test]
async fn training_failure_still_runs_shutdown_guard() {
    let builder = FakeTrainerBuilder::new().training_fails_at(4);
    let comm = builder.communicator().clone();
    let ctx = Arc::new(RuntimeContext::detached());

    let mut launcher = Launcher::new(
        options(false),
        dry_run_collaborators(builder, FakeModelFactory::new()),
        ctx.clone(),
    );
    let err = launcher.run(&raw()).await.unwrap_err();

    assert!(matches!(err, LaunchError::Training { .. }));
    assert_eq!(
        launcher.states(),
        &[
            Start,
            IdentityResolved,
            ConfigResolved,
            TrainerPreBuilt,
            ModelReady,
            TrainerFinalized,
            RuntimeTuned,
            TrainingRunning,
            Failed,
            ShutdownGuarded,
            Exit,
        ]
    );
    assert!(ctx.exit_hooks().run_pending().is_empty());
    assert_eq!(comm.destroy_calls(), 1);
    assert_eq!(ctx.metrics().teardown_unregistrations(), 1);
}

#[tokio::test]
async fn config_error_aborts_before_trainer_work() {
    let factory = FakeModelFactory::new();
    let calls = factory.calls();
    let ctx = Arc::new(RuntimeContext::detached());
    let mut raw = raw();
    raw["model"]["data_parallel_size"] = json!("${floor_div:${trainer.missing},2}");

    let mut launcher = Launcher::new(
        options(false),
        dry_run_collaborators(FakeTrainerBuilder::new(), factory),
        ctx.clone(),
    );
    let err = launcher.run(&raw).await.unwrap_err();

    assert!(matches!(err, LaunchError::Config(_)));
    assert_eq!(
        launcher.states(),
        &[Start, IdentityResolved, Failed, ShutdownGuarded, Exit]
    );
    assert_eq!(calls.base_loads(), 0);
    assert!(ctx.exit_hooks().names().is_empty());
    assert!(ctx.tuning().is_none());
}

#[tokio::test]
async fn unknown_scheme_fails_after_trainer_prebuild() {
    let ctx = Arc::new(RuntimeContext::detached());
    let mut raw = raw();
    raw["model"]["peft"]["peft_scheme"] = json!("bitfit");

    let mut launcher = Launcher::new(
        options(false),
        dry_run_collaborators(FakeTrainerBuilder::new(), FakeModelFactory::new()),
        ctx.clone(),
    );
    let err = launcher.run(&raw).await.unwrap_err();

    assert!(matches!(err, LaunchError::UnknownAdapterScheme { .. }));
    assert_eq!(
        launcher.states(),
        &[
            Start,
            IdentityResolved,
            ConfigResolved,
            TrainerPreBuilt,
            Failed,
            ShutdownGuarded,
            Exit,
        ]
    );
    // The engine never ran, so the guard cancelled a still-live hook.
    assert!(!ctx.exit_hooks().is_registered(DIST_TEARDOWN_HOOK));
}

#[tokio::test]
async fn unknown_scheme_wins_over_missing_checkpoint_path() {
    let mut raw = raw();
    raw["model"]["peft"]["peft_scheme"] = json!("bitfit");
    raw["model"]
        .as_object_mut()
        .unwrap()
        .remove("restore_from_path");

    let mut launcher = Launcher::new(
        options(true),
        dry_run_collaborators(FakeTrainerBuilder::new(), FakeModelFactory::new()),
        Arc::new(RuntimeContext::detached()),
    );
    let err = launcher.run(&raw).await.unwrap_err();

    assert!(matches!(err, LaunchError::UnknownAdapterScheme { ref scheme } if scheme == "bitfit"));
    assert_eq!(launcher.states().last(), Some(&Exit));
}

#[tokio::test]
async fn only_primary_rank_echoes_config() {
    for (rank, echoed) in [(0, true), (3, false)] {
        let mut launcher = Launcher::new(
            options(false).with_rank(Rank(rank)).with_echo_config(true),
            dry_run_collaborators(FakeTrainerBuilder::new(), FakeModelFactory::new()),
            Arc::new(RuntimeContext::detached()),
        );
        let report = launcher.run(&raw()).await.unwrap();
        assert_eq!(report.config_echoed, echoed);
        assert_eq!(report.rank, rank);
    }
}

#[tokio::test]
async fn report_serializes_states_in_snake_case() {
    let mut launcher = Launcher::new(
        options(false),
        dry_run_collaborators(FakeTrainerBuilder::new(), FakeModelFactory::new()),
        Arc::new(RuntimeContext::detached()),
    );
    let report = launcher.run(&raw()).await.unwrap();
    let v = serde_json::to_value(&report).unwrap();
    assert_eq!(v["states"][3], json!("trainer_pre_built"));
    assert_eq!(v["model_source"]["kind"], json!("from_scratch"));
    assert_eq!(v["adapter"]["scheme"], json!("lora"));
    assert_eq!(v["config_digest"].as_str().unwrap().len(), 64);
}
