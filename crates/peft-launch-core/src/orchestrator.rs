//! Launch sequencing.
//!
//! [`Launcher::run`] walks the launch state machine on a single control
//! thread. Every step completes before the next begins and no step is
//! skipped. Failures propagate unchanged, but the shutdown guard runs on every
//! path once the launch has started.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, Instrument};

use crate::adapter::{lookup_scheme, AdapterConfig};
use crate::callbacks::RunObserver;
use crate::config::{resolve, RunConfig};
use crate::error::Result;
use crate::identity::{load_checkpoint_toggle, resolve_rank, Rank};
use crate::mllog::MlLogger;
use crate::model::{ModelConfig, ModelFactory, ModelInitializer, ModelSource, BASE_CONFIG_PATH};
use crate::obs;
use crate::runtime::{RuntimeContext, StartMethod};
use crate::shutdown::ShutdownGuard;
use crate::trainer::{
    attach_reporter, construct_trainer, FitSummary, MetricsReporterFactory, TrainerBuilder,
};

/// Banner printed by rank 0 before the resolved config.
pub const CONFIG_BANNER: &str = "************** Experiment configuration ***********";

/// States of one launch, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    Start,
    IdentityResolved,
    ConfigResolved,
    TrainerPreBuilt,
    ModelReady,
    TrainerFinalized,
    RuntimeTuned,
    TrainingRunning,
    Completed,
    Failed,
    ShutdownGuarded,
    Exit,
}

impl LaunchState {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchState::Start => "start",
            LaunchState::IdentityResolved => "identity_resolved",
            LaunchState::ConfigResolved => "config_resolved",
            LaunchState::TrainerPreBuilt => "trainer_pre_built",
            LaunchState::ModelReady => "model_ready",
            LaunchState::TrainerFinalized => "trainer_finalized",
            LaunchState::RuntimeTuned => "runtime_tuned",
            LaunchState::TrainingRunning => "training_running",
            LaunchState::Completed => "completed",
            LaunchState::Failed => "failed",
            LaunchState::ShutdownGuarded => "shutdown_guarded",
            LaunchState::Exit => "exit",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LaunchState::Completed | LaunchState::Failed)
    }
}

impl std::fmt::Display for LaunchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External collaborators the launch drives.
pub struct Collaborators {
    pub trainer_builder: Box<dyn TrainerBuilder>,
    pub model_factory: Box<dyn ModelFactory>,
    pub reporter_factory: Box<dyn MetricsReporterFactory>,
}

/// Launch inputs that do not come from the config tree.
///
/// `rank` and `load_checkpoint` left as `None` are read from the environment
/// when the launch resolves its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub rank: Option<Rank>,
    pub load_checkpoint: Option<bool>,
    pub base_config_path: PathBuf,
    pub echo_config: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            rank: None,
            load_checkpoint: None,
            base_config_path: PathBuf::from(BASE_CONFIG_PATH),
            echo_config: true,
        }
    }
}

impl LaunchOptions {
    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn with_load_checkpoint(mut self, load_checkpoint: bool) -> Self {
        self.load_checkpoint = Some(load_checkpoint);
        self
    }

    pub fn with_base_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_config_path = path.into();
        self
    }

    pub fn with_echo_config(mut self, echo: bool) -> Self {
        self.echo_config = echo;
        self
    }

    /// Rank and checkpoint toggle, falling back to the environment.
    pub fn identity(&self) -> Result<(Rank, bool)> {
        let rank = self.rank.unwrap_or_else(resolve_rank);
        let load_checkpoint = match self.load_checkpoint {
            Some(value) => value,
            None => load_checkpoint_toggle()?,
        };
        Ok((rank, load_checkpoint))
    }
}

/// Outcome of a completed launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchReport {
    pub run_id: String,
    pub rank: i64,
    pub model_source: ModelSource,
    pub adapter: Option<AdapterConfig>,
    pub precision: Option<Value>,
    pub config_digest: String,
    pub config_echoed: bool,
    pub start_method: StartMethod,
    pub states: Vec<LaunchState>,
    pub fit: FitSummary,
    pub duration_ms: u64,
}

/// What a launch would do, computed without building anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub rank: i64,
    pub load_checkpoint: bool,
    pub model_source: ModelSource,
    pub config_source: PathBuf,
    pub adapter: AdapterConfig,
    pub precision: Option<Value>,
    pub start_method: StartMethod,
    pub config_digest: String,
}

/// Resolve identity and config and decide model source and adapter.
///
/// The adapter is instantiated from the run's own `model` section; base
/// model defaults are not consulted.
pub fn plan(options: &LaunchOptions, raw: &Value) -> Result<LaunchPlan> {
    let (rank, load_checkpoint) = options.identity()?;
    let cfg = resolve(raw)?;
    let scheme = lookup_scheme(cfg.peft_scheme()?)?;
    let model_source = ModelSource::select(load_checkpoint, &cfg)?;
    let model_cfg = ModelConfig::new(
        cfg.model_section()
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    );
    let adapter = scheme.instantiate(&model_cfg)?;

    Ok(LaunchPlan {
        rank: rank.0,
        load_checkpoint,
        config_source: model_source
            .config_source(&options.base_config_path)
            .to_path_buf(),
        model_source,
        adapter,
        precision: cfg.precision().cloned(),
        start_method: StartMethod::Spawn,
        config_digest: cfg.digest(),
    })
}

/// Everything the training step produced, gathered for the report.
struct Launched {
    model_source: ModelSource,
    adapter: Option<AdapterConfig>,
    precision: Option<Value>,
    config_digest: String,
    config_echoed: bool,
    fit: FitSummary,
}

/// Drives one launch through the state machine.
pub struct Launcher {
    options: LaunchOptions,
    collaborators: Collaborators,
    ctx: Arc<RuntimeContext>,
    run_id: String,
    states: Vec<LaunchState>,
}

impl Launcher {
    pub fn new(options: LaunchOptions, collaborators: Collaborators, ctx: Arc<RuntimeContext>) -> Self {
        Self {
            options,
            collaborators,
            ctx,
            run_id: uuid::Uuid::new_v4().to_string(),
            states: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// States visited by the last [`Launcher::run`], in order.
    pub fn states(&self) -> &[LaunchState] {
        &self.states
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    /// Run the launch from the raw config tree to exit.
    ///
    /// On failure the error is returned after the shutdown guard has run;
    /// [`Launcher::states`] still shows how far the launch got.
    pub async fn run(&mut self, raw: &Value) -> Result<LaunchReport> {
        let started = Instant::now();
        self.states.clear();
        self.transition(LaunchState::Start);

        let mut guard = ShutdownGuard::arm(self.ctx.clone());

        let outcome = match self.options.identity() {
            Ok((rank, load_checkpoint)) => {
                self.transition(LaunchState::IdentityResolved);
                let span = obs::launch_span(&self.run_id, rank);
                self.launch(raw, rank, load_checkpoint)
                    .instrument(span)
                    .await
                    .map(|launched| (rank, launched))
            }
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(_) => self.transition(LaunchState::Completed),
            Err(e) => {
                error!(error = %e, "launch failed");
                self.transition(LaunchState::Failed);
            }
        }

        guard.release();
        self.transition(LaunchState::ShutdownGuarded);
        self.ctx.metrics().flush();
        self.transition(LaunchState::Exit);

        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_launch_finished(duration_ms, outcome.is_ok());

        let (rank, launched) = outcome?;
        Ok(LaunchReport {
            run_id: self.run_id.clone(),
            rank: rank.0,
            model_source: launched.model_source,
            adapter: launched.adapter,
            precision: launched.precision,
            config_digest: launched.config_digest,
            config_echoed: launched.config_echoed,
            start_method: self.ctx.start_method(),
            states: self.states.clone(),
            fit: launched.fit,
            duration_ms,
        })
    }

    async fn launch(&mut self, raw: &Value, rank: Rank, load_checkpoint: bool) -> Result<Launched> {
        let mut cfg = resolve(raw)?;
        let config_digest = cfg.digest();
        let config_echoed = self.options.echo_config && rank.is_primary();
        if config_echoed {
            echo_config(&cfg)?;
        }
        obs::emit_config_resolved(&config_digest, config_echoed);
        self.transition(LaunchState::ConfigResolved);

        let logger = Arc::new(MlLogger::new(rank));
        let observer = Arc::new(RunObserver::new(&cfg, logger.clone()));
        let mut trainer = construct_trainer(
            &mut cfg,
            self.collaborators.trainer_builder.as_ref(),
            observer,
            &self.ctx,
        )?;
        self.transition(LaunchState::TrainerPreBuilt);

        let initializer =
            ModelInitializer::new(load_checkpoint, self.options.base_config_path.clone());
        let model = initializer
            .create_model(
                &cfg,
                &trainer,
                self.collaborators.model_factory.as_ref(),
                &self.ctx,
            )
            .await?;
        self.transition(LaunchState::ModelReady);

        attach_reporter(
            &cfg,
            &mut trainer,
            self.collaborators.reporter_factory.as_ref(),
            logger,
        )?;
        let precision = cfg.precision().cloned();
        obs::emit_trainer_assembled(
            &precision
                .as_ref()
                .map(render_precision)
                .unwrap_or_else(|| "unset".to_string()),
            trainer.observer_names().len(),
            trainer.reporter_names().len(),
        );
        self.transition(LaunchState::TrainerFinalized);

        self.ctx.apply_runtime_tuning()?;
        self.transition(LaunchState::RuntimeTuned);

        let model_source = model.source().clone();
        let adapter = model.adapter().cloned();
        self.transition(LaunchState::TrainingRunning);
        let fit = trainer.fit(model).await?;

        Ok(Launched {
            model_source,
            adapter,
            precision,
            config_digest,
            config_echoed,
            fit,
        })
    }

    fn transition(&mut self, state: LaunchState) {
        self.states.push(state);
        obs::emit_state(state.as_str());
    }
}

fn render_precision(precision: &Value) -> String {
    match precision {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn echo_config(cfg: &RunConfig) -> Result<()> {
    let yaml = cfg.to_yaml()?;
    println!("\n\n{CONFIG_BANNER}");
    println!("\n{yaml}");
    Ok(())
}
