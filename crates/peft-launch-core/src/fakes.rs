//! In-memory collaborators (testing and dry runs)
//!
//! Provides `FakeCommunicator`, `DryRunEngine`, `FakeTrainerBuilder` and
//! `FakeModelFactory` that satisfy the collaborator contracts without any
//! accelerator, checkpoint store or distributed job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{AdapterConfig, PeftScheme};
use crate::callbacks::{MetricsLoggerFactory, TRAIN_LOSS_METRIC, VAL_LOSS_METRIC};
use crate::config::RunConfig;
use crate::model::{ModelConfig, ModelFactory, ModelHandle, PeftModel};
use crate::orchestrator::Collaborators;
use crate::runtime::RuntimeContext;
use crate::shutdown::DIST_TEARDOWN_HOOK;
use crate::trainer::{
    FitContext, FitSummary, LifecycleObserver, Metrics, Trainer, TrainerBuilder, TrainerInfo,
    TrainingEngine,
};

// ---------------------------------------------------------------------------
// FakeCommunicator
// ---------------------------------------------------------------------------

/// Distributed connection whose teardown fails when run twice.
#[derive(Debug, Clone, Default)]
pub struct FakeCommunicator {
    destroyed: Arc<AtomicU64>,
}

impl FakeCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the connection and schedule its teardown at exit.
    pub fn connect(&self, ctx: &RuntimeContext) -> anyhow::Result<()> {
        let comm = self.clone();
        ctx.exit_hooks()
            .register(DIST_TEARDOWN_HOOK, move || comm.destroy())?;
        Ok(())
    }

    pub fn destroy(&self) -> anyhow::Result<()> {
        let previous = self.destroyed.fetch_add(1, Ordering::SeqCst);
        if previous > 0 {
            anyhow::bail!("distributed connection already destroyed");
        }
        Ok(())
    }

    pub fn destroy_calls(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// DryRunEngine
// ---------------------------------------------------------------------------

/// Training loop that drives observers and reporters with synthetic metrics.
#[derive(Debug, Clone)]
pub struct DryRunEngine {
    max_steps: u64,
    val_check_interval: u64,
    fail_at: Option<u64>,
    communicator: Option<FakeCommunicator>,
}

impl DryRunEngine {
    pub fn new(max_steps: u64, val_check_interval: u64) -> Self {
        Self {
            max_steps,
            val_check_interval: val_check_interval.max(1),
            fail_at: None,
            communicator: None,
        }
    }

    /// Fail with an error when `step` is reached.
    pub fn failing_at(mut self, step: u64) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Destroy `communicator` when the loop exits, as real engines do.
    pub fn with_communicator(mut self, communicator: FakeCommunicator) -> Self {
        self.communicator = Some(communicator);
        self
    }

    fn exit(&self) -> anyhow::Result<()> {
        match &self.communicator {
            Some(comm) => comm.destroy(),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TrainingEngine for DryRunEngine {
    async fn fit(
        &mut self,
        model: &mut ModelHandle,
        mut ctx: FitContext<'_>,
    ) -> anyhow::Result<FitSummary> {
        if model.adapter().is_none() {
            anyhow::bail!("model has no adapter attached");
        }

        ctx.train_start();
        let mut last = Metrics::new();
        for step in 1..=self.max_steps {
            if self.fail_at == Some(step) {
                ctx.train_end(false);
                self.exit()?;
                anyhow::bail!("synthetic failure at step {step}");
            }
            ctx.batch_start(step);
            tokio::task::yield_now().await;
            let mut metrics = Metrics::new();
            metrics.insert(TRAIN_LOSS_METRIC.to_string(), 4.0 / (step as f64 + 1.0));
            ctx.batch_end(step, &metrics);
            last.extend(metrics);

            if step % self.val_check_interval == 0 {
                let mut val = Metrics::new();
                val.insert(VAL_LOSS_METRIC.to_string(), 3.0 / (step as f64 + 1.0));
                ctx.validation_end(step, &val);
                last.extend(val);
            }
        }
        ctx.train_end(true);
        self.exit()?;

        Ok(FitSummary {
            steps: self.max_steps,
            final_metrics: last,
        })
    }
}

// ---------------------------------------------------------------------------
// FakeTrainerBuilder
// ---------------------------------------------------------------------------

/// Trainer builder that, like real engines, writes its own precision into the config.
#[derive(Debug, Clone)]
pub struct FakeTrainerBuilder {
    world_size: u32,
    engine_precision: Value,
    fail: bool,
    fail_at: Option<u64>,
    communicator: FakeCommunicator,
}

impl Default for FakeTrainerBuilder {
    fn default() -> Self {
        Self {
            world_size: 1,
            engine_precision: json!(32),
            fail: false,
            fail_at: None,
            communicator: FakeCommunicator::new(),
        }
    }
}

impl FakeTrainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_world_size(mut self, world_size: u32) -> Self {
        self.world_size = world_size;
        self
    }

    /// Precision the builder writes into `trainer.precision`.
    pub fn with_engine_precision(mut self, precision: Value) -> Self {
        self.engine_precision = precision;
        self
    }

    /// Make `create_trainer` fail after mutating the config.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Make the built engine fail at `step`.
    pub fn training_fails_at(mut self, step: u64) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn communicator(&self) -> &FakeCommunicator {
        &self.communicator
    }
}

impl TrainerBuilder for FakeTrainerBuilder {
    fn create_trainer(
        &self,
        cfg: &mut RunConfig,
        observers: Vec<Arc<dyn LifecycleObserver>>,
        ctx: &RuntimeContext,
    ) -> anyhow::Result<Trainer> {
        cfg.set_precision(self.engine_precision.clone())?;
        if self.fail {
            anyhow::bail!("trainer strategy could not be initialised");
        }
        self.communicator.connect(ctx)?;

        let max_steps = cfg
            .get("trainer.max_steps")
            .and_then(Value::as_u64)
            .unwrap_or(4);
        let val_check_interval = cfg
            .get("trainer.val_check_interval")
            .and_then(Value::as_u64)
            .unwrap_or(2);
        let mut engine = DryRunEngine::new(max_steps, val_check_interval)
            .with_communicator(self.communicator.clone());
        if let Some(step) = self.fail_at {
            engine = engine.failing_at(step);
        }

        Ok(Trainer::new(
            Box::new(engine),
            TrainerInfo {
                world_size: self.world_size,
                precision: self.engine_precision.clone(),
                max_steps: Some(max_steps),
            },
            observers,
        ))
    }
}

// ---------------------------------------------------------------------------
// FakeModelFactory
// ---------------------------------------------------------------------------

/// Call counters shared between a [`FakeModelFactory`] and the models it builds.
#[derive(Debug, Default)]
pub struct FactoryCalls {
    base_loads: AtomicU64,
    restores: AtomicU64,
    constructs: AtomicU64,
    adapters_attached: AtomicU64,
    config_sources: Mutex<Vec<PathBuf>>,
    restore_paths: Mutex<Vec<PathBuf>>,
}

impl FactoryCalls {
    pub fn base_loads(&self) -> u64 {
        self.base_loads.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> u64 {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn constructs(&self) -> u64 {
        self.constructs.load(Ordering::SeqCst)
    }

    pub fn adapters_attached(&self) -> u64 {
        self.adapters_attached.load(Ordering::SeqCst)
    }

    pub fn config_sources(&self) -> Vec<PathBuf> {
        self.config_sources.lock().unwrap().clone()
    }

    pub fn restore_paths(&self) -> Vec<PathBuf> {
        self.restore_paths.lock().unwrap().clone()
    }
}

/// Model built by [`FakeModelFactory`].
#[derive(Debug)]
pub struct FakeModel {
    adapters: Vec<PeftScheme>,
    calls: Arc<FactoryCalls>,
}

impl FakeModel {
    pub fn adapters(&self) -> &[PeftScheme] {
        &self.adapters
    }
}

impl PeftModel for FakeModel {
    fn add_adapter(&mut self, adapter: &AdapterConfig) -> anyhow::Result<()> {
        self.calls.adapters_attached.fetch_add(1, Ordering::SeqCst);
        self.adapters.push(adapter.scheme());
        Ok(())
    }
}

/// Model collaborator serving base configs from memory.
#[derive(Debug, Clone)]
pub struct FakeModelFactory {
    base_configs: HashMap<PathBuf, Value>,
    default_base: Value,
    fail_restore: bool,
    calls: Arc<FactoryCalls>,
}

impl Default for FakeModelFactory {
    fn default() -> Self {
        Self {
            base_configs: HashMap::new(),
            default_base: json!({
                "num_layers": 80,
                "hidden_size": 8192,
                "num_attention_heads": 64,
                "peft": {"peft_scheme": "lora"},
            }),
            fail_restore: false,
            calls: Arc::new(FactoryCalls::default()),
        }
    }
}

impl FakeModelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `config` as the base model config stored at `path`.
    pub fn with_base_config(mut self, path: impl Into<PathBuf>, config: Value) -> Self {
        self.base_configs.insert(path.into(), config);
        self
    }

    /// Make checkpoint restores fail, as with a corrupted checkpoint.
    pub fn failing_restore(mut self) -> Self {
        self.fail_restore = true;
        self
    }

    pub fn calls(&self) -> Arc<FactoryCalls> {
        self.calls.clone()
    }

    fn build(&self) -> Box<dyn PeftModel> {
        Box::new(FakeModel {
            adapters: Vec::new(),
            calls: self.calls.clone(),
        })
    }
}

#[async_trait]
impl ModelFactory for FakeModelFactory {
    async fn load_base_config(&self, source: &Path) -> anyhow::Result<Value> {
        self.calls.base_loads.fetch_add(1, Ordering::SeqCst);
        self.calls
            .config_sources
            .lock()
            .unwrap()
            .push(source.to_path_buf());
        Ok(self
            .base_configs
            .get(source)
            .cloned()
            .unwrap_or_else(|| self.default_base.clone()))
    }

    async fn restore(
        &self,
        path: &Path,
        _model_cfg: &ModelConfig,
        _trainer: &Trainer,
    ) -> anyhow::Result<Box<dyn PeftModel>> {
        self.calls.restores.fetch_add(1, Ordering::SeqCst);
        self.calls
            .restore_paths
            .lock()
            .unwrap()
            .push(path.to_path_buf());
        if self.fail_restore {
            anyhow::bail!("checkpoint at {} is unreadable", path.display());
        }
        Ok(self.build())
    }

    async fn construct(
        &self,
        _model_cfg: &ModelConfig,
        _trainer: &Trainer,
    ) -> anyhow::Result<Box<dyn PeftModel>> {
        self.calls.constructs.fetch_add(1, Ordering::SeqCst);
        Ok(self.build())
    }
}

/// Collaborators backed entirely by the in-memory fakes.
pub fn dry_run_collaborators(
    builder: FakeTrainerBuilder,
    factory: FakeModelFactory,
) -> Collaborators {
    Collaborators {
        trainer_builder: Box::new(builder),
        model_factory: Box::new(factory),
        reporter_factory: Box::new(MetricsLoggerFactory),
    }
}
