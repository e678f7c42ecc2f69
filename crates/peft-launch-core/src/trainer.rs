//! Trainer assembly.
//!
//! The training engine is an external collaborator reached through
//! [`TrainerBuilder`] and [`TrainingEngine`]. Assembly happens in two steps:
//! [`construct_trainer`] builds the trainer with its lifecycle observer and
//! protects `trainer.precision` from the builder's side effects;
//! [`attach_reporter`] appends the metrics reporter, which needs the live
//! trainer.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::{LaunchError, Result};
use crate::mllog::MlLogger;
use crate::model::ModelHandle;
use crate::runtime::RuntimeContext;

/// Scalar metrics reported by the engine, keyed by name.
pub type Metrics = BTreeMap<String, f64>;

/// Callbacks invoked by the engine at defined points of the training loop.
pub trait LifecycleObserver: Send + Sync {
    fn name(&self) -> &str;

    fn on_train_start(&self, _info: &TrainerInfo) {}

    fn on_train_batch_start(&self, _step: u64) {}

    fn on_train_batch_end(&self, _step: u64, _metrics: &Metrics) {}

    fn on_validation_end(&self, _step: u64, _metrics: &Metrics) {}

    fn on_train_end(&self, _success: bool) {}
}

/// Sink for metrics produced during training.
pub trait MetricsReporter: Send + Sync {
    fn name(&self) -> &str;

    fn log_metrics(&mut self, metrics: &Metrics, step: u64);

    fn finalize(&mut self, _status: &str) {}
}

/// Builds the metrics reporter once the trainer exists.
pub trait MetricsReporterFactory: Send + Sync {
    fn create(
        &self,
        cfg: &RunConfig,
        logger: Arc<MlLogger>,
        trainer: &Trainer,
    ) -> anyhow::Result<Box<dyn MetricsReporter>>;
}

/// What the engine hands back after `fit`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub steps: u64,
    pub final_metrics: Metrics,
}

/// Observers and reporters lent to the engine for one `fit` call.
pub struct FitContext<'a> {
    pub info: &'a TrainerInfo,
    pub observers: &'a [Arc<dyn LifecycleObserver>],
    pub reporters: &'a mut [Box<dyn MetricsReporter>],
}

impl FitContext<'_> {
    pub fn train_start(&self) {
        for observer in self.observers {
            observer.on_train_start(self.info);
        }
    }

    pub fn batch_start(&self, step: u64) {
        for observer in self.observers {
            observer.on_train_batch_start(step);
        }
    }

    /// Notify observers and forward the step's metrics to every reporter.
    pub fn batch_end(&mut self, step: u64, metrics: &Metrics) {
        for observer in self.observers {
            observer.on_train_batch_end(step, metrics);
        }
        for reporter in self.reporters.iter_mut() {
            reporter.log_metrics(metrics, step);
        }
    }

    pub fn validation_end(&mut self, step: u64, metrics: &Metrics) {
        for observer in self.observers {
            observer.on_validation_end(step, metrics);
        }
        for reporter in self.reporters.iter_mut() {
            reporter.log_metrics(metrics, step);
        }
    }

    pub fn train_end(&mut self, success: bool) {
        for observer in self.observers {
            observer.on_train_end(success);
        }
        let status = if success { "success" } else { "failed" };
        for reporter in self.reporters.iter_mut() {
            reporter.finalize(status);
        }
    }
}

/// The training loop owned by the external engine.
#[async_trait]
pub trait TrainingEngine: Send + Sync {
    async fn fit(
        &mut self,
        model: &mut ModelHandle,
        ctx: FitContext<'_>,
    ) -> anyhow::Result<FitSummary>;
}

/// Engine-construction step. Known to write `trainer.precision` into `cfg`.
pub trait TrainerBuilder: Send + Sync {
    fn create_trainer(
        &self,
        cfg: &mut RunConfig,
        observers: Vec<Arc<dyn LifecycleObserver>>,
        ctx: &RuntimeContext,
    ) -> anyhow::Result<Trainer>;
}

/// Distributed execution settings of a built trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerInfo {
    pub world_size: u32,
    pub precision: Value,
    pub max_steps: Option<u64>,
}

/// A built trainer: engine, lifecycle observers and metrics reporters.
pub struct Trainer {
    engine: Box<dyn TrainingEngine>,
    info: TrainerInfo,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    reporters: Vec<Box<dyn MetricsReporter>>,
    model: Option<ModelHandle>,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("info", &self.info)
            .field("observers", &self.observer_names())
            .field("reporters", &self.reporter_names())
            .finish()
    }
}

impl Trainer {
    pub fn new(
        engine: Box<dyn TrainingEngine>,
        info: TrainerInfo,
        observers: Vec<Arc<dyn LifecycleObserver>>,
    ) -> Self {
        Self {
            engine,
            info,
            observers,
            reporters: Vec::new(),
            model: None,
        }
    }

    pub fn info(&self) -> &TrainerInfo {
        &self.info
    }

    pub fn world_size(&self) -> u32 {
        self.info.world_size
    }

    pub fn observer_names(&self) -> Vec<String> {
        self.observers.iter().map(|o| o.name().to_string()).collect()
    }

    pub fn reporter_names(&self) -> Vec<String> {
        self.reporters.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn push_reporter(&mut self, reporter: Box<dyn MetricsReporter>) {
        self.reporters.push(reporter);
    }

    /// The model handed to [`Trainer::fit`], if any.
    pub fn model(&self) -> Option<&ModelHandle> {
        self.model.as_ref()
    }

    /// Take ownership of `model` and run the engine's training loop.
    pub async fn fit(&mut self, model: ModelHandle) -> Result<FitSummary> {
        let model = self.model.insert(model);
        let ctx = FitContext {
            info: &self.info,
            observers: &self.observers,
            reporters: &mut self.reporters,
        };
        self.engine
            .fit(model, ctx)
            .await
            .map_err(|source| LaunchError::Training { source })
    }
}

/// Build the trainer with `observer` in its initial callback list.
///
/// `trainer.precision` is snapshotted before the builder runs and written
/// back afterwards, so the configured value always survives construction.
pub fn construct_trainer(
    cfg: &mut RunConfig,
    builder: &dyn TrainerBuilder,
    observer: Arc<dyn LifecycleObserver>,
    ctx: &RuntimeContext,
) -> Result<Trainer> {
    let precision = cfg.precision().cloned();
    let built = builder.create_trainer(cfg, vec![observer], ctx);

    match precision {
        Some(precision) => {
            if cfg.precision() != Some(&precision) {
                let builder_wrote = cfg.precision().cloned().unwrap_or(Value::Null);
                warn!(
                    configured = %precision,
                    builder_wrote = %builder_wrote,
                    "trainer builder overwrote precision; restoring configured value"
                );
            }
            cfg.set_precision(precision)?;
        }
        None => debug!("no trainer.precision configured; keeping builder value"),
    }

    built.map_err(LaunchError::trainer)
}

/// Create the metrics reporter from the built trainer and append it.
pub fn attach_reporter(
    cfg: &RunConfig,
    trainer: &mut Trainer,
    factory: &dyn MetricsReporterFactory,
    logger: Arc<MlLogger>,
) -> Result<()> {
    let reporter = factory
        .create(cfg, logger, trainer)
        .map_err(LaunchError::trainer)?;
    debug!(reporter = %reporter.name(), "metrics reporter attached");
    trainer.push_reporter(reporter);
    Ok(())
}

/// Both assembly steps back to back.
pub fn build_trainer(
    cfg: &mut RunConfig,
    builder: &dyn TrainerBuilder,
    observer: Arc<dyn LifecycleObserver>,
    factory: &dyn MetricsReporterFactory,
    logger: Arc<MlLogger>,
    ctx: &RuntimeContext,
) -> Result<Trainer> {
    let mut trainer = construct_trainer(cfg, builder, observer, ctx)?;
    attach_reporter(cfg, &mut trainer, factory, logger)?;
    Ok(trainer)
}
