//! Default lifecycle observer and metrics reporter.
//!
//! Both write benchmark events through [`MlLogger`], so only rank 0 produces
//! output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::RunConfig;
use crate::mllog::{keys, MlLogger};
use crate::trainer::{
    LifecycleObserver, Metrics, MetricsReporter, MetricsReporterFactory, Trainer, TrainerInfo,
};

/// Metric key carrying the training loss.
pub const TRAIN_LOSS_METRIC: &str = "train_loss";
/// Metric key carrying the validation loss.
pub const VAL_LOSS_METRIC: &str = "val_loss";

/// Hyper-parameters logged once when training starts: `(event key, config path)`.
const LOGGED_HYPERPARAMS: [(&str, &str); 5] = [
    (keys::GLOBAL_BATCH_SIZE, "model.global_batch_size"),
    (keys::SEED, "model.seed"),
    (keys::PEFT_SCHEME, "model.peft.peft_scheme"),
    (keys::LORA_RANK, "model.peft.lora_tuning.adapter_dim"),
    (keys::LORA_ALPHA, "model.peft.lora_tuning.alpha"),
];

fn global_batch_size(cfg: &RunConfig) -> u64 {
    cfg.get("model.global_batch_size")
        .and_then(Value::as_u64)
        .unwrap_or(1)
}

/// Lifecycle observer that frames the run in benchmark events.
pub struct RunObserver {
    logger: Arc<MlLogger>,
    hyperparams: Map<String, Value>,
    last_step: AtomicU64,
}

impl RunObserver {
    pub fn new(cfg: &RunConfig, logger: Arc<MlLogger>) -> Self {
        let hyperparams = LOGGED_HYPERPARAMS
            .iter()
            .filter_map(|(key, path)| cfg.get(path).map(|v| (key.to_string(), v.clone())))
            .collect();
        logger.start(keys::INIT_START, json!({}));
        Self {
            logger,
            hyperparams,
            last_step: AtomicU64::new(0),
        }
    }

    pub fn hyperparams(&self) -> &Map<String, Value> {
        &self.hyperparams
    }

    /// Last step seen by a batch or validation callback.
    pub fn last_step(&self) -> u64 {
        self.last_step.load(Ordering::Relaxed)
    }
}

impl LifecycleObserver for RunObserver {
    fn name(&self) -> &str {
        "run_observer"
    }

    fn on_train_start(&self, info: &TrainerInfo) {
        for (key, value) in &self.hyperparams {
            self.logger.event(key, value.clone(), json!({}));
        }
        if let Some(max_steps) = info.max_steps {
            self.logger.event(keys::MAX_STEPS, json!(max_steps), json!({}));
        }
        self.logger.end(keys::INIT_STOP, json!({}));
        self.logger.start(keys::RUN_START, json!({}));
        self.logger.start(keys::BLOCK_START, json!({"step": 0}));
    }

    fn on_train_batch_end(&self, step: u64, _metrics: &Metrics) {
        self.last_step.store(step, Ordering::Relaxed);
    }

    fn on_validation_end(&self, step: u64, metrics: &Metrics) {
        self.last_step.store(step, Ordering::Relaxed);
        self.logger.end(keys::BLOCK_STOP, json!({"step": step}));
        if let Some(loss) = metrics.get(VAL_LOSS_METRIC) {
            self.logger
                .event(keys::EVAL_ACCURACY, json!(loss), json!({"step": step}));
        }
        self.logger.start(keys::BLOCK_START, json!({"step": step}));
    }

    fn on_train_end(&self, success: bool) {
        let status = if success { "success" } else { "aborted" };
        self.logger.end(
            keys::RUN_STOP,
            json!({"status": status, "step": self.last_step()}),
        );
    }
}

/// Metrics reporter that forwards training loss and keeps the last value per key.
pub struct MetricsLogger {
    logger: Arc<MlLogger>,
    global_batch_size: u64,
    world_size: u32,
    last: Metrics,
    status: Option<String>,
}

impl MetricsLogger {
    pub fn new(cfg: &RunConfig, logger: Arc<MlLogger>, trainer: &Trainer) -> Self {
        Self {
            logger,
            global_batch_size: global_batch_size(cfg),
            world_size: trainer.world_size(),
            last: Metrics::new(),
            status: None,
        }
    }

    pub fn last(&self, key: &str) -> Option<f64> {
        self.last.get(key).copied()
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

impl MetricsReporter for MetricsLogger {
    fn name(&self) -> &str {
        "metrics_logger"
    }

    fn log_metrics(&mut self, metrics: &Metrics, step: u64) {
        for (key, value) in metrics {
            self.last.insert(key.clone(), *value);
        }
        if let Some(loss) = metrics.get(TRAIN_LOSS_METRIC) {
            self.logger.event(
                keys::TRAIN_LOSS,
                json!(loss),
                json!({
                    "step": step,
                    "samples_count": step.saturating_mul(self.global_batch_size),
                }),
            );
        }
    }

    fn finalize(&mut self, status: &str) {
        self.status = Some(status.to_string());
    }
}

/// Builds a [`MetricsLogger`] for the live trainer.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsLoggerFactory;

impl MetricsReporterFactory for MetricsLoggerFactory {
    fn create(
        &self,
        cfg: &RunConfig,
        logger: Arc<MlLogger>,
        trainer: &Trainer,
    ) -> anyhow::Result<Box<dyn MetricsReporter>> {
        Ok(Box::new(MetricsLogger::new(cfg, logger, trainer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resolve;
    use crate::fakes::DryRunEngine;
    use crate::identity::Rank;

    fn cfg() -> RunConfig {
        resolve(&json!({
            "model": {
                "global_batch_size": 8,
                "seed": 1234,
                "peft": {"peft_scheme": "lora", "lora_tuning": {"adapter_dim": 16, "alpha": 32}},
            },
            "trainer": {"precision": "bf16", "max_steps": 4},
        }))
        .unwrap()
    }

    fn trainer() -> Trainer {
        Trainer::new(
            Box::new(DryRunEngine::new(4, 2)),
            TrainerInfo {
                world_size: 8,
                precision: json!("bf16"),
                max_steps: Some(4),
            },
            Vec::new(),
        )
    }

    #[test]
    fn test_observer_collects_hyperparams() {
        let observer = RunObserver::new(&cfg(), Arc::new(MlLogger::new(Rank(0))));
        let params = observer.hyperparams();
        assert_eq!(params[keys::GLOBAL_BATCH_SIZE], json!(8));
        assert_eq!(params[keys::PEFT_SCHEME], json!("lora"));
        assert_eq!(params[keys::LORA_RANK], json!(16));
    }

    #[test]
    fn test_observer_event_sequence_on_primary() {
        let logger = Arc::new(MlLogger::new(Rank(0)));
        let observer = RunObserver::new(&cfg(), logger.clone());
        let info = trainer().info().clone();

        observer.on_train_start(&info);
        let after_start = logger.emitted();
        // init_start + 5 hyperparams + max_steps + init_stop + run_start + block_start
        assert_eq!(after_start, 10);

        let mut metrics = Metrics::new();
        metrics.insert(VAL_LOSS_METRIC.to_string(), 0.92);
        observer.on_validation_end(2, &metrics);
        observer.on_train_end(true);
        assert_eq!(logger.emitted(), after_start + 4);
        assert_eq!(observer.last_step(), 2);
    }

    #[test]
    fn test_observer_silent_on_other_ranks() {
        let logger = Arc::new(MlLogger::new(Rank(3)));
        let observer = RunObserver::new(&cfg(), logger.clone());
        observer.on_train_start(trainer().info());
        observer.on_train_end(false);
        assert_eq!(logger.emitted(), 0);
    }

    #[test]
    fn test_metrics_logger_keeps_last_values() {
        let logger = Arc::new(MlLogger::new(Rank(0)));
        let trainer = trainer();
        let mut reporter = MetricsLogger::new(&cfg(), logger.clone(), &trainer);
        assert_eq!(reporter.world_size(), 8);

        let mut metrics = Metrics::new();
        metrics.insert(TRAIN_LOSS_METRIC.to_string(), 2.5);
        reporter.log_metrics(&metrics, 1);
        metrics.insert(TRAIN_LOSS_METRIC.to_string(), 1.5);
        metrics.insert("lr".to_string(), 1e-4);
        reporter.log_metrics(&metrics, 2);
        reporter.finalize("success");

        assert_eq!(reporter.last(TRAIN_LOSS_METRIC), Some(1.5));
        assert_eq!(reporter.last("lr"), Some(1e-4));
        assert_eq!(reporter.status(), Some("success"));
        assert_eq!(logger.emitted(), 2);
    }

    #[test]
    fn test_factory_builds_named_reporter() {
        let reporter = MetricsLoggerFactory
            .create(&cfg(), Arc::new(MlLogger::new(Rank(0))), &trainer())
            .unwrap();
        assert_eq!(reporter.name(), "metrics_logger");
    }
}
