//! Model initialization: source selection, config merge, build, adapter attach.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::adapter::{lookup_scheme, AdapterConfig};
use crate::config::{deep_merge, lookup, RunConfig, RESTORE_PATH_KEY};
use crate::error::{LaunchError, Result};
use crate::runtime::RuntimeContext;
use crate::trainer::Trainer;

/// Base model configuration used when no checkpoint is loaded.
pub const BASE_CONFIG_PATH: &str = "/workspace/ft-llm/conf/base";

/// Merged model configuration handed to the model collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelConfig {
    tree: Value,
}

impl ModelConfig {
    pub fn new(tree: Value) -> Self {
        Self { tree }
    }

    /// Value at a dotted path relative to the model section.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.tree, path)
    }

    pub fn as_value(&self) -> &Value {
        &self.tree
    }
}

/// Where the model weights come from. Decided once per launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSource {
    FromCheckpoint { path: PathBuf },
    FromScratch,
}

impl ModelSource {
    /// Restore from `model.restore_from_path` when `load_checkpoint` is set,
    /// otherwise build fresh.
    pub fn select(load_checkpoint: bool, cfg: &RunConfig) -> Result<Self> {
        if !load_checkpoint {
            return Ok(ModelSource::FromScratch);
        }
        let path = cfg.str_at(RESTORE_PATH_KEY)?;
        Ok(ModelSource::FromCheckpoint {
            path: PathBuf::from(path),
        })
    }

    /// Location the base model configuration is read from.
    pub fn config_source<'a>(&'a self, base_config_path: &'a Path) -> &'a Path {
        match self {
            ModelSource::FromCheckpoint { path } => path,
            ModelSource::FromScratch => base_config_path,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelSource::FromCheckpoint { .. } => "checkpoint",
            ModelSource::FromScratch => "scratch",
        }
    }
}

/// A model built by the collaborator that accepts adapters.
pub trait PeftModel: Send + Sync {
    /// Attach `adapter` in place.
    fn add_adapter(&mut self, adapter: &AdapterConfig) -> anyhow::Result<()>;
}

/// Model collaborator: config merge, checkpoint restore, fresh construction.
#[async_trait]
pub trait ModelFactory: Send + Sync {
    /// Base model configuration stored at `source`.
    async fn load_base_config(&self, source: &Path) -> anyhow::Result<Value>;

    /// Overlay the run's `model` section on `base`; explicit fields win.
    fn merge_config(&self, mut base: Value, cfg: &RunConfig) -> anyhow::Result<ModelConfig> {
        if base.is_null() {
            base = Value::Object(Map::new());
        }
        if let Some(model) = cfg.model_section() {
            deep_merge(&mut base, model);
        }
        Ok(ModelConfig::new(base))
    }

    async fn restore(
        &self,
        path: &Path,
        model_cfg: &ModelConfig,
        trainer: &Trainer,
    ) -> anyhow::Result<Box<dyn PeftModel>>;

    async fn construct(
        &self,
        model_cfg: &ModelConfig,
        trainer: &Trainer,
    ) -> anyhow::Result<Box<dyn PeftModel>>;
}

/// A built model together with how it was built and its adapter.
pub struct ModelHandle {
    model: Box<dyn PeftModel>,
    source: ModelSource,
    config: ModelConfig,
    adapter: Option<AdapterConfig>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("source", &self.source)
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    pub fn new(model: Box<dyn PeftModel>, source: ModelSource, config: ModelConfig) -> Self {
        Self {
            model,
            source,
            config,
            adapter: None,
        }
    }

    /// Attach the adapter. A model takes exactly one adapter.
    pub fn attach_adapter(&mut self, adapter: AdapterConfig) -> Result<()> {
        if let Some(existing) = &self.adapter {
            return Err(LaunchError::model(
                "attach_adapter",
                anyhow::anyhow!("model already carries a {} adapter", existing.scheme().name()),
            ));
        }
        self.model
            .add_adapter(&adapter)
            .map_err(|e| LaunchError::model("attach_adapter", e))?;
        self.adapter = Some(adapter);
        Ok(())
    }

    pub fn adapter(&self) -> Option<&AdapterConfig> {
        self.adapter.as_ref()
    }

    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn model(&self) -> &dyn PeftModel {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn PeftModel {
        self.model.as_mut()
    }
}

/// Builds the trainable model for one launch.
#[derive(Debug, Clone)]
pub struct ModelInitializer {
    load_checkpoint: bool,
    base_config_path: PathBuf,
}

impl ModelInitializer {
    pub fn new(load_checkpoint: bool, base_config_path: impl Into<PathBuf>) -> Self {
        Self {
            load_checkpoint,
            base_config_path: base_config_path.into(),
        }
    }

    pub fn load_checkpoint(&self) -> bool {
        self.load_checkpoint
    }

    pub fn base_config_path(&self) -> &Path {
        &self.base_config_path
    }

    /// Build the model and attach the configured adapter.
    ///
    /// The adapter scheme is checked before the model source is chosen and
    /// before anything is loaded. Every failure is fatal; nothing is retried.
    pub async fn create_model(
        &self,
        cfg: &RunConfig,
        trainer: &Trainer,
        factory: &dyn ModelFactory,
        ctx: &RuntimeContext,
    ) -> Result<ModelHandle> {
        let scheme = lookup_scheme(cfg.peft_scheme()?)?;
        let source = ModelSource::select(self.load_checkpoint, cfg)?;

        let config_source = source.config_source(&self.base_config_path);
        debug!(source = %config_source.display(), "loading base model config");
        let base = factory
            .load_base_config(config_source)
            .await
            .map_err(|e| LaunchError::model("load_base_config", e))?;
        let model_cfg = factory
            .merge_config(base, cfg)
            .map_err(|e| LaunchError::model("merge_config", e))?;

        let model = match &source {
            ModelSource::FromCheckpoint { path } => {
                let model = factory
                    .restore(path, &model_cfg, trainer)
                    .await
                    .map_err(|e| LaunchError::model("restore", e))?;
                ctx.metrics().inc_checkpoint_restores();
                info!(path = %path.display(), "model restored from checkpoint");
                model
            }
            ModelSource::FromScratch => {
                let model = factory
                    .construct(&model_cfg, trainer)
                    .await
                    .map_err(|e| LaunchError::model("construct", e))?;
                ctx.metrics().inc_fresh_builds();
                info!("model constructed from base config");
                model
            }
        };

        let adapter = scheme.instantiate(&model_cfg)?;
        let label = source.label();
        let mut handle = ModelHandle::new(model, source, model_cfg);
        handle.attach_adapter(adapter)?;
        ctx.metrics().inc_adapters_attached();

        crate::obs::emit_model_ready(label, scheme.name());
        Ok(handle)
    }
}
