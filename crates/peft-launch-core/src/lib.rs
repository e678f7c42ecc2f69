//! PEFT Launch Core Library
//!
//! Orchestrates a single distributed parameter-efficient fine-tuning run:
//! resolve identity and configuration, assemble the trainer, build the model
//! and attach its adapter, tune the process runtime, train, and correct the
//! distributed teardown hook on the way out.
//!
//! ## Key Components
//!
//! - `config`: YAML composition, overrides and the interpolation engine
//! - `ModelInitializer`: checkpoint-restore vs fresh construction, adapter attach
//! - `construct_trainer` / `attach_reporter`: trainer assembly
//! - `RuntimeContext`: process-global toggles owned as explicit state
//! - `ShutdownGuard`: exactly-once teardown-hook cancellation
//! - `Launcher`: the launch state machine

pub mod adapter;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod fakes;
pub mod identity;
pub mod metrics;
pub mod mllog;
pub mod model;
pub mod obs;
pub mod orchestrator;
pub mod runtime;
pub mod shutdown;
pub mod telemetry;
pub mod trainer;

pub use adapter::{lookup_scheme, AdapterConfig, LoraConfig, PeftScheme, ADAPTER_REGISTRY};
pub use callbacks::{MetricsLogger, MetricsLoggerFactory, RunObserver};
pub use config::{load_run_config, resolve, ConfigError, RunConfig};
pub use error::{LaunchError, Result};
pub use identity::{load_checkpoint_toggle, parse_bool, resolve_rank, Rank};
pub use metrics::LaunchMetrics;
pub use mllog::MlLogger;
pub use model::{
    ModelConfig, ModelFactory, ModelHandle, ModelInitializer, ModelSource, PeftModel,
    BASE_CONFIG_PATH,
};
pub use obs::LaunchSpan;
pub use orchestrator::{
    plan, Collaborators, LaunchOptions, LaunchPlan, LaunchReport, LaunchState, Launcher,
};
pub use runtime::{RuntimeContext, StartMethod, StreamHandle};
pub use shutdown::{disable_default_teardown_hook, ExitHooks, ShutdownGuard, DIST_TEARDOWN_HOOK};
pub use telemetry::init_tracing;
pub use trainer::{
    attach_reporter, build_trainer, construct_trainer, LifecycleObserver, MetricsReporter,
    MetricsReporterFactory, Trainer, TrainerBuilder, TrainingEngine,
};

/// PEFT launch version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
