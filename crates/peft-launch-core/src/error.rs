//! Launch-level error taxonomy.

use crate::config::ConfigError;

/// Errors that abort a launch.
///
/// Everything up to the training call is fail-fast. [`LaunchError::Teardown`]
/// is the exception: it is only ever logged by the shutdown guard.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid boolean literal {value:?}: expected 'true' or 'false', case insensitive")]
    InvalidBooleanLiteral { value: String },

    #[error("unknown adapter scheme: {scheme}")]
    UnknownAdapterScheme { scheme: String },

    #[error("invalid adapter config: {0}")]
    AdapterConfig(String),

    #[error("model initialization failed during {stage}: {source}")]
    ModelInitialization {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("trainer assembly failed: {source}")]
    TrainerAssembly {
        #[source]
        source: anyhow::Error,
    },

    #[error("runtime tuning failed: {source}")]
    RuntimeTuning {
        #[source]
        source: anyhow::Error,
    },

    #[error("training failed: {source}")]
    Training {
        #[source]
        source: anyhow::Error,
    },

    #[error("teardown hook error: {0}")]
    Teardown(String),
}

impl LaunchError {
    pub(crate) fn model(stage: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::ModelInitialization {
            stage,
            source: source.into(),
        }
    }

    pub(crate) fn trainer(source: impl Into<anyhow::Error>) -> Self {
        Self::TrainerAssembly {
            source: source.into(),
        }
    }
}

/// Result type for launch operations.
pub type Result<T> = std::result::Result<T, LaunchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_boolean_display() {
        let err = LaunchError::InvalidBooleanLiteral {
            value: "maybe".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"maybe\""));
        assert!(msg.contains("case insensitive"));
    }

    #[test]
    fn test_model_error_keeps_stage_and_source() {
        let err = LaunchError::model("restore", anyhow::anyhow!("checkpoint shard 3 missing"));
        let msg = err.to_string();
        assert!(msg.contains("restore"));
        assert!(msg.contains("checkpoint shard 3 missing"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: LaunchError = ConfigError::NotFound("trainer.precision".to_string()).into();
        assert!(matches!(err, LaunchError::Config(_)));
        assert!(err.to_string().contains("trainer.precision"));
    }
}
