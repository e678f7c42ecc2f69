//! Error types for config composition and resolution.

/// Errors produced while loading, composing or resolving a config tree.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown operator `{name}` in expression at {path}")]
    UnknownOperator { name: String, path: String },

    #[error("operator `{op}` expects {expected} arguments, got {actual} (at {path})")]
    Arity {
        op: &'static str,
        expected: usize,
        actual: usize,
        path: String,
    },

    #[error("interpolation at {path} references missing key `{key}`")]
    MissingKey { key: String, path: String },

    #[error("operator `{op}` cannot combine {detail} (at {path})")]
    TypeMismatch {
        op: &'static str,
        detail: String,
        path: String,
    },

    #[error("division by zero in `floor_div` at {path}")]
    DivisionByZero { path: String },

    #[error("interpolation cycle through `{key}`")]
    Cycle { key: String },

    #[error("cannot parse expression `{expr}`: {reason}")]
    Parse { expr: String, reason: String },

    #[error("config key not found: {0}")]
    NotFound(String),

    #[error("config key {path} is not a {expected}")]
    WrongType { path: String, expected: &'static str },

    #[error("invalid override `{0}`: expected dotted.key=value")]
    InvalidOverride(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Result type for config operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
