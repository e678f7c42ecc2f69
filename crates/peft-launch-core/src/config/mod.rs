//! Config resolution engine.
//!
//! Raw trees come from YAML files (optionally composed through `defaults`)
//! plus command-line overrides. [`resolve`] evaluates every interpolation in
//! one global pass and returns an immutable [`RunConfig`] snapshot; nothing
//! downstream ever sees an unresolved expression.

pub mod error;
pub mod expr;
pub mod load;
pub mod resolve;
pub mod tree;

pub use error::{ConfigError, ConfigResult};
pub use expr::{Operator, OPERATORS};
pub use load::{apply_overrides, compose, load_yaml, parse_override};
pub use resolve::resolve;
pub use tree::{deep_merge, lookup, RunConfig, PEFT_SCHEME_KEY, PRECISION_KEY, RESTORE_PATH_KEY};

use serde_json::Value;
use std::path::Path;

/// Compose, override and resolve in one call.
pub fn load_run_config(
    config_dir: &Path,
    config_name: &str,
    overrides: &[String],
) -> ConfigResult<RunConfig> {
    let mut raw: Value = compose(config_dir, config_name)?;
    apply_overrides(&mut raw, overrides)?;
    resolve(&raw)
}
