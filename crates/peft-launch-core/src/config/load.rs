//! Loading and composing raw config trees from YAML files.
//!
//! A primary file may list other files under `defaults:`:
//!
//! ```yaml
//! defaults:
//!   - base_trainer          # <dir>/base_trainer.yaml, merged at the root
//!   - model: llama2_70b     # <dir>/model/llama2_70b.yaml, merged under `model`
//!   - _self_                # position of this file's own keys (default: last)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use super::error::{ConfigError, ConfigResult};
use super::expr::parse_scalar;
use super::tree::{deep_merge, set_path};

const DEFAULTS_KEY: &str = "defaults";
const SELF_ENTRY: &str = "_self_";

/// Read a single YAML file into a raw tree.
pub fn load_yaml(path: &Path) -> ConfigResult<Value> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let value: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })?;
    Ok(match value {
        Value::Null => Value::Object(Map::new()),
        other => other,
    })
}

/// Compose `<config_dir>/<config_name>.yaml` with its `defaults` list.
pub fn compose(config_dir: &Path, config_name: &str) -> ConfigResult<Value> {
    let mut stack = Vec::new();
    compose_file(config_dir, &config_file(config_dir, config_name), &mut stack)
}

fn config_file(dir: &Path, name: &str) -> PathBuf {
    let name = name.strip_suffix(".yaml").unwrap_or(name);
    dir.join(format!("{name}.yaml"))
}

fn compose_file(dir: &Path, file: &Path, stack: &mut Vec<PathBuf>) -> ConfigResult<Value> {
    if stack.iter().any(|seen| seen == file) {
        return Err(ConfigError::Cycle {
            key: file.display().to_string(),
        });
    }
    stack.push(file.to_path_buf());
    debug!(file = %file.display(), "loading config file");

    let mut own = load_yaml(file)?;
    let defaults = match own.as_object_mut() {
        Some(map) => map.remove(DEFAULTS_KEY),
        None => None,
    };

    let mut composed = Value::Object(Map::new());
    let mut self_merged = false;
    for entry in defaults_entries(defaults, file)? {
        match entry {
            DefaultsEntry::SelfKeys => {
                deep_merge(&mut composed, &own);
                self_merged = true;
            }
            DefaultsEntry::Root(name) => {
                let sub = compose_file(dir, &config_file(dir, &name), stack)?;
                deep_merge(&mut composed, &sub);
            }
            DefaultsEntry::Group { group, option } => {
                let group_dir = dir.join(&group);
                let sub = compose_file(&group_dir, &config_file(&group_dir, &option), stack)?;
                let mut wrapped = Value::Object(Map::new());
                set_path(&mut wrapped, &group, sub)?;
                deep_merge(&mut composed, &wrapped);
            }
        }
    }
    if !self_merged {
        deep_merge(&mut composed, &own);
    }

    stack.pop();
    Ok(composed)
}

enum DefaultsEntry {
    SelfKeys,
    Root(String),
    Group { group: String, option: String },
}

fn defaults_entries(defaults: Option<Value>, file: &Path) -> ConfigResult<Vec<DefaultsEntry>> {
    let invalid = |detail: &str| ConfigError::Parse {
        expr: DEFAULTS_KEY.to_string(),
        reason: format!("{detail} in {}", file.display()),
    };
    let items = match defaults {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(invalid("`defaults` must be a list")),
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(name) if name == SELF_ENTRY => Ok(DefaultsEntry::SelfKeys),
            Value::String(name) => Ok(DefaultsEntry::Root(name)),
            Value::Object(map) if map.len() == 1 => {
                let (group, option) = map.into_iter().next().ok_or_else(|| invalid("empty entry"))?;
                match option {
                    Value::String(option) => Ok(DefaultsEntry::Group { group, option }),
                    _ => Err(invalid("group option must be a string")),
                }
            }
            _ => Err(invalid("unsupported `defaults` entry")),
        })
        .collect()
}

/// Parse `dotted.key=value`; the value is read as a YAML scalar.
pub fn parse_override(raw: &str) -> ConfigResult<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride(raw.to_string()))?;
    let key = key.trim().trim_start_matches('+');
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(ConfigError::InvalidOverride(raw.to_string()));
    }
    Ok((key.to_string(), parse_scalar(value.trim())))
}

/// Apply command-line overrides to a composed raw tree, in order.
pub fn apply_overrides(tree: &mut Value, overrides: &[String]) -> ConfigResult<()> {
    for raw in overrides {
        let (key, value) = parse_override(raw)?;
        debug!(key = %key, "applying config override");
        set_path(tree, &key, value)?;
    }
    Ok(())
}
