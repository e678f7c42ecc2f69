//! The resolved run configuration and dotted-path helpers.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::error::{ConfigError, ConfigResult};

/// Key of the adapter scheme in the run config.
pub const PEFT_SCHEME_KEY: &str = "model.peft.peft_scheme";
/// Key of the checkpoint location in the run config.
pub const RESTORE_PATH_KEY: &str = "model.restore_from_path";
/// Key of the trainer precision in the run config.
pub const PRECISION_KEY: &str = "trainer.precision";

/// Fully resolved configuration snapshot.
///
/// Only produced by [`super::resolve`], so every interpolation has already
/// been evaluated. Components receive `&RunConfig`; the trainer assembly step
/// is the only writer, and only for [`PRECISION_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RunConfig {
    tree: Value,
}

impl RunConfig {
    pub(crate) fn from_resolved(tree: Value) -> Self {
        Self { tree }
    }

    /// Borrow the whole resolved tree.
    pub fn as_value(&self) -> &Value {
        &self.tree
    }

    pub fn into_value(self) -> Value {
        self.tree
    }

    /// Look up a dotted path (`model.peft.peft_scheme`, `data.files.0`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.tree, path)
    }

    /// Look up a dotted path, failing when it is absent.
    pub fn require(&self, path: &str) -> ConfigResult<&Value> {
        self.get(path)
            .ok_or_else(|| ConfigError::NotFound(path.to_string()))
    }

    pub fn str_at(&self, path: &str) -> ConfigResult<&str> {
        self.require(path)?
            .as_str()
            .ok_or_else(|| ConfigError::WrongType {
                path: path.to_string(),
                expected: "string",
            })
    }

    pub fn i64_at(&self, path: &str) -> ConfigResult<i64> {
        self.require(path)?
            .as_i64()
            .ok_or_else(|| ConfigError::WrongType {
                path: path.to_string(),
                expected: "integer",
            })
    }

    /// Adapter scheme name, the key into the adapter registry.
    pub fn peft_scheme(&self) -> ConfigResult<&str> {
        self.str_at(PEFT_SCHEME_KEY)
    }

    /// Externally supplied checkpoint location, if any.
    pub fn restore_from_path(&self) -> Option<&str> {
        self.get(RESTORE_PATH_KEY).and_then(Value::as_str)
    }

    /// `trainer.precision` as configured (e.g. `"bf16"`, `16`).
    pub fn precision(&self) -> Option<&Value> {
        self.get(PRECISION_KEY)
    }

    pub fn set_precision(&mut self, precision: Value) -> ConfigResult<()> {
        set_path(&mut self.tree, PRECISION_KEY, precision)
    }

    /// The `model` section, which is merged into the model's base config.
    pub fn model_section(&self) -> Option<&Value> {
        self.get("model")
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        serde_yaml::to_string(&self.tree).map_err(|source| ConfigError::Yaml {
            path: "<resolved>".to_string(),
            source,
        })
    }

    /// SHA-256 hex digest of the canonical JSON rendering.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.tree).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

/// Join a parent path and a child segment.
pub(crate) fn child_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}.{segment}")
    }
}

/// Walk a dotted path through mappings and (by numeric index) sequences.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set a dotted path, creating intermediate mappings as needed.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> ConfigResult<()> {
    if path.is_empty() {
        return Err(ConfigError::InvalidOverride(path.to_string()));
    }
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| ConfigError::InvalidOverride(path.to_string()))?;

    let mut node = root;
    for segment in parents {
        if segment.is_empty() {
            return Err(ConfigError::InvalidOverride(path.to_string()));
        }
        node = match node {
            Value::Array(items) => {
                let index = segment
                    .parse::<usize>()
                    .map_err(|_| ConfigError::NotFound(path.to_string()))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| ConfigError::NotFound(path.to_string()))?
            }
            other => {
                if !other.is_object() {
                    *other = Value::Object(Map::new());
                }
                match other {
                    Value::Object(map) => map
                        .entry(segment.to_string())
                        .or_insert_with(|| Value::Object(Map::new())),
                    _ => unreachable!("replaced with an object above"),
                }
            }
        };
    }

    match node {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| ConfigError::NotFound(path.to_string()))?;
            *slot = value;
            Ok(())
        }
        other => {
            let mut map = Map::new();
            map.insert(last.to_string(), value);
            *other = Value::Object(map);
            Ok(())
        }
    }
}

/// Merge `overlay` into `base`: mappings merge recursively, everything else
/// in `overlay` replaces what `base` had.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RunConfig {
        RunConfig::from_resolved(json!({
            "trainer": {"precision": "bf16", "devices": 8},
            "model": {
                "restore_from_path": "/ckpt/llama2-70b",
                "peft": {"peft_scheme": "lora"},
                "data": {"files": ["a.npy", "b.npy"]},
            }
        }))
    }

    #[test]
    fn test_typed_accessors() {
        let cfg = sample();
        assert_eq!(cfg.peft_scheme().unwrap(), "lora");
        assert_eq!(cfg.restore_from_path(), Some("/ckpt/llama2-70b"));
        assert_eq!(cfg.precision(), Some(&json!("bf16")));
        assert_eq!(cfg.i64_at("trainer.devices").unwrap(), 8);
        assert_eq!(cfg.str_at("model.data.files.1").unwrap(), "b.npy");
    }

    #[test]
    fn test_wrong_type_and_missing() {
        let cfg = sample();
        assert!(matches!(
            cfg.str_at("trainer.devices"),
            Err(ConfigError::WrongType { .. })
        ));
        assert!(matches!(
            cfg.require("trainer.max_steps"),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_precision_round_trip() {
        let mut cfg = sample();
        cfg.set_precision(json!(16)).unwrap();
        assert_eq!(cfg.precision(), Some(&json!(16)));
    }

    #[test]
    fn test_set_path_creates_parents() {
        let mut tree = json!({});
        set_path(&mut tree, "exp_manager.explicit_log_dir", json!("/results")).unwrap();
        assert_eq!(tree, json!({"exp_manager": {"explicit_log_dir": "/results"}}));
    }

    #[test]
    fn test_set_path_rejects_empty_segment() {
        let mut tree = json!({});
        assert!(set_path(&mut tree, "a..b", json!(1)).is_err());
        assert!(set_path(&mut tree, "", json!(1)).is_err());
    }

    #[test]
    fn test_deep_merge_overlay_wins() {
        let mut base = json!({
            "hidden_size": 8192,
            "peft": {"lora_tuning": {"adapter_dim": 8, "alpha": 8}},
            "layers": [1, 2, 3],
        });
        let overlay = json!({
            "peft": {"lora_tuning": {"adapter_dim": 16}},
            "layers": [4],
            "micro_batch_size": 1,
        });
        deep_merge(&mut base, &overlay);
        assert_eq!(
            base,
            json!({
                "hidden_size": 8192,
                "peft": {"lora_tuning": {"adapter_dim": 16, "alpha": 8}},
                "layers": [4],
                "micro_batch_size": 1,
            })
        );
    }

    #[test]
    fn test_digest_is_stable() {
        let a = sample();
        let b = sample();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let mut c = sample();
        c.set_precision(json!("fp16")).unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_to_yaml_contains_keys() {
        let yaml = sample().to_yaml().unwrap();
        assert!(yaml.contains("peft_scheme: lora"));
    }
}
