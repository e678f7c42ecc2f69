//! Adapter registry for parameter-efficient fine-tuning schemes.
//!
//! The registry is closed: `model.peft.peft_scheme` must name one of
//! [`ADAPTER_REGISTRY`]. Each scheme reads its hyper-parameters from the
//! merged model config's `peft.<scheme>_tuning` section.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LaunchError, Result};
use crate::model::ModelConfig;

/// Registered PEFT schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeftScheme {
    Lora,
    Ptuning,
    Adapter,
    Ia3,
}

/// Scheme name -> scheme, as written in `model.peft.peft_scheme`.
pub const ADAPTER_REGISTRY: [(&str, PeftScheme); 4] = [
    ("lora", PeftScheme::Lora),
    ("ptuning", PeftScheme::Ptuning),
    ("adapter", PeftScheme::Adapter),
    ("ia3", PeftScheme::Ia3),
];

/// Look up a scheme by its registry key.
pub fn lookup_scheme(name: &str) -> Result<PeftScheme> {
    ADAPTER_REGISTRY
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, scheme)| *scheme)
        .ok_or_else(|| LaunchError::UnknownAdapterScheme {
            scheme: name.to_string(),
        })
}

impl PeftScheme {
    pub fn name(self) -> &'static str {
        match self {
            PeftScheme::Lora => "lora",
            PeftScheme::Ptuning => "ptuning",
            PeftScheme::Adapter => "adapter",
            PeftScheme::Ia3 => "ia3",
        }
    }

    /// Section of `peft` holding this scheme's hyper-parameters.
    pub fn tuning_section(self) -> &'static str {
        match self {
            PeftScheme::Lora => "lora_tuning",
            PeftScheme::Ptuning => "p_tuning",
            PeftScheme::Adapter => "adapter_tuning",
            PeftScheme::Ia3 => "ia3_tuning",
        }
    }

    /// Build the adapter config from the merged model config.
    pub fn instantiate(self, model_cfg: &ModelConfig) -> Result<AdapterConfig> {
        let section = Section {
            scheme: self,
            value: model_cfg.get(&format!("peft.{}", self.tuning_section())),
        };
        let adapter = match self {
            PeftScheme::Lora => {
                let adapter_dim = section.u32_or("adapter_dim", 32)?;
                AdapterConfig::Lora(LoraConfig {
                    adapter_dim,
                    alpha: section.f64_or("alpha", f64::from(adapter_dim))?,
                    adapter_dropout: section.f64_or("adapter_dropout", 0.0)?,
                    target_modules: section
                        .strings_or("target_modules", &["attention_qkv"])?,
                    column_init_method: section.str_or("column_init_method", "xavier")?,
                    row_init_method: section.str_or("row_init_method", "zero")?,
                })
            }
            PeftScheme::Ptuning => AdapterConfig::Ptuning(PtuningConfig {
                virtual_tokens: section.u32_or("virtual_tokens", 10)?,
                bottleneck_dim: section.u32_or("bottleneck_dim", 1024)?,
                embedding_dim: section.u32_or("embedding_dim", 1024)?,
            }),
            PeftScheme::Adapter => AdapterConfig::Adapter(CanonicalAdapterConfig {
                adapter_dim: section.u32_or("adapter_dim", 32)?,
                adapter_dropout: section.f64_or("adapter_dropout", 0.0)?,
            }),
            PeftScheme::Ia3 => AdapterConfig::Ia3,
        };
        adapter.validate()?;
        Ok(adapter)
    }
}

/// Low-rank adaptation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub adapter_dim: u32,
    pub alpha: f64,
    pub adapter_dropout: f64,
    pub target_modules: Vec<String>,
    pub column_init_method: String,
    pub row_init_method: String,
}

/// Prompt-encoder (p-tuning) adaptation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtuningConfig {
    pub virtual_tokens: u32,
    pub bottleneck_dim: u32,
    pub embedding_dim: u32,
}

/// Bottleneck adapter layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalAdapterConfig {
    pub adapter_dim: u32,
    pub adapter_dropout: f64,
}

/// An instantiated adapter, ready to attach to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AdapterConfig {
    Lora(LoraConfig),
    Ptuning(PtuningConfig),
    Adapter(CanonicalAdapterConfig),
    Ia3,
}

impl AdapterConfig {
    pub fn scheme(&self) -> PeftScheme {
        match self {
            AdapterConfig::Lora(_) => PeftScheme::Lora,
            AdapterConfig::Ptuning(_) => PeftScheme::Ptuning,
            AdapterConfig::Adapter(_) => PeftScheme::Adapter,
            AdapterConfig::Ia3 => PeftScheme::Ia3,
        }
    }

    fn validate(&self) -> Result<()> {
        let check_dropout = |dropout: f64| {
            if (0.0..1.0).contains(&dropout) {
                Ok(())
            } else {
                Err(LaunchError::AdapterConfig(format!(
                    "adapter_dropout must be in [0, 1), got {dropout}"
                )))
            }
        };
        let check_dim = |name: &str, dim: u32| {
            if dim == 0 {
                Err(LaunchError::AdapterConfig(format!("{name} must be positive")))
            } else {
                Ok(())
            }
        };
        match self {
            AdapterConfig::Lora(lora) => {
                check_dim("adapter_dim", lora.adapter_dim)?;
                check_dropout(lora.adapter_dropout)?;
                if lora.target_modules.is_empty() {
                    return Err(LaunchError::AdapterConfig(
                        "target_modules must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            AdapterConfig::Ptuning(p) => {
                check_dim("virtual_tokens", p.virtual_tokens)?;
                check_dim("bottleneck_dim", p.bottleneck_dim)?;
                check_dim("embedding_dim", p.embedding_dim)
            }
            AdapterConfig::Adapter(a) => {
                check_dim("adapter_dim", a.adapter_dim)?;
                check_dropout(a.adapter_dropout)
            }
            AdapterConfig::Ia3 => Ok(()),
        }
    }
}

/// Typed reads from a scheme's tuning section with defaults.
struct Section<'a> {
    scheme: PeftScheme,
    value: Option<&'a Value>,
}

impl Section<'_> {
    fn field(&self, key: &str) -> Option<&Value> {
        self.value
            .and_then(|v| v.get(key))
            .filter(|v| !v.is_null())
    }

    fn wrong(&self, key: &str, expected: &str) -> LaunchError {
        LaunchError::AdapterConfig(format!(
            "peft.{}.{key} must be {expected}",
            self.scheme.tuning_section()
        ))
    }

    fn u32_or(&self, key: &str, default: u32) -> Result<u32> {
        match self.field(key) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| self.wrong(key, "a non-negative integer")),
        }
    }

    fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.field(key) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| self.wrong(key, "a number")),
        }
    }

    fn str_or(&self, key: &str, default: &str) -> Result<String> {
        match self.field(key) {
            None => Ok(default.to_string()),
            Some(v) => v
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| self.wrong(key, "a string")),
        }
    }

    fn strings_or(&self, key: &str, default: &[&str]) -> Result<Vec<String>> {
        match self.field(key) {
            None => Ok(default.iter().map(|s| s.to_string()).collect()),
            Some(Value::String(single)) => Ok(vec![single.clone()]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.wrong(key, "a list of strings"))
                })
                .collect(),
            Some(_) => Err(self.wrong(key, "a list of strings")),
        }
    }
}
