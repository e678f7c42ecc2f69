//! Process identity and launch toggles read from the environment.

use std::env;

use crate::error::{LaunchError, Result};

/// Environment variable holding the process's global rank.
pub const RANK_ENV: &str = "SLURM_PROCID";
/// Environment variable toggling checkpoint restore.
pub const LOAD_CKPT_ENV: &str = "LOAD_CKPT";
/// Value used when [`LOAD_CKPT_ENV`] is unset.
pub const LOAD_CKPT_DEFAULT: &str = "True";

/// Global rank of this process within the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rank(pub i64);

impl Rank {
    /// Rank 0 performs single-writer actions such as echoing the config.
    pub fn is_primary(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rank from the process environment; 0 when unset or unparsable.
pub fn resolve_rank() -> Rank {
    resolve_rank_with(|key| env::var(key).ok())
}

/// Rank from an arbitrary variable lookup.
pub fn resolve_rank_with<F>(lookup: F) -> Rank
where
    F: Fn(&str) -> Option<String>,
{
    lookup(RANK_ENV)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .map(Rank)
        .unwrap_or_default()
}

/// Strict, case-insensitive `"true"` / `"false"` parser.
pub fn parse_bool(text: &str) -> Result<bool> {
    if text.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if text.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(LaunchError::InvalidBooleanLiteral {
            value: text.to_string(),
        })
    }
}

/// Whether to restore from a checkpoint, read once at process start.
pub fn load_checkpoint_toggle() -> Result<bool> {
    load_checkpoint_toggle_with(|key| env::var(key).ok())
}

pub fn load_checkpoint_toggle_with<F>(lookup: F) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(LOAD_CKPT_ENV).unwrap_or_else(|| LOAD_CKPT_DEFAULT.to_string());
    parse_bool(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_rank_unset_is_zero() {
        assert_eq!(resolve_rank_with(env_of(&[])), Rank(0));
    }

    #[test]
    fn test_rank_from_env() {
        assert_eq!(resolve_rank_with(env_of(&[(RANK_ENV, "3")])), Rank(3));
        assert!(!Rank(3).is_primary());
        assert!(Rank(0).is_primary());
    }

    #[test]
    fn test_rank_unparsable_is_zero() {
        assert_eq!(resolve_rank_with(env_of(&[(RANK_ENV, "node-7")])), Rank(0));
        assert_eq!(resolve_rank_with(env_of(&[(RANK_ENV, "")])), Rank(0));
    }

    #[test]
    fn test_negative_rank_is_kept_and_not_primary() {
        let rank = resolve_rank_with(env_of(&[(RANK_ENV, "-1")]));
        assert_eq!(rank, Rank(-1));
        assert!(!rank.is_primary());
    }

    #[test]
    fn test_parse_bool_case_insensitive() {
        assert!(parse_bool("True").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("FaLsE").unwrap());
    }

    #[test]
    fn test_parse_bool_rejects_other_strings() {
        let err = parse_bool("maybe").unwrap_err();
        assert!(matches!(err, LaunchError::InvalidBooleanLiteral { value } if value == "maybe"));
        assert!(parse_bool("1").is_err());
        assert!(parse_bool("").is_err());
    }

    #[test]
    fn test_checkpoint_toggle_defaults_to_true() {
        assert!(load_checkpoint_toggle_with(env_of(&[])).unwrap());
        assert!(!load_checkpoint_toggle_with(env_of(&[(LOAD_CKPT_ENV, "False")])).unwrap());
        assert!(load_checkpoint_toggle_with(env_of(&[(LOAD_CKPT_ENV, "yes")])).is_err());
    }
}
