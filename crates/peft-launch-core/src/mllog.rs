//! Benchmark-style key/value event logging.
//!
//! [`MlLogger`] is the logging handle handed to lifecycle observers and
//! metrics reporters. Events go through `tracing` on target [`MLLOG_TARGET`]
//! and only rank 0 emits them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::identity::Rank;

/// Tracing target for benchmark events.
pub const MLLOG_TARGET: &str = "mllog";

/// Well-known event keys.
pub mod keys {
    pub const INIT_START: &str = "init_start";
    pub const INIT_STOP: &str = "init_stop";
    pub const RUN_START: &str = "run_start";
    pub const RUN_STOP: &str = "run_stop";
    pub const BLOCK_START: &str = "block_start";
    pub const BLOCK_STOP: &str = "block_stop";
    pub const EVAL_ACCURACY: &str = "eval_accuracy";
    pub const TRAIN_LOSS: &str = "train_loss";
    pub const GLOBAL_BATCH_SIZE: &str = "global_batch_size";
    pub const MAX_STEPS: &str = "max_steps";
    pub const SEED: &str = "seed";
    pub const PEFT_SCHEME: &str = "peft_scheme";
    pub const LORA_RANK: &str = "lora_rank";
    pub const LORA_ALPHA: &str = "lora_alpha";
}

/// Kind of a benchmark event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Point,
    IntervalStart,
    IntervalEnd,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::Point => "POINT_IN_TIME",
            EventType::IntervalStart => "INTERVAL_START",
            EventType::IntervalEnd => "INTERVAL_END",
        }
    }
}

/// Rank-aware benchmark logger.
#[derive(Debug)]
pub struct MlLogger {
    rank: Rank,
    emitted: AtomicU64,
}

impl MlLogger {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            emitted: AtomicU64::new(0),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of events this process actually emitted.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn event(&self, key: &str, value: Value, metadata: Value) -> bool {
        self.emit(EventType::Point, key, value, metadata)
    }

    pub fn start(&self, key: &str, metadata: Value) -> bool {
        self.emit(EventType::IntervalStart, key, Value::Null, metadata)
    }

    pub fn end(&self, key: &str, metadata: Value) -> bool {
        self.emit(EventType::IntervalEnd, key, Value::Null, metadata)
    }

    fn emit(&self, event_type: EventType, key: &str, value: Value, metadata: Value) -> bool {
        if !self.rank.is_primary() {
            return false;
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: MLLOG_TARGET,
            event_type = event_type.as_str(),
            key = key,
            value = %value,
            metadata = %metadata,
            time_ms = chrono::Utc::now().timestamp_millis(),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primary_rank_emits() {
        let logger = MlLogger::new(Rank(0));
        assert!(logger.start(keys::RUN_START, json!({})));
        assert!(logger.event(keys::TRAIN_LOSS, json!(1.25), json!({"step": 10})));
        assert!(logger.end(keys::RUN_STOP, json!({"status": "success"})));
        assert_eq!(logger.emitted(), 3);
    }

    #[test]
    fn test_other_ranks_are_silent() {
        let logger = MlLogger::new(Rank(5));
        assert!(!logger.event(keys::SEED, json!(1234), json!({})));
        assert_eq!(logger.emitted(), 0);
    }
}
