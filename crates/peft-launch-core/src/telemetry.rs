//! Centralised tracing initialisation for launcher binaries.
//!
//! Call [`init_tracing`] once at program start to configure the global
//! subscriber with an `EnvFilter`, a message filter for known-noisy lines and
//! optional JSON formatting. Later calls are silently ignored.

use std::fmt::Debug;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Target used by the distributed-communication collaborator.
pub const DISTRIBUTED_TARGET: &str = "distributed";
/// Target used by attention kernels.
pub const ATTENTION_TARGET: &str = "attention";

/// Messages containing any of these are dropped.
pub const IGNORED_MESSAGES: &[&str] = &["running build_ext"];

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_directives(level: Level) -> String {
    format!(
        "{},{DISTRIBUTED_TARGET}=warn,{ATTENTION_TARGET}=warn",
        level.as_str().to_ascii_lowercase()
    )
}

/// Whether a log message matches one of [`IGNORED_MESSAGES`].
pub fn is_ignored(message: &str) -> bool {
    IGNORED_MESSAGES
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Initialise the global tracing subscriber.
///
/// * `json`: when `true`, emit newline-delimited JSON log lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(IgnoreMessages)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(IgnoreMessages)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// Layer that disables events whose message matches [`IGNORED_MESSAGES`].
struct IgnoreMessages;

impl<S: Subscriber> Layer<S> for IgnoreMessages {
    fn event_enabled(&self, event: &Event<'_>, _ctx: Context<'_, S>) -> bool {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        !is_ignored(&visitor.message)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_quiet_collaborators() {
        let directives = default_directives(Level::INFO);
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("distributed=warn"));
        assert!(directives.contains("attention=warn"));
        EnvFilter::try_new(&directives).expect("directives parse");
    }

    #[test]
    fn test_ignored_messages() {
        assert!(is_ignored("running build_ext for fused kernels"));
        assert!(!is_ignored("model ready"));
    }
}
