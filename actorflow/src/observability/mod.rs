//! Logging initialisation and span constructors.
//!
//! Every component logs through `tracing` with a small set of shared field
//! names (`identity`, `operation`, `message_id`, `attempt`, `step`) so log
//! lines from the gateway, the orchestrator and the bridge line up.

use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::registry::UnitIdentity;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable multi-line output.
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Installs the global subscriber.
///
/// Filtering follows `RUST_LOG` and defaults to `info`. Only the first
/// call has any effect.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
        if let Err(e) = result {
            // Another subscriber was installed first; keep it.
            tracing::debug!(error = %e, "global subscriber already set");
        }
    });
}

/// Span around one call on one unit.
#[must_use]
pub fn unit_span(identity: &UnitIdentity, operation: &str) -> Span {
    tracing::info_span!(
        "unit_call",
        identity = %identity.short(),
        operation = operation,
    )
}

/// Span around one delivery attempt of a queue message.
#[must_use]
pub fn bridge_span(message_id: &str, attempt: u32) -> Span {
    tracing::info_span!("bridge_message", message_id = message_id, attempt = attempt)
}

/// Span around one pipeline run.
#[must_use]
pub fn pipeline_span(identity: &UnitIdentity) -> Span {
    tracing::info_span!("pipeline_run", identity = %identity.short())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_idempotent() {
        init_logging(LogFormat::Json);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn test_spans_enter() {
        let identity = UnitIdentity::derive("counter", "c1", None);
        let _unit = unit_span(&identity, "increment").entered();
        let _bridge = bridge_span("m1", 2).entered();
        let _pipeline = pipeline_span(&identity).entered();
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
