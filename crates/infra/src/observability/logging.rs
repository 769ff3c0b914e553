//! Tracing subscriber initialisation
//!
//! `RUST_LOG` controls the filter (default: `info`). Key material is never
//! logged by this crate, so either format is safe to ship off-host.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Single-line human readable output
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" | "pretty" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("Invalid log format: '{}' (expected compact or json)", other)),
        }
    }
}

impl LogFormat {
    /// Format named by `LOG_FORMAT`, falling back to compact
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT").ok().and_then(|v| v.parse().ok()).unwrap_or_default()
    }
}

/// Install the global subscriber
///
/// Returns `false` when a subscriber was already installed; the earlier one
/// stays in effect.
pub fn init_logging(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Compact => {
            tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().try_init()
        }
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init(),
    };

    match result {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(error = %err, "Tracing subscriber already installed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for observability::logging.
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_double_init_is_not_an_error() {
        init_logging(LogFormat::Compact);
        assert!(!init_logging(LogFormat::Json));
    }
}
