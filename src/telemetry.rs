//! Tracing subscriber setup for the binary

use clap::ValueEnum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,vice=debug,kube=info,tower=warn,hyper=warn";

/// Log line format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Call once, from `main`.
pub fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(env_filter());
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_formats_parse_from_cli_names() {
        assert_eq!(LogFormat::from_str("json", true).unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("text", true).unwrap(), LogFormat::Text);
        assert!(LogFormat::from_str("xml", true).is_err());
    }
}
