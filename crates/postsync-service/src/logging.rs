//! Tracing subscriber setup.

use clap::ValueEnum;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info` level.
///
/// Returns `false` when a subscriber was already installed.
pub fn init(format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));

    match format {
        LogFormat::Json => fmt().json().with_env_filter(filter).try_init().is_ok(),
        LogFormat::Pretty => fmt().with_env_filter(filter).try_init().is_ok(),
    }
}
