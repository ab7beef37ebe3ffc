//! Tracing subscriber setup.
//!
//! Logs go to stderr so that `--json` output on stdout stays parseable.
//! `KH_LOG` (an `EnvFilter` directive string) overrides `[logging].level`.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Environment variable holding filter directives, e.g. `kh=debug,sqlx=warn`.
pub const LOG_ENV: &str = "KH_LOG";

fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(format!("{},sqlx=warn", config.level)),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    let layer = if config.format == "json" {
        layer.json().boxed()
    } else {
        layer.boxed()
    };

    tracing_subscriber::registry()
        .with(build_env_filter(config))
        .with(layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}
