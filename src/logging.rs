//! Tracing initialisation.
//!
//! `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=daq_macroserver::scan=debug` narrows output to the scan engine.

use crate::config::Settings;
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber at `level` unless `RUST_LOG` is set.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("invalid log filter '{}': {}", level, e))?;

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

/// Initialise tracing from the application settings.
pub fn init_from_settings(settings: &Settings) -> Result<()> {
    init(&settings.application.log_level)
}
