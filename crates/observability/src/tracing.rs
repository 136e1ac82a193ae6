//! Tracing/logging initialization.
//!
//! JSON lines by default, human-readable output on request. The level filter
//! follows `RUST_LOG` when [`init`] is used, or an explicit directive string
//! with [`init_with`].

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json { LogFormat::Json } else { LogFormat::Pretty }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },
}

/// Initialize tracing/logging for the process from `RUST_LOG` (default `info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install(LogFormat::Json, filter);
}

/// Initialize with an explicit format and filter directive.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init_with(format: LogFormat, filter: &str) -> Result<bool, InitError> {
    let filter = parse_filter(filter)?;
    Ok(install(format, filter))
}

fn parse_filter(filter: &str) -> Result<EnvFilter, InitError> {
    EnvFilter::try_new(filter).map_err(|e| InitError::InvalidFilter {
        filter: filter.to_string(),
        message: e.to_string(),
    })
}

fn install(format: LogFormat, filter: EnvFilter) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);
    match format {
        LogFormat::Json => builder.json().with_target(true).try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}
