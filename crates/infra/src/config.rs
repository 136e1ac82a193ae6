//! Configuration loading and representation.
//!
//! Read from the process environment (`STOCKLEDGER_*`, `DATABASE_URL`). Every
//! knob has a default so an empty environment yields a usable in-memory setup.

use rust_decimal::Decimal;
use thiserror::Error;

use stockledger_closing::DEFAULT_DISCREPANCY_TOLERANCE;
use stockledger_observability::LogFormat;
use stockledger_inventory::{RotationPolicy, RotationStrategy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid value for {key}: {message}")]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Postgres connection string; `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Extra attempts after a concurrency conflict before giving up.
    pub max_conflict_retries: u32,
    pub discrepancy_tolerance: Decimal,
    /// Products per page when a closure enumerates period activity.
    pub closure_page_size: u32,
    pub default_rotation: RotationStrategy,
    pub log_json: bool,
    pub log_filter: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_conflict_retries: 3,
            discrepancy_tolerance: DEFAULT_DISCREPANCY_TOLERANCE,
            closure_page_size: 100,
            default_rotation: RotationStrategy::Fifo,
            log_json: true,
            log_filter: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_conflict_retries = match get("STOCKLEDGER_MAX_CONFLICT_RETRIES") {
            Some(v) => parse("STOCKLEDGER_MAX_CONFLICT_RETRIES", &v)?,
            None => defaults.max_conflict_retries,
        };
        let discrepancy_tolerance = match get("STOCKLEDGER_DISCREPANCY_TOLERANCE") {
            Some(v) => parse::<Decimal>("STOCKLEDGER_DISCREPANCY_TOLERANCE", &v)?,
            None => defaults.discrepancy_tolerance,
        };
        if discrepancy_tolerance < Decimal::ZERO {
            return Err(ConfigError {
                key: "STOCKLEDGER_DISCREPANCY_TOLERANCE",
                message: "must not be negative".to_string(),
            });
        }
        let closure_page_size = match get("STOCKLEDGER_CLOSURE_PAGE_SIZE") {
            Some(v) => parse::<u32>("STOCKLEDGER_CLOSURE_PAGE_SIZE", &v)?,
            None => defaults.closure_page_size,
        };
        if closure_page_size == 0 {
            return Err(ConfigError {
                key: "STOCKLEDGER_CLOSURE_PAGE_SIZE",
                message: "must be at least 1".to_string(),
            });
        }
        let default_rotation = match get("STOCKLEDGER_DEFAULT_ROTATION") {
            Some(v) => v.parse().map_err(|e: stockledger_core::DomainError| ConfigError {
                key: "STOCKLEDGER_DEFAULT_ROTATION",
                message: e.to_string(),
            })?,
            None => defaults.default_rotation,
        };
        let log_json = match get("STOCKLEDGER_LOG_FORMAT").as_deref().map(str::trim) {
            Some("json") | None => true,
            Some("pretty") | Some("text") => false,
            Some(other) => {
                return Err(ConfigError {
                    key: "STOCKLEDGER_LOG_FORMAT",
                    message: format!("expected json or pretty, got '{other}'"),
                });
            }
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            max_conflict_retries,
            discrepancy_tolerance,
            closure_page_size,
            default_rotation,
            log_json,
            log_filter: get("STOCKLEDGER_LOG").unwrap_or(defaults.log_filter),
        })
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy::new(self.default_rotation)
    }

    /// Install the process-wide subscriber for `log_json` and `log_filter`.
    /// Returns `Ok(false)` if one was already installed.
    pub fn init_tracing(&self) -> Result<bool, ConfigError> {
        stockledger_observability::init_with(LogFormat::from_json_flag(self.log_json), &self.log_filter)
            .map_err(|e| ConfigError {
                key: "STOCKLEDGER_LOG",
                message: e.to_string(),
            })
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError {
        key,
        message: e.to_string(),
    })
}
