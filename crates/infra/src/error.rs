//! Infrastructure error model.
//!
//! `StoreError` is what a backend reports; `LedgerError` is what callers of
//! the ledger, workflows and closure engine see.

use rust_decimal::Decimal;
use thiserror::Error;

use stockledger_core::DomainError;

/// Storage operation error.
///
/// | Backend condition | Variant |
/// |---|---|
/// | stale row version, unique violation (`23505`) | `Conflict` |
/// | row expected but absent | `NotFound` |
/// | JSON body could not be (de)serialized | `Serialization` |
/// | anything else (pool, network, SQL) | `Backend` |
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory {
        requested: Decimal,
        available: Decimal,
    },

    #[error("cannot {action} {entity} in status '{from}'")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Lost an optimistic race; the whole unit of work may be retried.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(StoreError),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict(_))
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => LedgerError::Validation(msg),
            DomainError::InvariantViolation(msg) => {
                LedgerError::Validation(format!("invariant violated: {msg}"))
            }
            DomainError::NotFound(what) => LedgerError::NotFound(what),
            DomainError::Conflict(msg) => LedgerError::ConcurrencyConflict(msg),
            DomainError::InvalidStateTransition {
                entity,
                from,
                action,
            } => LedgerError::InvalidStateTransition {
                entity,
                from,
                action,
            },
            DomainError::InsufficientInventory {
                requested,
                available,
            } => LedgerError::InsufficientInventory {
                requested,
                available,
            },
            DomainError::ConfigurationMissing(msg) => LedgerError::ConfigurationMissing(msg),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => LedgerError::ConcurrencyConflict(msg),
            StoreError::NotFound(what) => LedgerError::NotFound(what),
            other => LedgerError::Store(other),
        }
    }
}
