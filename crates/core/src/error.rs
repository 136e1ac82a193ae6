//! Domain error model.

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only (validation, invariants, illegal
/// transitions). Storage failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input, rejected before anything is written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Stale version / optimistic concurrency.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The action is not legal from the current status.
    #[error("cannot {action} {entity} in status '{from}'")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    /// Not enough stock to satisfy the request. Nothing was allocated.
    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory {
        requested: Decimal,
        available: Decimal,
    },

    /// No applicable configuration (e.g. movement reason).
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn transition(
        entity: &'static str,
        from: impl core::fmt::Display,
        action: &'static str,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: from.to_string(),
            action,
        }
    }

    pub fn insufficient(requested: Decimal, available: Decimal) -> Self {
        Self::InsufficientInventory {
            requested,
            available,
        }
    }

    pub fn configuration_missing(msg: impl Into<String>) -> Self {
        Self::ConfigurationMissing(msg.into())
    }
}
