//! `stockledger-core`: shared domain building blocks.
//!
//! Pure domain primitives only (no infrastructure concerns): identifiers,
//! the domain error model, aggregate traits, audit stamps and periods.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod period;
pub mod stamp;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion, execute};
pub use error::{DomainError, DomainResult};
pub use id::{
    ActorId, ClosureId, CompanyId, DocumentId, LotId, MovementId, ProductId, SupplierId,
    TransferCorrelationId, WarehouseId,
};
pub use period::Period;
pub use stamp::Stamp;
