//! Infrastructure layer: the stock ledger's persistence, workflows and
//! service entry point.
//!
//! Domain crates stay pure; everything that touches a unit of work lives here.

pub mod closure_engine;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lots;
pub mod retry;
pub mod service;
pub mod sinks;
pub mod store;
pub mod workflows;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, LedgerConfig};
pub use error::{LedgerError, StoreError};
pub use lots::{LotIntake, ReceivedLot};
pub use service::{ClosureView, DocumentAction, DocumentOutcome, DocumentView, InventoryService};
pub use sinks::{AuditSink, NotificationSink, SinkError, SinkWorker, Sinks, WorkerHandle};
pub use store::{
    InMemoryInventoryStore, InventoryStore, MovementFilter, Page, Pagination,
    PostgresInventoryStore, StockKey, UnitOfWork,
};
pub use workflows::LineMovement;
