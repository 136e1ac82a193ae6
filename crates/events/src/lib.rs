//! `stockledger-events`: event contracts and in-process distribution.
//!
//! Committed ledger, document and closure events are wrapped in
//! [`EventEnvelope`]s and published on an [`EventBus`] *after* the unit of work
//! that produced them commits. Notification and audit collaborators subscribe
//! to the bus; they never take part in the transaction.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod scope;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use scope::CompanyScoped;
