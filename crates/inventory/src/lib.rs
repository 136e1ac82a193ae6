//! Inventory domain module.
//!
//! Lots, rotation, ledger entries, balances, snapshots and movement reasons,
//! implemented purely as deterministic domain logic (no IO, no storage).

pub mod balance;
pub mod events;
pub mod lot;
pub mod movement;
pub mod reason;
pub mod rotation;
pub mod snapshot;

pub use balance::{ChainBreak, ChainReport, StockBalance, verify_chain};
pub use events::{
    LedgerEvent, LotStatusChanged, MovementPosted, MovementRecorded, MovementStatusChanged,
    QualityCheckRecorded, StockReservationChanged,
};
pub use lot::{LotReceipt, LotStatus, ProductLot};
pub use movement::{
    InventoryMovement, MovementCategory, MovementStatus, MovementTerms, MovementType,
    NewMovement, Provenance, QualityCheck,
};
pub use reason::{MovementReason, ReasonCatalog, RequiredField};
pub use rotation::{LotAllocation, RotationPolicy, RotationStrategy, order_candidates, select_lots};
pub use snapshot::InventorySnapshot;
