//! Document workflows that move stock (event-sourced).
//!
//! Purchases, dispatches, donations, adjustments and transfers, implemented
//! purely as deterministic domain logic (no IO, no storage). Fulfilling
//! transitions emit events that the infrastructure layer turns into ledger
//! movements inside one unit of work.

pub mod adjustment;
pub mod common;
pub mod dispatch;
pub mod donation;
pub mod purchase;
pub mod transfer;

pub use adjustment::{
    AdjustmentAction, AdjustmentChange, AdjustmentCommand, AdjustmentEvent, AdjustmentLine,
    AdjustmentLineInput, AdjustmentStatus, InventoryAdjustment,
};
pub use common::{
    Document, DocumentChange, DocumentCommand, DocumentEvent, DocumentKind, DocumentState,
    MovementLink, StatusChange,
};
pub use dispatch::{
    Dispatch, DispatchAction, DispatchChange, DispatchCommand, DispatchEvent, DispatchLine,
    DispatchLineInput, DispatchStatus,
};
pub use donation::{
    Donation, DonationAction, DonationChange, DonationCommand, DonationEvent, DonationLine,
    DonationLineInput, DonationStatus,
};
pub use purchase::{
    Purchase, PurchaseAction, PurchaseChange, PurchaseCommand, PurchaseEvent, PurchaseLine,
    PurchaseLineInput, PurchaseStatus,
};
pub use transfer::{
    InventoryTransfer, LineDiscrepancy, ReceiptLeg, ShipmentLine, ShippedQuantity, TransferAction,
    TransferChange, TransferCommand, TransferEvent, TransferLeg, TransferLine, TransferLineInput,
    TransferStatus,
};
