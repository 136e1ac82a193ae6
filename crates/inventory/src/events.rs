//! Events emitted by the ledger and the lot registry.
//!
//! Published on the bus after the unit of work commits.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    ActorId, CompanyId, LotId, MovementId, ProductId, TransferCorrelationId, WarehouseId,
};
use stockledger_events::Event;

use crate::lot::LotStatus;
use crate::movement::{InventoryMovement, MovementStatus, MovementType, QualityCheck};

/// Event: MovementRecorded (entry created, possibly waiting for review).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecorded {
    pub company_id: CompanyId,
    pub movement_id: MovementId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub lot_id: Option<LotId>,
    pub movement_type: MovementType,
    pub reason_code: String,
    pub quantity: Decimal,
    pub total_cost: Decimal,
    pub status: MovementStatus,
    pub transfer_correlation_id: Option<TransferCorrelationId>,
    pub actor_id: ActorId,
    pub occurred_at: DateTime<Utc>,
}

impl MovementRecorded {
    pub fn of(movement: &InventoryMovement) -> Self {
        Self {
            company_id: movement.company_id,
            movement_id: movement.id,
            product_id: movement.product_id,
            warehouse_id: movement.warehouse_id,
            lot_id: movement.lot_id,
            movement_type: movement.movement_type,
            reason_code: movement.reason_code.clone(),
            quantity: movement.quantity(),
            total_cost: movement.total_cost,
            status: movement.status,
            transfer_correlation_id: movement.transfer_correlation_id,
            actor_id: movement.created.actor_id,
            occurred_at: movement.created.at,
        }
    }
}

/// Event: MovementStatusChanged (approved, rejected or cancelled).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementStatusChanged {
    pub company_id: CompanyId,
    pub movement_id: MovementId,
    pub status: MovementStatus,
    pub actor_id: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: MovementPosted (completed; the balance moved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementPosted {
    pub company_id: CompanyId,
    pub movement_id: MovementId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub signed_quantity: Decimal,
    pub balance_quantity: Decimal,
    pub sequence: u64,
    pub movement_date: DateTime<Utc>,
    pub actor_id: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: QualityCheckRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheckRecorded {
    pub company_id: CompanyId,
    pub movement_id: MovementId,
    pub result: QualityCheck,
    pub actor_id: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LotStatusChanged (received, quarantined, released, expired, depleted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotStatusChanged {
    pub company_id: CompanyId,
    pub lot_id: LotId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub lot_number: String,
    pub status: LotStatus,
    pub quantity_remaining: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReservationChanged (positive `delta` reserves, negative releases).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservationChanged {
    pub company_id: CompanyId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub delta: Decimal,
    pub reserved_quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    MovementRecorded(MovementRecorded),
    MovementStatusChanged(MovementStatusChanged),
    MovementPosted(MovementPosted),
    QualityCheckRecorded(QualityCheckRecorded),
    LotStatusChanged(LotStatusChanged),
    StockReservationChanged(StockReservationChanged),
}

impl LedgerEvent {
    pub fn company_id(&self) -> CompanyId {
        match self {
            LedgerEvent::MovementRecorded(e) => e.company_id,
            LedgerEvent::MovementStatusChanged(e) => e.company_id,
            LedgerEvent::MovementPosted(e) => e.company_id,
            LedgerEvent::QualityCheckRecorded(e) => e.company_id,
            LedgerEvent::LotStatusChanged(e) => e.company_id,
            LedgerEvent::StockReservationChanged(e) => e.company_id,
        }
    }

    /// Id of the entity the event is about.
    pub fn subject_id(&self) -> uuid::Uuid {
        match self {
            LedgerEvent::MovementRecorded(e) => e.movement_id.into(),
            LedgerEvent::MovementStatusChanged(e) => e.movement_id.into(),
            LedgerEvent::MovementPosted(e) => e.movement_id.into(),
            LedgerEvent::QualityCheckRecorded(e) => e.movement_id.into(),
            LedgerEvent::LotStatusChanged(e) => e.lot_id.into(),
            LedgerEvent::StockReservationChanged(e) => e.product_id.into(),
        }
    }

    pub fn subject_type(&self) -> &'static str {
        match self {
            LedgerEvent::LotStatusChanged(_) => "inventory.lot",
            LedgerEvent::StockReservationChanged(_) => "inventory.snapshot",
            _ => "inventory.movement",
        }
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::MovementRecorded(_) => "inventory.movement.recorded",
            LedgerEvent::MovementStatusChanged(_) => "inventory.movement.status_changed",
            LedgerEvent::MovementPosted(_) => "inventory.movement.posted",
            LedgerEvent::QualityCheckRecorded(_) => "inventory.movement.quality_checked",
            LedgerEvent::LotStatusChanged(_) => "inventory.lot.status_changed",
            LedgerEvent::StockReservationChanged(_) => "inventory.snapshot.reservation_changed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::MovementRecorded(e) => e.occurred_at,
            LedgerEvent::MovementStatusChanged(e) => e.occurred_at,
            LedgerEvent::MovementPosted(e) => e.occurred_at,
            LedgerEvent::QualityCheckRecorded(e) => e.occurred_at,
            LedgerEvent::LotStatusChanged(e) => e.occurred_at,
            LedgerEvent::StockReservationChanged(e) => e.occurred_at,
        }
    }
}
