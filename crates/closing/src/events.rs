//! Events emitted by the closure engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{ActorId, ClosureId, CompanyId, Period, ProductId, WarehouseId};
use stockledger_events::Event;

use crate::closure::{ClosureStatus, InventoryClosure};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureChange {
    Opened,
    Processed { products: u64, movements: u64 },
    PhysicalCounted {
        product_id: ProductId,
        physical_quantity: Decimal,
        discrepancy_quantity: Decimal,
        has_discrepancy: bool,
    },
    Approved,
    Closed,
    Reopened { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureEvent {
    pub company_id: CompanyId,
    pub closure_id: ClosureId,
    pub warehouse_id: WarehouseId,
    pub period: Period,
    pub status: ClosureStatus,
    pub change: ClosureChange,
    pub actor_id: ActorId,
    pub occurred_at: DateTime<Utc>,
}

impl ClosureEvent {
    pub fn of(
        closure: &InventoryClosure,
        change: ClosureChange,
        actor_id: ActorId,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            company_id: closure.company_id,
            closure_id: closure.id,
            warehouse_id: closure.warehouse_id,
            period: closure.period,
            status: closure.status,
            change,
            actor_id,
            occurred_at,
        }
    }
}

impl Event for ClosureEvent {
    fn event_type(&self) -> &'static str {
        match self.change {
            ClosureChange::Opened => "closing.closure.opened",
            ClosureChange::Processed { .. } => "closing.closure.processed",
            ClosureChange::PhysicalCounted { .. } => "closing.closure.physical_counted",
            ClosureChange::Approved => "closing.closure.approved",
            ClosureChange::Closed => "closing.closure.closed",
            ClosureChange::Reopened { .. } => "closing.closure.reopened",
            ClosureChange::Cancelled => "closing.closure.cancelled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
