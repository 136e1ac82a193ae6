//! Persistence boundary: units of work over the ledger's tables.
//!
//! A unit of work sees a consistent view of balances, lots, movements,
//! snapshots, reasons, document streams and closures, and commits all of its
//! writes (plus the events they produced) or none of them.
//!
//! Two backends:
//! - [`InMemoryInventoryStore`] validates row versions at commit (optimistic).
//! - [`PostgresInventoryStore`] takes `SELECT ... FOR UPDATE` on balance rows.

pub mod in_memory;
pub mod postgres;
pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockledger_closing::{ClosureDetail, InventoryClosure};
use stockledger_core::{
    ClosureId, CompanyId, DocumentId, ExpectedVersion, LotId, MovementId, Period, ProductId,
    WarehouseId,
};
use stockledger_events::EventEnvelope;
use stockledger_inventory::{
    InventoryMovement, InventorySnapshot, MovementReason, MovementStatus, ProductLot,
    ReasonCatalog, StockBalance,
};

use crate::error::{LedgerError, StoreError};

pub use in_memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;
pub use stream::{StoredEvent, UncommittedEvent};

/// (company, product, warehouse): the key balances, snapshots and movement
/// chains are kept by.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub company_id: CompanyId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
}

impl StockKey {
    pub fn new(company_id: CompanyId, product_id: ProductId, warehouse_id: WarehouseId) -> Self {
        Self {
            company_id,
            product_id,
            warehouse_id,
        }
    }

    pub fn of_balance(balance: &StockBalance) -> Self {
        Self::new(balance.company_id, balance.product_id, balance.warehouse_id)
    }

    pub fn of_snapshot(snapshot: &InventorySnapshot) -> Self {
        Self::new(snapshot.company_id, snapshot.product_id, snapshot.warehouse_id)
    }

    pub fn of_movement(movement: &InventoryMovement) -> Self {
        Self::new(movement.company_id, movement.product_id, movement.warehouse_id)
    }
}

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).clamp(1, 1000),
            offset: offset.unwrap_or(0),
        }
    }

    pub fn next(self) -> Self {
        Self {
            limit: self.limit,
            offset: self.offset + self.limit,
        }
    }

    pub(crate) fn window<T>(self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let items: Vec<T> = items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect();
        Page::new(items, total, self)
    }
}

/// One page of a list query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);
        Self {
            items,
            total,
            pagination,
            has_more,
        }
    }
}

/// Movement history filter. Results are ordered by (movement_date, id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub company_id: CompanyId,
    pub product_id: Option<ProductId>,
    pub warehouse_id: Option<WarehouseId>,
    pub status: Option<MovementStatus>,
    /// Inclusive lower bound on movement_date.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on movement_date.
    pub to: Option<DateTime<Utc>>,
}

impl MovementFilter {
    pub fn company(company_id: CompanyId) -> Self {
        Self {
            company_id,
            product_id: None,
            warehouse_id: None,
            status: None,
            from: None,
            to: None,
        }
    }

    pub fn for_key(key: StockKey) -> Self {
        Self {
            product_id: Some(key.product_id),
            warehouse_id: Some(key.warehouse_id),
            ..Self::company(key.company_id)
        }
    }

    pub fn matches(&self, m: &InventoryMovement) -> bool {
        m.company_id == self.company_id
            && self.product_id.is_none_or(|p| m.product_id == p)
            && self.warehouse_id.is_none_or(|w| m.warehouse_id == w)
            && self.status.is_none_or(|s| m.status == s)
            && self.from.is_none_or(|f| m.movement_date >= f)
            && self.to.is_none_or(|t| m.movement_date < t)
    }
}

/// Operations available inside one transaction.
///
/// Reads see the transaction's own writes. Getters for balances and snapshots
/// return an empty row when none is stored yet.
pub trait UnitOfWork {
    // reasons
    fn reasons(&mut self, company_id: CompanyId) -> Result<ReasonCatalog, StoreError>;
    fn save_reason(&mut self, reason: &MovementReason) -> Result<(), StoreError>;

    // balances: the row that serializes appends on one key
    fn lock_balance(&mut self, key: StockKey) -> Result<StockBalance, StoreError>;
    fn save_balance(&mut self, balance: &StockBalance) -> Result<(), StoreError>;

    // snapshots
    fn snapshot(&mut self, key: StockKey) -> Result<InventorySnapshot, StoreError>;
    fn save_snapshot(&mut self, snapshot: &InventorySnapshot) -> Result<(), StoreError>;

    // lots
    fn lot(&mut self, company_id: CompanyId, lot_id: LotId) -> Result<Option<ProductLot>, StoreError>;
    /// Every lot of the key, whatever its status.
    fn lots_for(&mut self, key: StockKey) -> Result<Vec<ProductLot>, StoreError>;
    /// Active lots of the company whose expiration date is before `day`.
    fn lots_expiring_before(
        &mut self,
        company_id: CompanyId,
        day: chrono::NaiveDate,
    ) -> Result<Vec<ProductLot>, StoreError>;
    fn save_lot(&mut self, lot: &ProductLot) -> Result<(), StoreError>;

    // movements
    fn movement(
        &mut self,
        company_id: CompanyId,
        movement_id: MovementId,
    ) -> Result<Option<InventoryMovement>, StoreError>;
    fn insert_movement(&mut self, movement: &InventoryMovement) -> Result<(), StoreError>;
    fn update_movement(&mut self, movement: &InventoryMovement) -> Result<(), StoreError>;
    fn query_movements(
        &mut self,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<InventoryMovement>, StoreError>;
    /// Completed movements of the key, ordered by (movement_date, id).
    fn completed_movements(&mut self, key: StockKey) -> Result<Vec<InventoryMovement>, StoreError>;
    /// Latest completed movement of the key dated before `before`.
    fn latest_completed_before(
        &mut self,
        key: StockKey,
        before: DateTime<Utc>,
    ) -> Result<Option<InventoryMovement>, StoreError>;
    /// Completed movements of the key with `from <= movement_date < to`.
    fn completed_between(
        &mut self,
        key: StockKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<InventoryMovement>, StoreError>;
    /// Distinct products with completed movements in the window, ascending.
    fn products_moved_between(
        &mut self,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        pagination: Pagination,
    ) -> Result<Vec<ProductId>, StoreError>;

    // document streams
    fn load_stream(
        &mut self,
        company_id: CompanyId,
        document_id: DocumentId,
    ) -> Result<Vec<StoredEvent>, StoreError>;
    fn append_stream(
        &mut self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    // closures
    fn closure(
        &mut self,
        company_id: CompanyId,
        closure_id: ClosureId,
    ) -> Result<Option<InventoryClosure>, StoreError>;
    fn closure_for_period(
        &mut self,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        period: Period,
    ) -> Result<Option<InventoryClosure>, StoreError>;
    /// Insert (version 0) or update the row, checking `closure.version`
    /// against the stored one; bumps `closure.version` on success.
    fn save_closure(&mut self, closure: &mut InventoryClosure) -> Result<(), StoreError>;
    fn closure_details(&mut self, closure_id: ClosureId) -> Result<Vec<ClosureDetail>, StoreError>;
    fn save_closure_detail(&mut self, detail: &ClosureDetail) -> Result<(), StoreError>;

    /// Queue an event for publication after commit.
    fn emit(&mut self, event: EventEnvelope<JsonValue>);
}

/// Result of a committed unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub value: T,
    /// Events queued with [`UnitOfWork::emit`], in emission order.
    pub events: Vec<EventEnvelope<JsonValue>>,
}

/// A store that runs closures as atomic units of work.
pub trait InventoryStore: Send + Sync {
    /// Run `work` in one transaction. Any error rolls everything back;
    /// a lost race surfaces as [`LedgerError::ConcurrencyConflict`].
    fn transaction<T, F>(&self, work: F) -> Result<Committed<T>, LedgerError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, LedgerError>;
}

impl<S> InventoryStore for std::sync::Arc<S>
where
    S: InventoryStore + ?Sized,
{
    fn transaction<T, F>(&self, work: F) -> Result<Committed<T>, LedgerError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    {
        (**self).transaction(work)
    }
}

/// Wrap a typed event about a ledger entity for the outbox.
pub(crate) fn emit_typed<E>(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    aggregate_id: uuid::Uuid,
    aggregate_type: &str,
    sequence_number: u64,
    event: &E,
) -> Result<(), StoreError>
where
    E: stockledger_events::Event + Serialize,
{
    let envelope =
        EventEnvelope::from_typed(company_id, aggregate_id, aggregate_type, sequence_number, event)?;
    uow.emit(envelope);
    Ok(())
}
