use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;

use stockledger_closing::{ClosureDetail, InventoryClosure};
use stockledger_core::{
    ClosureId, CompanyId, DocumentId, ExpectedVersion, LotId, MovementId, Period, ProductId,
    WarehouseId,
};
use stockledger_events::EventEnvelope;
use stockledger_inventory::{
    InventoryMovement, InventorySnapshot, LotStatus, MovementReason, MovementStatus, ProductLot,
    ReasonCatalog, StockBalance,
};

use super::stream::{StoredEvent, UncommittedEvent, stream_version, validate_batch};
use super::{
    Committed, InventoryStore, MovementFilter, Page, Pagination, StockKey, UnitOfWork,
};
use crate::error::{LedgerError, StoreError};

type ReasonKey = (Option<CompanyId>, String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Reason(ReasonKey),
    Balance(StockKey),
    Snapshot(StockKey),
    Lot(LotId),
    Movement(MovementId),
    Stream(CompanyId, DocumentId),
    Closure(ClosureId),
    Detail(ClosureId, ProductId),
}

#[derive(Debug, Clone)]
struct Versioned<T> {
    version: u64,
    value: T,
}

fn version_in<K: Hash + Eq, V>(table: &HashMap<K, Versioned<V>>, key: &K) -> u64 {
    table.get(key).map_or(0, |row| row.version)
}

/// Replace the value, keeping the version the transaction started from.
fn put<K: Hash + Eq, V>(table: &mut HashMap<K, Versioned<V>>, key: K, value: V) {
    let version = version_in(table, &key);
    table.insert(key, Versioned { version, value });
}

/// Publish a transaction's row into the shared table with the next version.
fn publish<K: Hash + Eq + Clone, V: Clone>(
    shared: &mut HashMap<K, Versioned<V>>,
    local: &HashMap<K, Versioned<V>>,
    key: &K,
) {
    if let Some(row) = local.get(key) {
        let version = version_in(shared, key) + 1;
        shared.insert(
            key.clone(),
            Versioned {
                version,
                value: row.value.clone(),
            },
        );
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    reasons: HashMap<ReasonKey, Versioned<MovementReason>>,
    balances: HashMap<StockKey, Versioned<StockBalance>>,
    snapshots: HashMap<StockKey, Versioned<InventorySnapshot>>,
    lots: HashMap<LotId, Versioned<ProductLot>>,
    movements: HashMap<MovementId, Versioned<InventoryMovement>>,
    streams: HashMap<(CompanyId, DocumentId), Versioned<Vec<StoredEvent>>>,
    closures: HashMap<ClosureId, Versioned<InventoryClosure>>,
    details: HashMap<(ClosureId, ProductId), Versioned<ClosureDetail>>,
}

impl Tables {
    fn version_of(&self, key: &RowKey) -> u64 {
        match key {
            RowKey::Reason(k) => version_in(&self.reasons, k),
            RowKey::Balance(k) => version_in(&self.balances, k),
            RowKey::Snapshot(k) => version_in(&self.snapshots, k),
            RowKey::Lot(k) => version_in(&self.lots, k),
            RowKey::Movement(k) => version_in(&self.movements, k),
            RowKey::Stream(c, d) => version_in(&self.streams, &(*c, *d)),
            RowKey::Closure(k) => version_in(&self.closures, k),
            RowKey::Detail(c, p) => version_in(&self.details, &(*c, *p)),
        }
    }

    fn publish_row(&mut self, local: &Tables, key: &RowKey) {
        match key {
            RowKey::Reason(k) => publish(&mut self.reasons, &local.reasons, k),
            RowKey::Balance(k) => publish(&mut self.balances, &local.balances, k),
            RowKey::Snapshot(k) => publish(&mut self.snapshots, &local.snapshots, k),
            RowKey::Lot(k) => publish(&mut self.lots, &local.lots, k),
            RowKey::Movement(k) => publish(&mut self.movements, &local.movements, k),
            RowKey::Stream(c, d) => publish(&mut self.streams, &local.streams, &(*c, *d)),
            RowKey::Closure(k) => publish(&mut self.closures, &local.closures, k),
            RowKey::Detail(c, p) => publish(&mut self.details, &local.details, &(*c, *p)),
        }
    }

    fn completed_for(&self, key: StockKey) -> Vec<InventoryMovement> {
        let mut out: Vec<InventoryMovement> = self
            .movements
            .values()
            .map(|row| &row.value)
            .filter(|m| StockKey::of_movement(m) == key && m.status == MovementStatus::Completed)
            .cloned()
            .collect();
        out.sort_by_key(|m| (m.movement_date, m.id));
        out
    }
}

/// In-memory store with optimistic row versioning.
///
/// Each transaction works on a private copy of the tables and remembers the
/// version of every row it read or wrote. Commit fails with a conflict if any
/// of those rows moved in the meantime; otherwise the written rows are
/// published with the next version.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug)]
pub struct InMemoryInventoryStore {
    tables: RwLock<Tables>,
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryInventoryStore {
    /// Store seeded with the standard global reasons.
    pub fn new() -> Self {
        Self::with_reasons(ReasonCatalog::standard())
    }

    pub fn with_reasons(catalog: ReasonCatalog) -> Self {
        let mut tables = Tables::default();
        for reason in catalog.reasons() {
            tables.reasons.insert(
                (reason.company_id, reason.code.clone()),
                Versioned {
                    version: 1,
                    value: reason.clone(),
                },
            );
        }
        Self {
            tables: RwLock::new(tables),
        }
    }

    fn commit(&self, uow: InMemoryUnitOfWork) -> Result<Vec<EventEnvelope<JsonValue>>, LedgerError> {
        let mut shared = self
            .tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        for (key, seen) in &uow.observed {
            let current = shared.version_of(key);
            if current != *seen {
                return Err(StoreError::Conflict(format!(
                    "{key:?} moved from version {seen} to {current}"
                ))
                .into());
            }
        }
        for key in &uow.dirty {
            shared.publish_row(&uow.tables, key);
        }
        Ok(uow.outbox)
    }
}

impl InventoryStore for InMemoryInventoryStore {
    fn transaction<T, F>(&self, work: F) -> Result<Committed<T>, LedgerError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?
            .clone();
        let mut uow = InMemoryUnitOfWork {
            tables,
            observed: HashMap::new(),
            dirty: HashSet::new(),
            outbox: Vec::new(),
        };

        let value = work(&mut uow)?;
        let events = self.commit(uow)?;
        Ok(Committed { value, events })
    }
}

struct InMemoryUnitOfWork {
    tables: Tables,
    observed: HashMap<RowKey, u64>,
    dirty: HashSet<RowKey>,
    outbox: Vec<EventEnvelope<JsonValue>>,
}

impl InMemoryUnitOfWork {
    fn observe(&mut self, key: RowKey) {
        let version = self.tables.version_of(&key);
        self.observed.entry(key).or_insert(version);
    }

    fn touch(&mut self, key: RowKey) {
        self.observe(key.clone());
        self.dirty.insert(key);
    }
}

impl UnitOfWork for InMemoryUnitOfWork {
    fn reasons(&mut self, company_id: CompanyId) -> Result<ReasonCatalog, StoreError> {
        let mut visible: Vec<MovementReason> = self
            .tables
            .reasons
            .values()
            .map(|row| &row.value)
            .filter(|r| r.company_id.is_none() || r.company_id == Some(company_id))
            .cloned()
            .collect();
        visible.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(ReasonCatalog::new(visible))
    }

    fn save_reason(&mut self, reason: &MovementReason) -> Result<(), StoreError> {
        let key = (reason.company_id, reason.code.clone());
        self.touch(RowKey::Reason(key.clone()));
        put(&mut self.tables.reasons, key, reason.clone());
        Ok(())
    }

    fn lock_balance(&mut self, key: StockKey) -> Result<StockBalance, StoreError> {
        self.observe(RowKey::Balance(key));
        Ok(self
            .tables
            .balances
            .get(&key)
            .map(|row| row.value.clone())
            .unwrap_or_else(|| StockBalance::empty(key.company_id, key.product_id, key.warehouse_id)))
    }

    fn save_balance(&mut self, balance: &StockBalance) -> Result<(), StoreError> {
        let key = StockKey::of_balance(balance);
        self.touch(RowKey::Balance(key));
        put(&mut self.tables.balances, key, balance.clone());
        Ok(())
    }

    fn snapshot(&mut self, key: StockKey) -> Result<InventorySnapshot, StoreError> {
        self.observe(RowKey::Snapshot(key));
        Ok(self
            .tables
            .snapshots
            .get(&key)
            .map(|row| row.value.clone())
            .unwrap_or_else(|| {
                InventorySnapshot::empty(key.company_id, key.product_id, key.warehouse_id)
            }))
    }

    fn save_snapshot(&mut self, snapshot: &InventorySnapshot) -> Result<(), StoreError> {
        let key = StockKey::of_snapshot(snapshot);
        self.touch(RowKey::Snapshot(key));
        put(&mut self.tables.snapshots, key, snapshot.clone());
        Ok(())
    }

    fn lot(&mut self, company_id: CompanyId, lot_id: LotId) -> Result<Option<ProductLot>, StoreError> {
        self.observe(RowKey::Lot(lot_id));
        Ok(self
            .tables
            .lots
            .get(&lot_id)
            .map(|row| row.value.clone())
            .filter(|lot| lot.company_id == company_id))
    }

    fn lots_for(&mut self, key: StockKey) -> Result<Vec<ProductLot>, StoreError> {
        let mut lots: Vec<ProductLot> = self
            .tables
            .lots
            .values()
            .map(|row| &row.value)
            .filter(|l| {
                l.company_id == key.company_id
                    && l.product_id == key.product_id
                    && l.warehouse_id == key.warehouse_id
            })
            .cloned()
            .collect();
        lots.sort_by_key(|l| l.id);
        for lot in &lots {
            self.observe(RowKey::Lot(lot.id));
        }
        Ok(lots)
    }

    fn lots_expiring_before(
        &mut self,
        company_id: CompanyId,
        day: NaiveDate,
    ) -> Result<Vec<ProductLot>, StoreError> {
        let mut lots: Vec<ProductLot> = self
            .tables
            .lots
            .values()
            .map(|row| &row.value)
            .filter(|l| l.company_id == company_id && l.status == LotStatus::Active && l.is_expired_on(day))
            .cloned()
            .collect();
        lots.sort_by_key(|l| l.id);
        Ok(lots)
    }

    fn save_lot(&mut self, lot: &ProductLot) -> Result<(), StoreError> {
        self.touch(RowKey::Lot(lot.id));
        put(&mut self.tables.lots, lot.id, lot.clone());
        Ok(())
    }

    fn movement(
        &mut self,
        company_id: CompanyId,
        movement_id: MovementId,
    ) -> Result<Option<InventoryMovement>, StoreError> {
        self.observe(RowKey::Movement(movement_id));
        Ok(self
            .tables
            .movements
            .get(&movement_id)
            .map(|row| row.value.clone())
            .filter(|m| m.company_id == company_id))
    }

    fn insert_movement(&mut self, movement: &InventoryMovement) -> Result<(), StoreError> {
        if self.tables.movements.contains_key(&movement.id) {
            return Err(StoreError::Conflict(format!(
                "movement {} already exists",
                movement.id
            )));
        }
        self.touch(RowKey::Movement(movement.id));
        put(&mut self.tables.movements, movement.id, movement.clone());
        Ok(())
    }

    fn update_movement(&mut self, movement: &InventoryMovement) -> Result<(), StoreError> {
        if !self.tables.movements.contains_key(&movement.id) {
            return Err(StoreError::NotFound(format!("movement {}", movement.id)));
        }
        self.touch(RowKey::Movement(movement.id));
        put(&mut self.tables.movements, movement.id, movement.clone());
        Ok(())
    }

    fn query_movements(
        &mut self,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<InventoryMovement>, StoreError> {
        let mut matched: Vec<InventoryMovement> = self
            .tables
            .movements
            .values()
            .map(|row| &row.value)
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        matched.sort_by_key(|m| (m.movement_date, m.id));
        Ok(pagination.window(matched))
    }

    fn completed_movements(&mut self, key: StockKey) -> Result<Vec<InventoryMovement>, StoreError> {
        Ok(self.tables.completed_for(key))
    }

    fn latest_completed_before(
        &mut self,
        key: StockKey,
        before: DateTime<Utc>,
    ) -> Result<Option<InventoryMovement>, StoreError> {
        Ok(self
            .tables
            .completed_for(key)
            .into_iter()
            .filter(|m| m.movement_date < before)
            .next_back())
    }

    fn completed_between(
        &mut self,
        key: StockKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<InventoryMovement>, StoreError> {
        Ok(self
            .tables
            .completed_for(key)
            .into_iter()
            .filter(|m| m.movement_date >= from && m.movement_date < to)
            .collect())
    }

    fn products_moved_between(
        &mut self,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        pagination: Pagination,
    ) -> Result<Vec<ProductId>, StoreError> {
        let mut products: Vec<ProductId> = self
            .tables
            .movements
            .values()
            .map(|row| &row.value)
            .filter(|m| {
                m.company_id == company_id
                    && m.warehouse_id == warehouse_id
                    && m.status == MovementStatus::Completed
                    && m.movement_date >= from
                    && m.movement_date < to
            })
            .map(|m| m.product_id)
            .collect();
        products.sort();
        products.dedup();
        Ok(pagination.window(products).items)
    }

    fn load_stream(
        &mut self,
        company_id: CompanyId,
        document_id: DocumentId,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.observe(RowKey::Stream(company_id, document_id));
        Ok(self
            .tables
            .streams
            .get(&(company_id, document_id))
            .map(|row| row.value.clone())
            .unwrap_or_default())
    }

    fn append_stream(
        &mut self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };
        validate_batch(&events)?;
        let stream_key = (first.company_id, first.document_id);
        let aggregate_type = first.aggregate_type.clone();

        let mut stream = self
            .tables
            .streams
            .get(&stream_key)
            .map(|row| row.value.clone())
            .unwrap_or_default();
        let current = stream_version(&stream);
        if !expected_version.matches(current) {
            return Err(StoreError::Conflict(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }
        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(StoreError::Backend(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, seq)| e.into_stored(seq))
            .collect();
        stream.extend(committed.iter().cloned());

        self.touch(RowKey::Stream(stream_key.0, stream_key.1));
        put(&mut self.tables.streams, stream_key, stream);
        Ok(committed)
    }

    fn closure(
        &mut self,
        company_id: CompanyId,
        closure_id: ClosureId,
    ) -> Result<Option<InventoryClosure>, StoreError> {
        self.observe(RowKey::Closure(closure_id));
        Ok(self
            .tables
            .closures
            .get(&closure_id)
            .map(|row| row.value.clone())
            .filter(|c| c.company_id == company_id))
    }

    fn closure_for_period(
        &mut self,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        period: Period,
    ) -> Result<Option<InventoryClosure>, StoreError> {
        Ok(self
            .tables
            .closures
            .values()
            .map(|row| &row.value)
            .find(|c| c.company_id == company_id && c.warehouse_id == warehouse_id && c.period == period)
            .cloned())
    }

    fn save_closure(&mut self, closure: &mut InventoryClosure) -> Result<(), StoreError> {
        let stored = self.tables.closures.get(&closure.id).map(|row| row.value.version);
        match stored {
            None if closure.version != 0 => {
                return Err(StoreError::NotFound(format!("closure {}", closure.id)));
            }
            None => {
                let taken = self.tables.closures.values().any(|row| {
                    row.value.company_id == closure.company_id
                        && row.value.warehouse_id == closure.warehouse_id
                        && row.value.period == closure.period
                });
                if taken {
                    return Err(StoreError::Conflict(format!(
                        "closure for {} already exists",
                        closure.period
                    )));
                }
            }
            Some(v) if v != closure.version => {
                return Err(StoreError::Conflict(format!(
                    "closure {} is at version {v}, expected {}",
                    closure.id, closure.version
                )));
            }
            Some(_) => {}
        }

        closure.version += 1;
        self.touch(RowKey::Closure(closure.id));
        put(&mut self.tables.closures, closure.id, closure.clone());
        Ok(())
    }

    fn closure_details(&mut self, closure_id: ClosureId) -> Result<Vec<ClosureDetail>, StoreError> {
        let mut details: Vec<ClosureDetail> = self
            .tables
            .details
            .iter()
            .filter(|((c, _), _)| *c == closure_id)
            .map(|(_, row)| row.value.clone())
            .collect();
        details.sort_by_key(|d| d.product_id);
        Ok(details)
    }

    fn save_closure_detail(&mut self, detail: &ClosureDetail) -> Result<(), StoreError> {
        let key = (detail.closure_id, detail.product_id);
        self.touch(RowKey::Detail(key.0, key.1));
        put(&mut self.tables.details, key, detail.clone());
        Ok(())
    }

    fn emit(&mut self, event: EventEnvelope<JsonValue>) {
        self.outbox.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn key() -> StockKey {
        StockKey::new(CompanyId::new(), ProductId::new(), WarehouseId::new())
    }

    #[test]
    fn writes_are_invisible_until_commit_and_dropped_on_error() {
        let store = InMemoryInventoryStore::new();
        let k = key();

        let failed: Result<Committed<()>, LedgerError> = store.transaction(|uow| {
            let mut b = uow.lock_balance(k)?;
            b.quantity = dec!(10);
            uow.save_balance(&b)?;
            Err(LedgerError::validation("abort"))
        });
        assert!(failed.is_err());

        let seen = store.transaction(|uow| Ok(uow.lock_balance(k)?.quantity)).unwrap();
        assert_eq!(seen.value, dec!(0));
    }

    #[test]
    fn concurrent_writers_on_one_balance_conflict() {
        let store = InMemoryInventoryStore::new();
        let k = key();

        // The outer transaction reads, then an inner one commits a write to the same row.
        let outcome = store.transaction(|uow| {
            let mut b = uow.lock_balance(k)?;
            store
                .transaction(|inner| {
                    let mut other = inner.lock_balance(k)?;
                    other.quantity = dec!(1);
                    inner.save_balance(&other)
                        .map_err(LedgerError::from)
                })
                .map(|_| ())?;
            b.quantity = dec!(2);
            uow.save_balance(&b)?;
            Ok(())
        });

        assert!(matches!(outcome, Err(LedgerError::ConcurrencyConflict(_))));
        let seen = store.transaction(|uow| Ok(uow.lock_balance(k)?.quantity)).unwrap();
        assert_eq!(seen.value, dec!(1));
    }

    #[test]
    fn stream_appends_check_the_expected_version() {
        let store = InMemoryInventoryStore::new();
        let company = CompanyId::new();
        let document = DocumentId::new();
        let event = |n: u32| UncommittedEvent {
            event_id: uuid::Uuid::now_v7(),
            company_id: company,
            document_id: document,
            aggregate_type: "documents.purchase".to_string(),
            event_type: format!("test.{n}"),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "n": n }),
        };

        store
            .transaction(|uow| {
                let stored = uow.append_stream(vec![event(1), event(2)], ExpectedVersion::NoStream)?;
                assert_eq!(stored[1].sequence_number, 2);
                Ok(())
            })
            .unwrap();

        let stale = store.transaction(|uow| {
            uow.append_stream(vec![event(3)], ExpectedVersion::Exact(1))?;
            Ok(())
        });
        assert!(matches!(stale, Err(LedgerError::ConcurrencyConflict(_))));

        let loaded = store.transaction(|uow| Ok(uow.load_stream(company, document)?)).unwrap();
        assert_eq!(loaded.value.len(), 2);
    }

    #[test]
    fn company_reasons_shadow_globals() {
        let store = InMemoryInventoryStore::new();
        let company = CompanyId::new();
        let own = MovementReason::global("own_purchase", "Own purchase", stockledger_inventory::MovementType::PurchaseReceipt)
            .as_default()
            .for_company(company);

        store.transaction(|uow| Ok(uow.save_reason(&own)?)).unwrap();
        let code = store
            .transaction(|uow| {
                let catalog = uow.reasons(company)?;
                let reason = catalog.resolve(company, None, stockledger_inventory::MovementType::PurchaseReceipt)?;
                Ok(reason.code.clone())
            })
            .unwrap();
        assert_eq!(code.value, "own_purchase");

        let other = store
            .transaction(|uow| Ok(uow.reasons(CompanyId::new())?.reasons().len()))
            .unwrap();
        assert_eq!(other.value, ReasonCatalog::standard().reasons().len());
    }
}
