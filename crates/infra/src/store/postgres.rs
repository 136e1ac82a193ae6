//! Postgres-backed inventory store.
//!
//! Every unit of work runs inside one SQL transaction. Balance rows are read
//! with `SELECT ... FOR UPDATE`, so two postings on the same
//! (company, product, warehouse) key serialize on that row; postings on
//! different keys proceed in parallel.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure, deadlock) | `40001`, `40P01` | `Conflict` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed, network, other | N/A | `Backend` |
//!
//! ## Runtime
//!
//! The store trait is synchronous. Calls are driven with
//! `tokio::runtime::Handle::block_on`, so they must come from a thread that
//! is not itself polling the runtime (e.g. `spawn_blocking`).

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;

use stockledger_closing::{ClosureDetail, InventoryClosure};
use stockledger_core::{
    ClosureId, CompanyId, DocumentId, ExpectedVersion, LotId, MovementId, Period, ProductId,
    WarehouseId,
};
use stockledger_events::EventEnvelope;
use stockledger_inventory::{
    InventoryMovement, InventorySnapshot, MovementReason, ProductLot, ReasonCatalog, StockBalance,
};

use super::stream::{StoredEvent, UncommittedEvent, validate_batch};
use super::{Committed, InventoryStore, MovementFilter, Page, Pagination, StockKey, UnitOfWork};
use crate::error::{LedgerError, StoreError};

/// Schema applied by [`PostgresInventoryStore::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_stockledger.sql");

#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresInventoryStore {
    /// Must be called from within a tokio runtime; the current handle is kept
    /// for driving queries.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let handle = Handle::try_current().map_err(|_| {
            StoreError::Backend(
                "PostgresInventoryStore requires a tokio runtime; create it inside one".to_string(),
            )
        })?;
        Ok(Self::with_handle(pool, handle))
    }

    pub fn with_handle(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Create tables and indexes if they do not exist yet.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.handle
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

impl InventoryStore for PostgresInventoryStore {
    fn transaction<T, F>(&self, work: F) -> Result<Committed<T>, LedgerError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    {
        let tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let mut uow = PostgresUnitOfWork {
            tx,
            handle: self.handle.clone(),
            outbox: Vec::new(),
        };

        match work(&mut uow) {
            Ok(value) => {
                let PostgresUnitOfWork { tx, outbox, .. } = uow;
                self.handle
                    .block_on(tx.commit())
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(Committed {
                    value,
                    events: outbox,
                })
            }
            Err(err) => {
                if let Err(e) = self.handle.block_on(uow.tx.rollback()) {
                    tracing::warn!(error = %e, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
    handle: Handle,
    outbox: Vec<EventEnvelope<JsonValue>>,
}

fn to_body<T: Serialize>(value: &T) -> Result<JsonValue, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn from_row<T: DeserializeOwned>(row: &PgRow) -> Result<T, StoreError> {
    let body: JsonValue = row
        .try_get("body")
        .map_err(|e| StoreError::Serialization(format!("failed to read body: {e}")))?;
    Ok(serde_json::from_value(body)?)
}

fn from_rows<T: DeserializeOwned>(rows: &[PgRow]) -> Result<Vec<T>, StoreError> {
    rows.iter().map(from_row).collect()
}

impl PostgresUnitOfWork {
    fn fetch_bodies<T: DeserializeOwned>(
        &mut self,
        operation: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<T>, StoreError> {
        let rows = self
            .handle
            .block_on(query.fetch_all(&mut *self.tx))
            .map_err(|e| map_sqlx_error(operation, e))?;
        from_rows(&rows)
    }

    fn fetch_body<T: DeserializeOwned>(
        &mut self,
        operation: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<T>, StoreError> {
        let row = self
            .handle
            .block_on(query.fetch_optional(&mut *self.tx))
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.as_ref().map(from_row).transpose()
    }

    fn execute(
        &mut self,
        operation: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<u64, StoreError> {
        let done = self
            .handle
            .block_on(query.execute(&mut *self.tx))
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(done.rows_affected())
    }
}

impl UnitOfWork for PostgresUnitOfWork {
    fn reasons(&mut self, company_id: CompanyId) -> Result<ReasonCatalog, StoreError> {
        let reasons: Vec<MovementReason> = self.fetch_bodies(
            "reasons",
            sqlx::query(
                r#"
                SELECT body FROM movement_reasons
                WHERE company_id IS NULL OR company_id = $1
                ORDER BY code ASC
                "#,
            )
            .bind(*company_id.as_uuid()),
        )?;
        Ok(ReasonCatalog::new(reasons))
    }

    fn save_reason(&mut self, reason: &MovementReason) -> Result<(), StoreError> {
        let company = reason.company_id.map(|c| *c.as_uuid());
        self.execute(
            "delete_reason",
            sqlx::query(
                r#"
                DELETE FROM movement_reasons
                WHERE company_id IS NOT DISTINCT FROM $1 AND code = $2
                "#,
            )
            .bind(company)
            .bind(reason.code.clone()),
        )?;
        self.execute(
            "insert_reason",
            sqlx::query("INSERT INTO movement_reasons (company_id, code, body) VALUES ($1, $2, $3)")
                .bind(company)
                .bind(reason.code.clone())
                .bind(to_body(reason)?),
        )?;
        Ok(())
    }

    fn lock_balance(&mut self, key: StockKey) -> Result<StockBalance, StoreError> {
        // Materialize the row first so that the lock also covers a key's first posting.
        let empty = StockBalance::empty(key.company_id, key.product_id, key.warehouse_id);
        self.execute(
            "seed_balance",
            sqlx::query(
                r#"
                INSERT INTO stock_balances (company_id, product_id, warehouse_id, body)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (company_id, product_id, warehouse_id) DO NOTHING
                "#,
            )
            .bind(*key.company_id.as_uuid())
            .bind(*key.product_id.as_uuid())
            .bind(*key.warehouse_id.as_uuid())
            .bind(to_body(&empty)?),
        )?;
        let balance = self.fetch_body(
            "lock_balance",
            sqlx::query(
                r#"
                SELECT body FROM stock_balances
                WHERE company_id = $1 AND product_id = $2 AND warehouse_id = $3
                FOR UPDATE
                "#,
            )
            .bind(*key.company_id.as_uuid())
            .bind(*key.product_id.as_uuid())
            .bind(*key.warehouse_id.as_uuid()),
        )?;
        Ok(balance.unwrap_or(empty))
    }

    fn save_balance(&mut self, balance: &StockBalance) -> Result<(), StoreError> {
        self.execute(
            "save_balance",
            sqlx::query(
                r#"
                INSERT INTO stock_balances (company_id, product_id, warehouse_id, body)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (company_id, product_id, warehouse_id)
                DO UPDATE SET body = EXCLUDED.body
                "#,
            )
            .bind(*balance.company_id.as_uuid())
            .bind(*balance.product_id.as_uuid())
            .bind(*balance.warehouse_id.as_uuid())
            .bind(to_body(balance)?),
        )?;
        Ok(())
    }

    fn snapshot(&mut self, key: StockKey) -> Result<InventorySnapshot, StoreError> {
        let snapshot = self.fetch_body(
            "snapshot",
            sqlx::query(
                r#"
                SELECT body FROM inventory_snapshots
                WHERE company_id = $1 AND product_id = $2 AND warehouse_id = $3
                FOR UPDATE
                "#,
            )
            .bind(*key.company_id.as_uuid())
            .bind(*key.product_id.as_uuid())
            .bind(*key.warehouse_id.as_uuid()),
        )?;
        Ok(snapshot.unwrap_or_else(|| {
            InventorySnapshot::empty(key.company_id, key.product_id, key.warehouse_id)
        }))
    }

    fn save_snapshot(&mut self, snapshot: &InventorySnapshot) -> Result<(), StoreError> {
        self.execute(
            "save_snapshot",
            sqlx::query(
                r#"
                INSERT INTO inventory_snapshots (company_id, product_id, warehouse_id, body)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (company_id, product_id, warehouse_id)
                DO UPDATE SET body = EXCLUDED.body
                "#,
            )
            .bind(*snapshot.company_id.as_uuid())
            .bind(*snapshot.product_id.as_uuid())
            .bind(*snapshot.warehouse_id.as_uuid())
            .bind(to_body(snapshot)?),
        )?;
        Ok(())
    }

    fn lot(&mut self, company_id: CompanyId, lot_id: LotId) -> Result<Option<ProductLot>, StoreError> {
        self.fetch_body(
            "lot",
            sqlx::query("SELECT body FROM product_lots WHERE company_id = $1 AND id = $2")
                .bind(*company_id.as_uuid())
                .bind(*lot_id.as_uuid()),
        )
    }

    fn lots_for(&mut self, key: StockKey) -> Result<Vec<ProductLot>, StoreError> {
        self.fetch_bodies(
            "lots_for",
            sqlx::query(
                r#"
                SELECT body FROM product_lots
                WHERE company_id = $1 AND product_id = $2 AND warehouse_id = $3
                ORDER BY id ASC
                "#,
            )
            .bind(*key.company_id.as_uuid())
            .bind(*key.product_id.as_uuid())
            .bind(*key.warehouse_id.as_uuid()),
        )
    }

    fn lots_expiring_before(
        &mut self,
        company_id: CompanyId,
        day: NaiveDate,
    ) -> Result<Vec<ProductLot>, StoreError> {
        self.fetch_bodies(
            "lots_expiring_before",
            sqlx::query(
                r#"
                SELECT body FROM product_lots
                WHERE company_id = $1 AND status = 'active' AND expiration_date < $2
                ORDER BY id ASC
                FOR UPDATE
                "#,
            )
            .bind(*company_id.as_uuid())
            .bind(day),
        )
    }

    fn save_lot(&mut self, lot: &ProductLot) -> Result<(), StoreError> {
        self.execute(
            "save_lot",
            sqlx::query(
                r#"
                INSERT INTO product_lots (
                    id, company_id, product_id, warehouse_id, lot_number, status,
                    manufactured_date, expiration_date, body
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id)
                DO UPDATE SET status = EXCLUDED.status, body = EXCLUDED.body
                "#,
            )
            .bind(*lot.id.as_uuid())
            .bind(*lot.company_id.as_uuid())
            .bind(*lot.product_id.as_uuid())
            .bind(*lot.warehouse_id.as_uuid())
            .bind(lot.lot_number.clone())
            .bind(lot.status.to_string())
            .bind(lot.manufactured_date)
            .bind(lot.expiration_date)
            .bind(to_body(lot)?),
        )?;
        Ok(())
    }

    fn movement(
        &mut self,
        company_id: CompanyId,
        movement_id: MovementId,
    ) -> Result<Option<InventoryMovement>, StoreError> {
        self.fetch_body(
            "movement",
            sqlx::query(
                "SELECT body FROM inventory_movements WHERE company_id = $1 AND id = $2 FOR UPDATE",
            )
            .bind(*company_id.as_uuid())
            .bind(*movement_id.as_uuid()),
        )
    }

    fn insert_movement(&mut self, movement: &InventoryMovement) -> Result<(), StoreError> {
        self.execute(
            "insert_movement",
            sqlx::query(
                r#"
                INSERT INTO inventory_movements (
                    id, company_id, product_id, warehouse_id, status, movement_date, body
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(*movement.id.as_uuid())
            .bind(*movement.company_id.as_uuid())
            .bind(*movement.product_id.as_uuid())
            .bind(*movement.warehouse_id.as_uuid())
            .bind(movement.status.to_string())
            .bind(movement.movement_date)
            .bind(to_body(movement)?),
        )?;
        Ok(())
    }

    fn update_movement(&mut self, movement: &InventoryMovement) -> Result<(), StoreError> {
        let updated = self.execute(
            "update_movement",
            sqlx::query(
                r#"
                UPDATE inventory_movements
                SET status = $3, movement_date = $4, body = $5
                WHERE company_id = $1 AND id = $2
                "#,
            )
            .bind(*movement.company_id.as_uuid())
            .bind(*movement.id.as_uuid())
            .bind(movement.status.to_string())
            .bind(movement.movement_date)
            .bind(to_body(movement)?),
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("movement {}", movement.id)));
        }
        Ok(())
    }

    fn query_movements(
        &mut self,
        filter: &MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<InventoryMovement>, StoreError> {
        let product = filter.product_id.map(|p| *p.as_uuid());
        let warehouse = filter.warehouse_id.map(|w| *w.as_uuid());
        let status = filter.status.map(|s| s.to_string());

        let count_row = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    SELECT COUNT(*) AS total FROM inventory_movements
                    WHERE company_id = $1
                        AND ($2::uuid IS NULL OR product_id = $2)
                        AND ($3::uuid IS NULL OR warehouse_id = $3)
                        AND ($4::text IS NULL OR status = $4)
                        AND ($5::timestamptz IS NULL OR movement_date >= $5)
                        AND ($6::timestamptz IS NULL OR movement_date < $6)
                    "#,
                )
                .bind(*filter.company_id.as_uuid())
                .bind(product)
                .bind(warehouse)
                .bind(status.clone())
                .bind(filter.from)
                .bind(filter.to)
                .fetch_one(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("count_movements", e))?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| StoreError::Backend(format!("failed to read total: {e}")))?;

        let items = self.fetch_bodies(
            "query_movements",
            sqlx::query(
                r#"
                SELECT body FROM inventory_movements
                WHERE company_id = $1
                    AND ($2::uuid IS NULL OR product_id = $2)
                    AND ($3::uuid IS NULL OR warehouse_id = $3)
                    AND ($4::text IS NULL OR status = $4)
                    AND ($5::timestamptz IS NULL OR movement_date >= $5)
                    AND ($6::timestamptz IS NULL OR movement_date < $6)
                ORDER BY movement_date ASC, id ASC
                LIMIT $7 OFFSET $8
                "#,
            )
            .bind(*filter.company_id.as_uuid())
            .bind(product)
            .bind(warehouse)
            .bind(status)
            .bind(filter.from)
            .bind(filter.to)
            .bind(i64::from(pagination.limit))
            .bind(i64::from(pagination.offset)),
        )?;

        Ok(Page::new(items, total.max(0) as u64, pagination))
    }

    fn completed_movements(&mut self, key: StockKey) -> Result<Vec<InventoryMovement>, StoreError> {
        self.fetch_bodies(
            "completed_movements",
            sqlx::query(
                r#"
                SELECT body FROM inventory_movements
                WHERE company_id = $1 AND product_id = $2 AND warehouse_id = $3
                    AND status = 'completed'
                ORDER BY movement_date ASC, id ASC
                "#,
            )
            .bind(*key.company_id.as_uuid())
            .bind(*key.product_id.as_uuid())
            .bind(*key.warehouse_id.as_uuid()),
        )
    }

    fn latest_completed_before(
        &mut self,
        key: StockKey,
        before: DateTime<Utc>,
    ) -> Result<Option<InventoryMovement>, StoreError> {
        self.fetch_body(
            "latest_completed_before",
            sqlx::query(
                r#"
                SELECT body FROM inventory_movements
                WHERE company_id = $1 AND product_id = $2 AND warehouse_id = $3
                    AND status = 'completed' AND movement_date < $4
                ORDER BY movement_date DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(*key.company_id.as_uuid())
            .bind(*key.product_id.as_uuid())
            .bind(*key.warehouse_id.as_uuid())
            .bind(before),
        )
    }

    fn completed_between(
        &mut self,
        key: StockKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<InventoryMovement>, StoreError> {
        self.fetch_bodies(
            "completed_between",
            sqlx::query(
                r#"
                SELECT body FROM inventory_movements
                WHERE company_id = $1 AND product_id = $2 AND warehouse_id = $3
                    AND status = 'completed' AND movement_date >= $4 AND movement_date < $5
                ORDER BY movement_date ASC, id ASC
                "#,
            )
            .bind(*key.company_id.as_uuid())
            .bind(*key.product_id.as_uuid())
            .bind(*key.warehouse_id.as_uuid())
            .bind(from)
            .bind(to),
        )
    }

    fn products_moved_between(
        &mut self,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        pagination: Pagination,
    ) -> Result<Vec<ProductId>, StoreError> {
        let rows = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    SELECT DISTINCT product_id FROM inventory_movements
                    WHERE company_id = $1 AND warehouse_id = $2 AND status = 'completed'
                        AND movement_date >= $3 AND movement_date < $4
                    ORDER BY product_id ASC
                    LIMIT $5 OFFSET $6
                    "#,
                )
                .bind(*company_id.as_uuid())
                .bind(*warehouse_id.as_uuid())
                .bind(from)
                .bind(to)
                .bind(i64::from(pagination.limit))
                .bind(i64::from(pagination.offset))
                .fetch_all(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("products_moved_between", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("product_id")
                    .map(ProductId::from_uuid)
                    .map_err(|e| StoreError::Backend(format!("failed to read product_id: {e}")))
            })
            .collect()
    }

    fn load_stream(
        &mut self,
        company_id: CompanyId,
        document_id: DocumentId,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    SELECT
                        event_id,
                        company_id,
                        document_id,
                        aggregate_type,
                        sequence_number,
                        event_type,
                        event_version,
                        occurred_at,
                        payload
                    FROM document_events
                    WHERE company_id = $1 AND document_id = $2
                    ORDER BY sequence_number ASC
                    "#,
                )
                .bind(*company_id.as_uuid())
                .bind(*document_id.as_uuid())
                .fetch_all(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter()
            .map(stored_event_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| StoreError::Backend(format!("failed to read event row: {e}")))
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
        let company_id = first.company_id;
        let document_id = first.document_id;
        let aggregate_type = first.aggregate_type.clone();

        let row = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    SELECT
                        COALESCE(MAX(sequence_number), 0) AS current_version,
                        MAX(aggregate_type) AS aggregate_type
                    FROM document_events
                    WHERE company_id = $1 AND document_id = $2
                    "#,
                )
                .bind(*company_id.as_uuid())
                .bind(*document_id.as_uuid())
                .fetch_one(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("check_stream_version", e))?;
        let current: i64 = row
            .try_get("current_version")
            .map_err(|e| StoreError::Backend(format!("failed to read current_version: {e}")))?;
        let existing_type: Option<String> = row
            .try_get("aggregate_type")
            .map_err(|e| StoreError::Backend(format!("failed to read aggregate_type: {e}")))?;
        let current = current.max(0) as u64;

        if let Some(existing) = existing_type {
            if existing != aggregate_type {
                return Err(StoreError::Backend(format!(
                    "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
                )));
            }
        }
        if !expected_version.matches(current) {
            return Err(StoreError::Conflict(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        let mut committed = Vec::with_capacity(events.len());
        for (event, sequence_number) in events.into_iter().zip(current + 1..) {
            self.execute(
                "insert_event",
                sqlx::query(
                    r#"
                    INSERT INTO document_events (
                        event_id,
                        company_id,
                        document_id,
                        aggregate_type,
                        sequence_number,
                        event_type,
                        event_version,
                        occurred_at,
                        payload
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(event.event_id)
                .bind(*company_id.as_uuid())
                .bind(*document_id.as_uuid())
                .bind(aggregate_type.clone())
                .bind(sequence_number as i64)
                .bind(event.event_type.clone())
                .bind(event.event_version as i32)
                .bind(event.occurred_at)
                .bind(event.payload.clone()),
            )?;
            committed.push(event.into_stored(sequence_number));
        }
        Ok(committed)
    }

    fn closure(
        &mut self,
        company_id: CompanyId,
        closure_id: ClosureId,
    ) -> Result<Option<InventoryClosure>, StoreError> {
        self.fetch_body(
            "closure",
            sqlx::query("SELECT body FROM inventory_closures WHERE company_id = $1 AND id = $2 FOR UPDATE")
                .bind(*company_id.as_uuid())
                .bind(*closure_id.as_uuid()),
        )
    }

    fn closure_for_period(
        &mut self,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        period: Period,
    ) -> Result<Option<InventoryClosure>, StoreError> {
        self.fetch_body(
            "closure_for_period",
            sqlx::query(
                r#"
                SELECT body FROM inventory_closures
                WHERE company_id = $1 AND warehouse_id = $2 AND year = $3 AND month = $4
                "#,
            )
            .bind(*company_id.as_uuid())
            .bind(*warehouse_id.as_uuid())
            .bind(period.year())
            .bind(period.month() as i32),
        )
    }

    fn save_closure(&mut self, closure: &mut InventoryClosure) -> Result<(), StoreError> {
        let expected = closure.version;
        let mut next = closure.clone();
        next.version = expected + 1;
        let body = to_body(&next)?;

        if expected == 0 {
            self.execute(
                "insert_closure",
                sqlx::query(
                    r#"
                    INSERT INTO inventory_closures (
                        id, company_id, warehouse_id, year, month, status, version, body
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(*closure.id.as_uuid())
                .bind(*closure.company_id.as_uuid())
                .bind(*closure.warehouse_id.as_uuid())
                .bind(closure.period.year())
                .bind(closure.period.month() as i32)
                .bind(closure.status.as_str())
                .bind(next.version as i64)
                .bind(body),
            )?;
        } else {
            let updated = self.execute(
                "update_closure",
                sqlx::query(
                    r#"
                    UPDATE inventory_closures
                    SET status = $3, version = $4, body = $5
                    WHERE id = $1 AND version = $2
                    "#,
                )
                .bind(*closure.id.as_uuid())
                .bind(expected as i64)
                .bind(closure.status.as_str())
                .bind(next.version as i64)
                .bind(body),
            )?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "closure {} is no longer at version {expected}",
                    closure.id
                )));
            }
        }

        closure.version = next.version;
        Ok(())
    }

    fn closure_details(&mut self, closure_id: ClosureId) -> Result<Vec<ClosureDetail>, StoreError> {
        self.fetch_bodies(
            "closure_details",
            sqlx::query(
                r#"
                SELECT body FROM inventory_closure_details
                WHERE closure_id = $1
                ORDER BY product_id ASC
                "#,
            )
            .bind(*closure_id.as_uuid()),
        )
    }

    fn save_closure_detail(&mut self, detail: &ClosureDetail) -> Result<(), StoreError> {
        self.execute(
            "save_closure_detail",
            sqlx::query(
                r#"
                INSERT INTO inventory_closure_details (closure_id, product_id, body)
                VALUES ($1, $2, $3)
                ON CONFLICT (closure_id, product_id)
                DO UPDATE SET body = EXCLUDED.body
                "#,
            )
            .bind(*detail.closure_id.as_uuid())
            .bind(*detail.product_id.as_uuid())
            .bind(to_body(detail)?),
        )?;
        Ok(())
    }

    fn emit(&mut self, event: EventEnvelope<JsonValue>) {
        self.outbox.push(event);
    }
}

fn stored_event_from_row(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    Ok(StoredEvent {
        event_id: row.try_get("event_id")?,
        company_id: CompanyId::from_uuid(row.try_get("company_id")?),
        document_id: DocumentId::from_uuid(row.try_get("document_id")?),
        aggregate_type: row.try_get("aggregate_type")?,
        sequence_number: row.try_get::<i64, _>("sequence_number")? as u64,
        event_type: row.try_get("event_type")?,
        event_version: row.try_get::<i32, _>("event_version")? as u32,
        occurred_at: row.try_get("occurred_at")?,
        payload: row.try_get("payload")?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
