//! Monthly closures per warehouse.
//!
//! Processing reads the ledger for the period and (re)computes one detail
//! per product. Every transition saves the closure row with its version
//! check and queues a closure event.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use stockledger_closing::{
    ClosureChange, ClosureDetail, ClosureEvent, ClosureStatus, InventoryClosure, Opening,
    PeriodActivity,
};
use stockledger_core::{ClosureId, CompanyId, Period, ProductId, Stamp, WarehouseId};

use crate::error::LedgerError;
use crate::store::{Pagination, StockKey, UnitOfWork, emit_typed};

const AGGREGATE_TYPE: &str = "closing.closure";

/// Knobs the engine needs from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureSettings {
    pub page_size: u32,
    pub tolerance: Decimal,
}

fn record(
    uow: &mut dyn UnitOfWork,
    closure: &InventoryClosure,
    change: ClosureChange,
    stamp: Stamp,
) -> Result<(), LedgerError> {
    let event = ClosureEvent::of(closure, change, stamp.actor_id, stamp.at);
    emit_typed(
        uow,
        closure.company_id,
        closure.id.into(),
        AGGREGATE_TYPE,
        closure.version,
        &event,
    )?;
    Ok(())
}

fn load(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    closure_id: ClosureId,
) -> Result<InventoryClosure, LedgerError> {
    uow.closure(company_id, closure_id)?
        .ok_or_else(|| LedgerError::not_found(format!("closure {closure_id}")))
}

/// Start the closure of `period` for a warehouse. One closure per period,
/// cancelled ones included.
pub fn open(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    warehouse_id: WarehouseId,
    period: Period,
    stamp: Stamp,
) -> Result<InventoryClosure, LedgerError> {
    if let Some(existing) = uow.closure_for_period(company_id, warehouse_id, period)? {
        return Err(LedgerError::validation(format!(
            "period {period} already has closure {} ({})",
            existing.id, existing.status
        )));
    }
    let mut closure = InventoryClosure::open(ClosureId::new(), company_id, warehouse_id, period, stamp);
    uow.save_closure(&mut closure)?;
    record(uow, &closure, ClosureChange::Opened, stamp)?;
    tracing::info!(closure_id = %closure.id, %period, %warehouse_id, "closure opened");
    Ok(closure)
}

/// Every product with completed movements at the warehouse before `until`.
fn products_until(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    warehouse_id: WarehouseId,
    until: DateTime<Utc>,
    page_size: u32,
) -> Result<Vec<ProductId>, LedgerError> {
    let mut products = Vec::new();
    let mut page = Pagination::new(Some(page_size), Some(0));
    loop {
        let batch = uow.products_moved_between(
            company_id,
            warehouse_id,
            DateTime::<Utc>::UNIX_EPOCH,
            until,
            page,
        )?;
        let done = (batch.len() as u32) < page.limit;
        products.extend(batch);
        if done {
            return Ok(products);
        }
        page = page.next();
    }
}

/// Opening figures: the previous closed period's closing when there is one,
/// else the last balance before the period at its movement cost.
fn opening_for(
    uow: &mut dyn UnitOfWork,
    key: StockKey,
    period: Period,
    previous: &HashMap<ProductId, ClosureDetail>,
) -> Result<Opening, LedgerError> {
    if let Some(detail) = previous.get(&key.product_id) {
        return Ok(detail.closing());
    }
    Ok(match uow.latest_completed_before(key, period.starts_at())? {
        Some(last) => Opening {
            quantity: last.balance_quantity,
            value: last.balance_quantity * last.unit_cost,
        },
        None => Opening {
            quantity: Decimal::ZERO,
            value: Decimal::ZERO,
        },
    })
}

/// Compute (or recompute) the details of an open closure.
///
/// Physical counts already recorded are kept and re-evaluated against the
/// new figures.
pub fn process(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    closure_id: ClosureId,
    settings: ClosureSettings,
    stamp: Stamp,
) -> Result<(InventoryClosure, Vec<ClosureDetail>), LedgerError> {
    let mut closure = load(uow, company_id, closure_id)?;
    closure.ensure_processable("process")?;
    let period = closure.period;
    let warehouse_id = closure.warehouse_id;

    let previous: HashMap<ProductId, ClosureDetail> =
        match uow.closure_for_period(company_id, warehouse_id, period.previous())? {
            Some(prior) if prior.status == ClosureStatus::Cerrado => uow
                .closure_details(prior.id)?
                .into_iter()
                .map(|d| (d.product_id, d))
                .collect(),
            _ => HashMap::new(),
        };
    let recorded: HashMap<ProductId, ClosureDetail> = uow
        .closure_details(closure.id)?
        .into_iter()
        .map(|d| (d.product_id, d))
        .collect();

    let mut details = Vec::new();
    for product_id in products_until(
        uow,
        company_id,
        warehouse_id,
        period.ends_before(),
        settings.page_size,
    )? {
        let key = StockKey::new(company_id, product_id, warehouse_id);
        let opening = opening_for(uow, key, period, &previous)?;
        let movements = uow.completed_between(key, period.starts_at(), period.ends_before())?;
        let activity = PeriodActivity::from_movements(&movements);
        if movements.is_empty()
            && opening.quantity.is_zero()
            && !recorded.contains_key(&product_id)
        {
            continue;
        }
        let detail = ClosureDetail::compute(
            closure.id,
            company_id,
            warehouse_id,
            product_id,
            opening,
            &activity,
            recorded.get(&product_id),
            settings.tolerance,
        );
        uow.save_closure_detail(&detail)?;
        details.push(detail);
    }

    closure.mark_processed(&details, stamp.at)?;
    uow.save_closure(&mut closure)?;
    record(
        uow,
        &closure,
        ClosureChange::Processed {
            products: closure.totals.products,
            movements: closure.totals.movements,
        },
        stamp,
    )?;
    tracing::info!(
        %closure_id,
        %period,
        products = closure.totals.products,
        movements = closure.totals.movements,
        "closure processed"
    );
    Ok((closure, details))
}

pub fn record_physical_count(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    closure_id: ClosureId,
    product_id: ProductId,
    physical_quantity: Decimal,
    settings: ClosureSettings,
    stamp: Stamp,
) -> Result<ClosureDetail, LedgerError> {
    if physical_quantity < Decimal::ZERO {
        return Err(LedgerError::validation("physical quantity cannot be negative"));
    }
    let mut closure = load(uow, company_id, closure_id)?;
    closure.ensure_processable("count")?;

    let mut details = uow.closure_details(closure.id)?;
    let detail = details
        .iter_mut()
        .find(|d| d.product_id == product_id)
        .ok_or_else(|| {
            LedgerError::not_found(format!("product {product_id} in closure {closure_id}"))
        })?;
    detail.record_physical_count(physical_quantity, stamp, settings.tolerance);
    let counted = detail.clone();
    uow.save_closure_detail(&counted)?;

    closure.refresh_totals(&details);
    uow.save_closure(&mut closure)?;
    record(
        uow,
        &closure,
        ClosureChange::PhysicalCounted {
            product_id,
            physical_quantity,
            discrepancy_quantity: counted.discrepancy_quantity,
            has_discrepancy: counted.has_discrepancy,
        },
        stamp,
    )?;
    if counted.has_discrepancy {
        tracing::warn!(
            %closure_id,
            %product_id,
            discrepancy = %counted.discrepancy_quantity,
            "physical count differs from the ledger"
        );
    }
    Ok(counted)
}

/// Fail when the ledger has moved inside the period since the details were
/// computed. Once approved, postings into the period are refused.
fn ensure_current(
    uow: &mut dyn UnitOfWork,
    closure: &InventoryClosure,
    page_size: u32,
) -> Result<(), LedgerError> {
    let period = closure.period;
    let computed: HashMap<ProductId, u64> = uow
        .closure_details(closure.id)?
        .into_iter()
        .map(|d| (d.product_id, d.movement_count))
        .collect();
    for product_id in products_until(
        uow,
        closure.company_id,
        closure.warehouse_id,
        period.ends_before(),
        page_size,
    )? {
        let key = StockKey::new(closure.company_id, product_id, closure.warehouse_id);
        let moved = uow
            .completed_between(key, period.starts_at(), period.ends_before())?
            .len() as u64;
        if moved != computed.get(&product_id).copied().unwrap_or(0) {
            return Err(LedgerError::validation(format!(
                "closure {} is behind the ledger for product {product_id}; process it again",
                closure.id
            )));
        }
    }
    Ok(())
}

pub fn approve(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    closure_id: ClosureId,
    settings: ClosureSettings,
    stamp: Stamp,
) -> Result<InventoryClosure, LedgerError> {
    let mut closure = load(uow, company_id, closure_id)?;
    closure.approve(stamp)?;
    ensure_current(uow, &closure, settings.page_size)?;
    uow.save_closure(&mut closure)?;
    record(uow, &closure, ClosureChange::Approved, stamp)?;
    Ok(closure)
}

/// Close an approved closure. Each product's counted (or calculated)
/// quantity becomes the snapshot's last count.
pub fn close(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    closure_id: ClosureId,
    stamp: Stamp,
) -> Result<InventoryClosure, LedgerError> {
    let mut closure = load(uow, company_id, closure_id)?;
    closure.close(stamp)?;
    for detail in uow.closure_details(closure.id)? {
        let key = StockKey::new(company_id, detail.product_id, closure.warehouse_id);
        let mut snapshot = uow.snapshot(key)?;
        snapshot.record_count(detail.counted_or_calculated(), stamp);
        uow.save_snapshot(&snapshot)?;
    }
    uow.save_closure(&mut closure)?;
    record(uow, &closure, ClosureChange::Closed, stamp)?;
    tracing::info!(%closure_id, period = %closure.period, "closure closed");
    Ok(closure)
}

pub fn reopen(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    closure_id: ClosureId,
    reason: String,
    stamp: Stamp,
) -> Result<InventoryClosure, LedgerError> {
    let mut closure = load(uow, company_id, closure_id)?;
    closure.reopen(reason.clone(), stamp)?;
    uow.save_closure(&mut closure)?;
    record(uow, &closure, ClosureChange::Reopened { reason }, stamp)?;
    tracing::warn!(%closure_id, period = %closure.period, "closure reopened");
    Ok(closure)
}

pub fn cancel(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    closure_id: ClosureId,
    stamp: Stamp,
) -> Result<InventoryClosure, LedgerError> {
    let mut closure = load(uow, company_id, closure_id)?;
    closure.cancel(stamp)?;
    uow.save_closure(&mut closure)?;
    record(uow, &closure, ClosureChange::Cancelled, stamp)?;
    Ok(closure)
}
