//! The movement ledger.
//!
//! Every function runs inside a caller-supplied unit of work. Appends and
//! postings lock the (company, product, warehouse) balance row before reading
//! the running balance, so concurrent postings on one key cannot both chain
//! off the same previous balance.

use rust_decimal::Decimal;

use stockledger_core::{CompanyId, MovementId, Period, Stamp, WarehouseId};
use stockledger_inventory::{
    ChainReport, InventoryMovement, InventorySnapshot, LedgerEvent, LotStatus, LotStatusChanged,
    MovementCategory, MovementPosted, MovementRecorded, MovementStatusChanged, MovementTerms,
    MovementType, NewMovement, ProductLot, QualityCheckRecorded, StockBalance,
    StockReservationChanged, verify_chain,
};

use crate::error::LedgerError;
use crate::store::{StockKey, UnitOfWork, emit_typed};

/// Queue a ledger event for publication after commit.
pub(crate) fn record_event(
    uow: &mut dyn UnitOfWork,
    event: LedgerEvent,
    sequence: u64,
) -> Result<(), LedgerError> {
    emit_typed(
        uow,
        event.company_id(),
        event.subject_id(),
        event.subject_type(),
        sequence,
        &event,
    )?;
    Ok(())
}

pub(crate) fn lot_changed(uow: &mut dyn UnitOfWork, lot: &ProductLot, stamp: Stamp) -> Result<(), LedgerError> {
    record_event(
        uow,
        LedgerEvent::LotStatusChanged(LotStatusChanged {
            company_id: lot.company_id,
            lot_id: lot.id,
            product_id: lot.product_id,
            warehouse_id: lot.warehouse_id,
            lot_number: lot.lot_number.clone(),
            status: lot.status,
            quantity_remaining: lot.quantity_remaining,
            occurred_at: stamp.at,
        }),
        0,
    )
}

fn reservation_changed(
    uow: &mut dyn UnitOfWork,
    snapshot: &InventorySnapshot,
    delta: Decimal,
    sequence: u64,
    stamp: Stamp,
) -> Result<(), LedgerError> {
    record_event(
        uow,
        LedgerEvent::StockReservationChanged(StockReservationChanged {
            company_id: snapshot.company_id,
            product_id: snapshot.product_id,
            warehouse_id: snapshot.warehouse_id,
            delta,
            reserved_quantity: snapshot.reserved_quantity,
            occurred_at: stamp.at,
        }),
        sequence,
    )
}

fn status_changed(uow: &mut dyn UnitOfWork, movement: &InventoryMovement, stamp: Stamp) -> Result<(), LedgerError> {
    record_event(
        uow,
        LedgerEvent::MovementStatusChanged(MovementStatusChanged {
            company_id: movement.company_id,
            movement_id: movement.id,
            status: movement.status,
            actor_id: stamp.actor_id,
            occurred_at: stamp.at,
        }),
        movement.sequence,
    )
}

/// Reject postings dated inside a period of the warehouse whose closure is
/// approved or closed.
pub(crate) fn ensure_period_open(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    warehouse_id: WarehouseId,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<(), LedgerError> {
    let period = Period::containing(at);
    if let Some(closure) = uow.closure_for_period(company_id, warehouse_id, period)? {
        if closure.locks_postings() {
            let state = if closure.is_closed() { "closed" } else { "approved for closing" };
            return Err(LedgerError::validation(format!(
                "period {period} is {state} for warehouse {warehouse_id}"
            )));
        }
    }
    Ok(())
}

fn load_lot(uow: &mut dyn UnitOfWork, company_id: CompanyId, lot_id: stockledger_core::LotId) -> Result<ProductLot, LedgerError> {
    uow.lot(company_id, lot_id)?
        .ok_or_else(|| LedgerError::not_found(format!("lot {lot_id}")))
}

pub(crate) fn load_movement(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    movement_id: MovementId,
) -> Result<InventoryMovement, LedgerError> {
    uow.movement(company_id, movement_id)?
        .ok_or_else(|| LedgerError::not_found(format!("movement {movement_id}")))
}

/// Stock a new outbound draw may take: the balance minus what is on hold.
fn ensure_covered(
    quantity: Decimal,
    balance: &StockBalance,
    snapshot: &InventorySnapshot,
    lot: Option<&ProductLot>,
) -> Result<(), LedgerError> {
    let available = (balance.quantity - snapshot.reserved_quantity).max(Decimal::ZERO);
    if quantity > available {
        return Err(LedgerError::InsufficientInventory {
            requested: quantity,
            available,
        });
    }
    if let Some(lot) = lot {
        if lot.status != LotStatus::Active {
            return Err(LedgerError::InvalidStateTransition {
                entity: "lot",
                from: lot.status.to_string(),
                action: "draw from",
            });
        }
        if quantity > lot.quantity_remaining {
            return Err(LedgerError::InsufficientInventory {
                requested: quantity,
                available: lot.quantity_remaining,
            });
        }
    }
    Ok(())
}

/// Record a movement, posting it straight away when nothing holds it back.
///
/// Pending outbound movements put their quantity on hold in the snapshot
/// until they are completed, rejected or cancelled.
pub fn append(
    uow: &mut dyn UnitOfWork,
    input: NewMovement,
    stamp: Stamp,
) -> Result<InventoryMovement, LedgerError> {
    input.validate()?;
    let key = StockKey::new(input.company_id, input.product_id, input.warehouse_id);

    let lot = match input.lot_id {
        Some(lot_id) => {
            let lot = load_lot(uow, input.company_id, lot_id)?;
            if lot.product_id != input.product_id || lot.warehouse_id != input.warehouse_id {
                return Err(LedgerError::validation(format!(
                    "lot {} does not hold product {} in warehouse {}",
                    lot.lot_number, input.product_id, input.warehouse_id
                )));
            }
            Some(lot)
        }
        None => None,
    };

    let catalog = uow.reasons(input.company_id)?;
    let reason = catalog
        .resolve(input.company_id, input.reason_code.as_deref(), input.movement_type)?
        .clone();
    reason.check(&input)?;

    let mut balance = uow.lock_balance(key)?;
    if lot.is_none() && crate::lots::is_lot_tracked(uow, key)? {
        return Err(LedgerError::validation(format!(
            "product {} is lot-tracked in warehouse {}; the movement must name a lot",
            input.product_id, input.warehouse_id
        )));
    }
    let mut snapshot = uow.snapshot(key)?;

    let unit_cost = input
        .unit_cost
        .or(lot.as_ref().map(|l| l.unit_cost))
        .unwrap_or(snapshot.unit_cost);
    let total_cost = input.quantity * unit_cost;
    let terms = MovementTerms {
        reason_code: reason.code.clone(),
        unit_cost,
        requires_approval: reason.requires_approval_for(total_cost),
        requires_quality_check: reason.requires_quality_check,
    };

    let outbound = input.category() == MovementCategory::Out;
    if outbound {
        if input.from_reservation {
            snapshot.release(input.quantity, stamp.at)?;
        }
        ensure_covered(input.quantity, &balance, &snapshot, lot.as_ref())?;
    }
    ensure_period_open(uow, input.company_id, input.warehouse_id, stamp.at)?;

    let mut movement = InventoryMovement::record(MovementId::new(), input, terms, stamp);
    uow.insert_movement(&movement)?;
    record_event(
        uow,
        LedgerEvent::MovementRecorded(MovementRecorded::of(&movement)),
        0,
    )?;

    if movement.is_ready() {
        post(uow, &mut movement, &mut balance, &mut snapshot, stamp)?;
    } else if outbound {
        let quantity = movement.quantity();
        snapshot.reserve(quantity, stamp.at)?;
        movement.reserved_quantity = quantity;
        uow.update_movement(&movement)?;
        uow.save_snapshot(&snapshot)?;
        reservation_changed(uow, &snapshot, quantity, balance.sequence, stamp)?;
    } else {
        uow.save_snapshot(&snapshot)?;
    }

    tracing::debug!(
        movement_id = %movement.id,
        movement_type = %movement.movement_type,
        status = %movement.status,
        quantity = %movement.quantity(),
        "movement appended"
    );
    Ok(movement)
}

/// Post a ready movement on its key: chain, lot, snapshot, then persist.
fn post(
    uow: &mut dyn UnitOfWork,
    movement: &mut InventoryMovement,
    balance: &mut StockBalance,
    snapshot: &mut InventorySnapshot,
    stamp: Stamp,
) -> Result<(), LedgerError> {
    let held = movement.reserved_quantity;
    balance.post(movement, stamp)?;

    if let Some(lot_id) = movement.lot_id {
        let mut lot = load_lot(uow, movement.company_id, lot_id)?;
        let before = lot.status;
        match movement.movement_type {
            MovementType::CustomerReturn | MovementType::AdjustmentIn => {
                lot.restore(movement.quantity())?
            }
            // Receipts create the lot with the received quantity.
            MovementType::PurchaseReceipt
            | MovementType::DonationReceipt
            | MovementType::TransferIn => crate::lots::admit_received(&mut lot, stamp)?,
            MovementType::Dispatch
            | MovementType::TransferOut
            | MovementType::AdjustmentOut
            | MovementType::WriteOff => lot.consume(movement.quantity())?,
        }
        uow.save_lot(&lot)?;
        if lot.status != before {
            lot_changed(uow, &lot, stamp)?;
        }
    }

    match movement.category() {
        MovementCategory::In => {
            snapshot.apply_inbound(movement.quantity(), movement.unit_cost, stamp.at)
        }
        MovementCategory::Out => {
            if held > Decimal::ZERO {
                snapshot.release(held, stamp.at)?;
            }
            snapshot.apply_outbound(movement.quantity(), stamp.at)?;
        }
    }

    uow.update_movement(movement)?;
    uow.save_balance(balance)?;
    uow.save_snapshot(snapshot)?;
    record_event(
        uow,
        LedgerEvent::MovementPosted(MovementPosted {
            company_id: movement.company_id,
            movement_id: movement.id,
            product_id: movement.product_id,
            warehouse_id: movement.warehouse_id,
            signed_quantity: movement.signed_quantity(),
            balance_quantity: movement.balance_quantity,
            sequence: movement.sequence,
            movement_date: movement.movement_date,
            actor_id: stamp.actor_id,
            occurred_at: stamp.at,
        }),
        movement.sequence,
    )
}

/// Give back the hold of a movement that will never post.
fn release_hold(
    uow: &mut dyn UnitOfWork,
    movement: &mut InventoryMovement,
    stamp: Stamp,
) -> Result<(), LedgerError> {
    let held = movement.reserved_quantity;
    if held.is_zero() {
        return Ok(());
    }
    let key = StockKey::of_movement(movement);
    let balance = uow.lock_balance(key)?;
    let mut snapshot = uow.snapshot(key)?;
    snapshot.release(held, stamp.at)?;
    movement.reserved_quantity = Decimal::ZERO;
    uow.save_snapshot(&snapshot)?;
    reservation_changed(uow, &snapshot, -held, balance.sequence, stamp)
}

/// Put stock of a key on hold for a document that will draw on it later.
pub(crate) fn reserve(
    uow: &mut dyn UnitOfWork,
    key: StockKey,
    quantity: Decimal,
    stamp: Stamp,
) -> Result<InventorySnapshot, LedgerError> {
    let balance = uow.lock_balance(key)?;
    let mut snapshot = uow.snapshot(key)?;
    ensure_covered(quantity, &balance, &snapshot, None)?;
    snapshot.reserve(quantity, stamp.at)?;
    uow.save_snapshot(&snapshot)?;
    reservation_changed(uow, &snapshot, quantity, balance.sequence, stamp)?;
    Ok(snapshot)
}

/// Give back a hold taken with [`reserve`].
pub(crate) fn release(
    uow: &mut dyn UnitOfWork,
    key: StockKey,
    quantity: Decimal,
    stamp: Stamp,
) -> Result<InventorySnapshot, LedgerError> {
    let balance = uow.lock_balance(key)?;
    let mut snapshot = uow.snapshot(key)?;
    snapshot.release(quantity, stamp.at)?;
    uow.save_snapshot(&snapshot)?;
    reservation_changed(uow, &snapshot, -quantity, balance.sequence, stamp)?;
    Ok(snapshot)
}

pub fn approve(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    movement_id: MovementId,
    stamp: Stamp,
) -> Result<InventoryMovement, LedgerError> {
    let mut movement = load_movement(uow, company_id, movement_id)?;
    movement.approve(stamp)?;
    uow.update_movement(&movement)?;
    status_changed(uow, &movement, stamp)?;
    Ok(movement)
}

pub fn reject(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    movement_id: MovementId,
    reason: Option<String>,
    stamp: Stamp,
) -> Result<InventoryMovement, LedgerError> {
    let mut movement = load_movement(uow, company_id, movement_id)?;
    movement.reject(stamp, reason)?;
    release_hold(uow, &mut movement, stamp)?;
    uow.update_movement(&movement)?;
    status_changed(uow, &movement, stamp)?;
    Ok(movement)
}

pub fn cancel(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    movement_id: MovementId,
    stamp: Stamp,
) -> Result<InventoryMovement, LedgerError> {
    let mut movement = load_movement(uow, company_id, movement_id)?;
    movement.cancel(stamp)?;
    release_hold(uow, &mut movement, stamp)?;
    uow.update_movement(&movement)?;
    status_changed(uow, &movement, stamp)?;
    Ok(movement)
}

pub fn record_quality_check(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    movement_id: MovementId,
    passed: bool,
    stamp: Stamp,
) -> Result<InventoryMovement, LedgerError> {
    let mut movement = load_movement(uow, company_id, movement_id)?;
    movement.record_quality_check(passed, stamp)?;
    uow.update_movement(&movement)?;
    record_event(
        uow,
        LedgerEvent::QualityCheckRecorded(QualityCheckRecorded {
            company_id,
            movement_id,
            result: movement.quality_check,
            actor_id: stamp.actor_id,
            occurred_at: stamp.at,
        }),
        movement.sequence,
    )?;
    Ok(movement)
}

/// Post an approved (or approval-free) movement whose quality check, if
/// any, has passed.
pub fn complete(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    movement_id: MovementId,
    stamp: Stamp,
) -> Result<InventoryMovement, LedgerError> {
    let mut movement = load_movement(uow, company_id, movement_id)?;
    movement.ensure_completable()?;

    let key = StockKey::of_movement(&movement);
    let mut balance = uow.lock_balance(key)?;
    if movement.lot_id.is_none() && crate::lots::is_lot_tracked(uow, key)? {
        return Err(LedgerError::validation(format!(
            "product {} became lot-tracked in warehouse {}; the movement names no lot",
            movement.product_id, movement.warehouse_id
        )));
    }
    let mut snapshot = uow.snapshot(key)?;

    if movement.category() == MovementCategory::Out {
        // The movement's own hold counts towards what it may take.
        let mut others = snapshot.clone();
        others.reserved_quantity -= movement.reserved_quantity;
        let lot = match movement.lot_id {
            Some(lot_id) => Some(load_lot(uow, company_id, lot_id)?),
            None => None,
        };
        ensure_covered(movement.quantity(), &balance, &others, lot.as_ref())?;
    }
    ensure_period_open(uow, company_id, movement.warehouse_id, stamp.at)?;

    post(uow, &mut movement, &mut balance, &mut snapshot, stamp)?;
    Ok(movement)
}

/// Replay the completed movements of a key and report the first broken link.
pub fn verify(uow: &mut dyn UnitOfWork, key: StockKey) -> Result<ChainReport, LedgerError> {
    let movements = uow.completed_movements(key)?;
    let report = verify_chain(&movements);
    if let Some(b) = &report.first_break {
        tracing::warn!(
            company_id = %key.company_id,
            product_id = %key.product_id,
            warehouse_id = %key.warehouse_id,
            movement_id = %b.movement_id,
            position = b.position,
            "balance chain broken"
        );
    }
    Ok(report)
}
