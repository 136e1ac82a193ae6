//! Lot registry operations and store-backed lot selection.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{CompanyId, LotId, Stamp, TransferCorrelationId};
use stockledger_inventory::{
    InventoryMovement, LotAllocation, LotReceipt, LotStatus, MovementCategory, MovementType,
    NewMovement, ProductLot, Provenance, RotationStrategy, select_lots as rotate,
};

use crate::error::LedgerError;
use crate::ledger;
use crate::store::{StockKey, UnitOfWork};

/// How the inbound movement of a lot receipt is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotIntake {
    pub movement_type: MovementType,
    pub reason_code: Option<String>,
    pub provenance: Provenance,
    pub transfer_correlation_id: Option<TransferCorrelationId>,
    pub reference: Option<String>,
    pub notes: Option<String>,
}

impl LotIntake {
    pub fn manual(movement_type: MovementType) -> Self {
        Self {
            movement_type,
            reason_code: None,
            provenance: Provenance::Manual,
            transfer_correlation_id: None,
            reference: None,
            notes: None,
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedLot {
    pub lot: ProductLot,
    pub movement: InventoryMovement,
}

/// Register a batch and record the inbound movement that brings it into stock.
///
/// The lot number must be new for the (product, warehouse) unless the batch
/// arrives through a transfer. When the receipt movement cannot post yet (a
/// quality check is pending) the lot waits in quarantine and is released
/// when the movement completes.
pub fn receive_lot(
    uow: &mut dyn UnitOfWork,
    receipt: LotReceipt,
    intake: LotIntake,
    stamp: Stamp,
) -> Result<ReceivedLot, LedgerError> {
    if intake.movement_type.category() != MovementCategory::In {
        return Err(LedgerError::validation(format!(
            "a lot cannot be received through a {} movement",
            intake.movement_type
        )));
    }
    let key = StockKey::new(receipt.company_id, receipt.product_id, receipt.warehouse_id);
    let existing = uow.lots_for(key)?;
    // Transferred batches keep their number; each arrival is its own lot.
    if receipt.origin_lot_id.is_none()
        && existing
            .iter()
            .any(|l| l.lot_number == receipt.lot_number && l.origin_lot_id.is_none())
    {
        return Err(LedgerError::validation(format!(
            "lot {} already exists for product {} in warehouse {}",
            receipt.lot_number, receipt.product_id, receipt.warehouse_id
        )));
    }
    let balance = uow.lock_balance(key)?;
    let in_lots: Decimal = existing.iter().map(|l| l.quantity_remaining).sum();
    if balance.quantity > in_lots {
        return Err(LedgerError::validation(format!(
            "product {} holds {} untracked units in warehouse {}; lots cannot be mixed with them",
            receipt.product_id,
            balance.quantity - in_lots,
            receipt.warehouse_id
        )));
    }

    let mut lot = ProductLot::receive(LotId::new(), receipt, stamp.at)?;
    uow.save_lot(&lot)?;
    ledger::lot_changed(uow, &lot, stamp)?;

    let mut input = NewMovement::manual(
        lot.company_id,
        lot.product_id,
        lot.warehouse_id,
        intake.movement_type,
        lot.quantity_produced,
    );
    input.lot_id = Some(lot.id);
    input.unit_cost = Some(lot.unit_cost);
    input.reason_code = intake.reason_code;
    input.provenance = intake.provenance;
    input.transfer_correlation_id = intake.transfer_correlation_id;
    input.reference = intake.reference;
    input.notes = intake.notes;
    input.pre_approved = true;

    let movement = ledger::append(uow, input, stamp)?;
    if movement.is_completed() {
        // Posting may have touched the row; keep the stored copy.
        lot = uow.lot(lot.company_id, lot.id)?.unwrap_or(lot);
    } else {
        lot.quarantine()?;
        uow.save_lot(&lot)?;
        ledger::lot_changed(uow, &lot, stamp)?;
    }

    tracing::debug!(lot_id = %lot.id, lot_number = %lot.lot_number, status = %lot.status, "lot received");
    Ok(ReceivedLot { lot, movement })
}

fn load(uow: &mut dyn UnitOfWork, company_id: CompanyId, lot_id: LotId) -> Result<ProductLot, LedgerError> {
    uow.lot(company_id, lot_id)?
        .ok_or_else(|| LedgerError::not_found(format!("lot {lot_id}")))
}

pub fn quarantine(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    lot_id: LotId,
    stamp: Stamp,
) -> Result<ProductLot, LedgerError> {
    let mut lot = load(uow, company_id, lot_id)?;
    lot.quarantine()?;
    uow.save_lot(&lot)?;
    ledger::lot_changed(uow, &lot, stamp)?;
    Ok(lot)
}

pub fn release(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    lot_id: LotId,
    stamp: Stamp,
) -> Result<ProductLot, LedgerError> {
    let mut lot = load(uow, company_id, lot_id)?;
    lot.release(stamp.at.date_naive())?;
    uow.save_lot(&lot)?;
    ledger::lot_changed(uow, &lot, stamp)?;
    Ok(lot)
}

/// Mark every active lot of the company whose expiration date is before
/// `today` as expired. Returns the lots that changed.
pub fn expire(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    today: NaiveDate,
    stamp: Stamp,
) -> Result<Vec<ProductLot>, LedgerError> {
    let mut expired = Vec::new();
    for mut lot in uow.lots_expiring_before(company_id, today)? {
        if lot.expire_if_due(today) {
            uow.save_lot(&lot)?;
            ledger::lot_changed(uow, &lot, stamp)?;
            expired.push(lot);
        }
    }
    if !expired.is_empty() {
        tracing::info!(%company_id, %today, count = expired.len(), "lots expired");
    }
    Ok(expired)
}

/// A key is lot-tracked while any of its lots still holds stock. Its
/// balance is then exactly what the lots hold, so every movement on it must
/// name a lot.
pub(crate) fn holds_stock(lots: &[ProductLot]) -> bool {
    lots.iter().any(|l| l.quantity_remaining > Decimal::ZERO)
}

pub(crate) fn is_lot_tracked(uow: &mut dyn UnitOfWork, key: StockKey) -> Result<bool, LedgerError> {
    Ok(holds_stock(&uow.lots_for(key)?))
}

/// Lots of the key after expiring those past their date.
fn current_lots(uow: &mut dyn UnitOfWork, key: StockKey, stamp: Stamp) -> Result<Vec<ProductLot>, LedgerError> {
    let today = stamp.at.date_naive();
    let mut lots = uow.lots_for(key)?;
    for lot in lots.iter_mut() {
        if lot.expire_if_due(today) {
            uow.save_lot(lot)?;
            ledger::lot_changed(uow, lot, stamp)?;
        }
    }
    Ok(lots)
}

/// Choose lots for an outbound request of `quantity` on the key.
pub fn select(
    uow: &mut dyn UnitOfWork,
    key: StockKey,
    quantity: Decimal,
    strategy: RotationStrategy,
    stamp: Stamp,
) -> Result<Vec<LotAllocation>, LedgerError> {
    let lots = current_lots(uow, key, stamp)?;
    Ok(rotate(&lots, quantity, strategy)?)
}

/// One outbound movement to record: an optional lot and the quantity it takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Draw {
    pub lot_id: Option<LotId>,
    pub quantity: Decimal,
}

/// Split an outbound line into per-lot draws.
///
/// A pinned lot takes the whole line. Otherwise a lot-tracked key goes
/// through rotation and an untracked one is drawn without a lot.
pub(crate) fn plan_draws(
    uow: &mut dyn UnitOfWork,
    key: StockKey,
    quantity: Decimal,
    pinned: Option<LotId>,
    strategy: RotationStrategy,
    stamp: Stamp,
) -> Result<Vec<Draw>, LedgerError> {
    if let Some(lot_id) = pinned {
        return Ok(vec![Draw {
            lot_id: Some(lot_id),
            quantity,
        }]);
    }
    let lots = current_lots(uow, key, stamp)?;
    if !holds_stock(&lots) {
        return Ok(vec![Draw {
            lot_id: None,
            quantity,
        }]);
    }
    Ok(rotate(&lots, quantity, strategy)?
        .into_iter()
        .map(|a| Draw {
            lot_id: Some(a.lot_id),
            quantity: a.quantity,
        })
        .collect())
}

/// Release a lot whose receipt movement was waiting in quarantine.
pub(crate) fn admit_received(lot: &mut ProductLot, stamp: Stamp) -> Result<(), LedgerError> {
    if lot.status == LotStatus::Quarantined {
        lot.release(stamp.at.date_naive())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryInventoryStore, InventoryStore};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use stockledger_core::{ActorId, ProductId, WarehouseId};
    use stockledger_inventory::{MovementReason, MovementStatus, ReasonCatalog};

    fn receipt(key: StockKey, lot_number: &str, quantity: Decimal) -> LotReceipt {
        LotReceipt {
            company_id: key.company_id,
            warehouse_id: key.warehouse_id,
            product_id: key.product_id,
            supplier_id: None,
            lot_number: lot_number.to_string(),
            manufactured_date: None,
            expiration_date: None,
            quantity,
            unit_cost: dec!(3),
            origin_lot_id: None,
        }
    }

    fn key() -> StockKey {
        StockKey::new(CompanyId::new(), ProductId::new(), WarehouseId::new())
    }

    #[test]
    fn receiving_a_lot_posts_its_quantity() {
        let store = InMemoryInventoryStore::new();
        let key = key();
        let stamp = Stamp::now(ActorId::new());

        let received = store
            .transaction(|uow| {
                receive_lot(
                    uow,
                    receipt(key, "L-1", dec!(40)),
                    LotIntake::manual(MovementType::PurchaseReceipt),
                    stamp,
                )
            })
            .unwrap()
            .value;

        assert_eq!(received.lot.status, LotStatus::Active);
        assert_eq!(received.lot.quantity_remaining, dec!(40));
        assert_eq!(received.movement.status, MovementStatus::Completed);
        assert_eq!(received.movement.lot_id, Some(received.lot.id));
        assert_eq!(received.movement.balance_quantity, dec!(40));

        let duplicate = store.transaction(|uow| {
            receive_lot(
                uow,
                receipt(key, "L-1", dec!(5)),
                LotIntake::manual(MovementType::PurchaseReceipt),
                stamp,
            )
        });
        assert!(matches!(duplicate, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn receipts_waiting_for_inspection_stay_quarantined() {
        let key = key();
        let mut catalog = ReasonCatalog::standard();
        catalog.push(
            MovementReason::global("inspected_purchase", "Inspected purchase", MovementType::PurchaseReceipt)
                .with_quality_check(),
        );
        let store = InMemoryInventoryStore::with_reasons(catalog);
        let stamp = Stamp::now(ActorId::new());

        let received = store
            .transaction(|uow| {
                let mut intake = LotIntake::manual(MovementType::PurchaseReceipt);
                intake.reason_code = Some("inspected_purchase".to_string());
                receive_lot(uow, receipt(key, "Q-1", dec!(10)), intake, stamp)
            })
            .unwrap()
            .value;
        assert_eq!(received.lot.status, LotStatus::Quarantined);
        assert_eq!(received.movement.status, MovementStatus::Pending);

        let (company, movement_id, lot_id) = (key.company_id, received.movement.id, received.lot.id);
        store
            .transaction(|uow| {
                ledger::record_quality_check(uow, company, movement_id, true, stamp)?;
                ledger::complete(uow, company, movement_id, stamp)
            })
            .unwrap();
        let lot = store
            .transaction(|uow| load(uow, company, lot_id))
            .unwrap()
            .value;
        assert_eq!(lot.status, LotStatus::Active);
    }

    #[test]
    fn selection_skips_lots_past_their_date() {
        let store = InMemoryInventoryStore::new();
        let key = key();
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 9, 0, 0).unwrap();
        let stamp = Stamp::new(ActorId::new(), now);

        store
            .transaction(|uow| {
                let mut stale = receipt(key, "OLD", dec!(30));
                stale.expiration_date = Some((now - Duration::days(2)).date_naive());
                receive_lot(uow, stale, LotIntake::manual(MovementType::PurchaseReceipt), stamp)?;
                let mut fresh = receipt(key, "NEW", dec!(30));
                fresh.expiration_date = Some((now + Duration::days(20)).date_naive());
                receive_lot(uow, fresh, LotIntake::manual(MovementType::PurchaseReceipt), stamp)
            })
            .unwrap();

        let picked = store
            .transaction(|uow| select(uow, key, dec!(20), RotationStrategy::Fefo, stamp))
            .unwrap();
        assert_eq!(picked.value.len(), 1);
        assert_eq!(picked.value[0].lot_number, "NEW");
        assert!(
            picked
                .events
                .iter()
                .any(|e| e.event_type() == "inventory.lot.status_changed")
        );

        let short = store.transaction(|uow| select(uow, key, dec!(31), RotationStrategy::Fefo, stamp));
        assert!(matches!(short, Err(LedgerError::InsufficientInventory { .. })));
    }

    #[test]
    fn lots_are_not_mixed_with_untracked_stock() {
        let store = InMemoryInventoryStore::new();
        let key = key();
        let stamp = Stamp::now(ActorId::new());
        store
            .transaction(|uow| {
                let mut input = NewMovement::manual(
                    key.company_id,
                    key.product_id,
                    key.warehouse_id,
                    MovementType::PurchaseReceipt,
                    dec!(6),
                );
                input.unit_cost = Some(dec!(1));
                ledger::append(uow, input, stamp)
            })
            .unwrap();

        let mixed = store.transaction(|uow| {
            receive_lot(
                uow,
                receipt(key, "M-1", dec!(4)),
                LotIntake::manual(MovementType::PurchaseReceipt),
                stamp,
            )
        });
        assert!(matches!(mixed, Err(LedgerError::Validation(_))));
        let lots = store.transaction(|uow| Ok(uow.lots_for(key)?)).unwrap().value;
        assert!(lots.is_empty());

        let drawn = store
            .transaction(|uow| plan_draws(uow, key, dec!(6), None, RotationStrategy::Fifo, stamp))
            .unwrap()
            .value;
        assert_eq!(
            drawn,
            vec![Draw {
                lot_id: None,
                quantity: dec!(6)
            }]
        );
    }

    #[test]
    fn quarantine_and_release_round_trip() {
        let store = InMemoryInventoryStore::new();
        let key = key();
        let stamp = Stamp::now(ActorId::new());
        let lot_id = store
            .transaction(|uow| {
                receive_lot(
                    uow,
                    receipt(key, "R-1", dec!(5)),
                    LotIntake::manual(MovementType::PurchaseReceipt),
                    stamp,
                )
            })
            .unwrap()
            .value
            .lot
            .id;

        let company = key.company_id;
        let held = store.transaction(|uow| quarantine(uow, company, lot_id, stamp)).unwrap().value;
        assert_eq!(held.status, LotStatus::Quarantined);
        let again = store.transaction(|uow| quarantine(uow, company, lot_id, stamp));
        assert!(matches!(again, Err(LedgerError::InvalidStateTransition { .. })));
        let back = store.transaction(|uow| release(uow, company, lot_id, stamp)).unwrap().value;
        assert_eq!(back.status, LotStatus::Active);
    }
}
