//! Processed adjustments: one movement per positive line, rotation splits
//! for negative ones.

use stockledger_core::{CompanyId, Stamp};
use stockledger_documents::{AdjustmentChange, AdjustmentEvent, AdjustmentLine, InventoryAdjustment};
use stockledger_inventory::{
    MovementCategory, MovementType, NewMovement, Provenance, ReasonCatalog, RotationPolicy,
};

use crate::error::LedgerError;
use crate::ledger;
use crate::lots::plan_draws;
use crate::store::{StockKey, UnitOfWork};
use crate::workflows::LineMovement;

/// Movement type and reason for a line.
///
/// The header reason is used when it points the same way as the line (a
/// `damage` write-off for a negative line, say); otherwise the line falls
/// back to the default reason of its plain adjustment type.
fn classify(
    catalog: &ReasonCatalog,
    company_id: CompanyId,
    header_reason: Option<&str>,
    line: &AdjustmentLine,
) -> (MovementType, Option<String>) {
    let plain = line.movement_type();
    let Some(code) = header_reason else {
        return (plain, None);
    };
    match catalog.find(company_id, code) {
        Some(reason) if reason.movement_type.category() == plain.category() => {
            (reason.movement_type, Some(reason.code.clone()))
        }
        _ => (plain, None),
    }
}

pub fn fulfil(
    uow: &mut dyn UnitOfWork,
    _adjustment: &InventoryAdjustment,
    events: &[AdjustmentEvent],
    policy: &RotationPolicy,
) -> Result<Vec<LineMovement>, LedgerError> {
    let mut out = Vec::new();
    for event in events {
        let AdjustmentChange::Processed {
            warehouse_id,
            reason_code,
            notes,
            lines,
        } = &event.change
        else {
            continue;
        };
        let stamp = Stamp::new(event.actor_id, event.occurred_at);
        let catalog = uow.reasons(event.company_id)?;

        for line in lines {
            let key = StockKey::new(event.company_id, line.product_id, *warehouse_id);
            let (movement_type, reason) =
                classify(&catalog, event.company_id, reason_code.as_deref(), line);
            let quantity = line.quantity.abs();

            let draws = match movement_type.category() {
                MovementCategory::In => vec![crate::lots::Draw {
                    lot_id: line.lot_id,
                    quantity,
                }],
                MovementCategory::Out => plan_draws(
                    uow,
                    key,
                    quantity,
                    line.lot_id,
                    policy.strategy_for(line.product_id),
                    stamp,
                )?,
            };
            for draw in draws {
                let mut input = NewMovement::manual(
                    key.company_id,
                    key.product_id,
                    key.warehouse_id,
                    movement_type,
                    draw.quantity,
                );
                input.lot_id = draw.lot_id;
                input.unit_cost = line.unit_cost;
                input.reason_code = reason.clone();
                input.provenance = Provenance::Adjustment(event.document_id);
                input.notes = notes.clone();
                input.pre_approved = true;
                let movement = ledger::append(uow, input, stamp)?;
                out.push(LineMovement::new(line.line_no, movement));
            }
        }
    }
    Ok(out)
}
