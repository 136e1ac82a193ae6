//! Purchase receipts.

use stockledger_core::Stamp;
use stockledger_documents::{Purchase, PurchaseChange, PurchaseEvent};
use stockledger_inventory::{MovementType, Provenance};

use crate::error::LedgerError;
use crate::lots::LotIntake;
use crate::store::{StockKey, UnitOfWork};
use crate::workflows::{Arrival, LineMovement, receive};

/// Receiving a purchase brings every line into stock at its purchase cost.
pub fn fulfil(
    uow: &mut dyn UnitOfWork,
    purchase: &Purchase,
    events: &[PurchaseEvent],
) -> Result<Vec<LineMovement>, LedgerError> {
    let mut out = Vec::new();
    for event in events {
        let PurchaseChange::Received {
            warehouse_id,
            supplier_id,
            lines,
        } = &event.change
        else {
            continue;
        };
        let stamp = Stamp::new(event.actor_id, event.occurred_at);
        for line in lines {
            let intake = LotIntake {
                reference: purchase.reference().map(str::to_string),
                ..LotIntake::manual(MovementType::PurchaseReceipt)
                    .with_provenance(Provenance::Purchase(event.document_id))
            };
            let arrival = Arrival {
                key: StockKey::new(event.company_id, line.product_id, *warehouse_id),
                supplier_id: Some(*supplier_id),
                quantity: line.quantity,
                unit_cost: line.unit_cost,
                lot_number: line.lot_number.clone(),
                manufactured_date: line.manufactured_date,
                expiration_date: line.expiration_date,
            };
            let movement = receive(uow, arrival, intake, stamp)?;
            out.push(LineMovement::new(line.line_no, movement));
        }
    }
    Ok(out)
}
