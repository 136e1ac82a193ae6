//! Donation receipts. Donations only ever bring stock in.

use stockledger_core::Stamp;
use stockledger_documents::{Donation, DonationChange, DonationEvent};
use stockledger_inventory::{MovementType, Provenance};

use crate::error::LedgerError;
use crate::lots::LotIntake;
use crate::store::{StockKey, UnitOfWork};
use crate::workflows::{Arrival, LineMovement, receive};

pub fn fulfil(
    uow: &mut dyn UnitOfWork,
    donation: &Donation,
    events: &[DonationEvent],
) -> Result<Vec<LineMovement>, LedgerError> {
    let mut out = Vec::new();
    for event in events {
        let DonationChange::Received {
            warehouse_id,
            lines,
        } = &event.change
        else {
            continue;
        };
        let stamp = Stamp::new(event.actor_id, event.occurred_at);
        for line in lines {
            let intake = LotIntake {
                reference: donation.reference().map(str::to_string),
                notes: Some(format!("donated by {}", donation.donor())),
                ..LotIntake::manual(MovementType::DonationReceipt)
                    .with_provenance(Provenance::Donation(event.document_id))
            };
            let arrival = Arrival {
                key: StockKey::new(event.company_id, line.product_id, *warehouse_id),
                supplier_id: None,
                quantity: line.quantity,
                unit_cost: line.unit_value,
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
