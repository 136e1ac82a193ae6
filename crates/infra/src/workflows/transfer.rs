//! Transfers between warehouses.
//!
//! Shipping records one `transfer_out` per lot split at the origin; receiving
//! records the paired `transfer_in` legs at the destination. Both sides carry
//! the transfer's correlation id, and a shipped lot arrives as a new lot with
//! the same number that points back to its origin lot.

use stockledger_core::Stamp;
use stockledger_documents::{InventoryTransfer, TransferChange, TransferEvent};
use stockledger_inventory::{LotReceipt, MovementType, NewMovement, Provenance, RotationPolicy};

use crate::error::LedgerError;
use crate::ledger;
use crate::lots::{LotIntake, plan_draws, receive_lot};
use crate::store::{StockKey, UnitOfWork};
use crate::workflows::LineMovement;

pub fn fulfil(
    uow: &mut dyn UnitOfWork,
    transfer: &InventoryTransfer,
    events: &[TransferEvent],
    policy: &RotationPolicy,
) -> Result<Vec<LineMovement>, LedgerError> {
    let mut out = Vec::new();
    for event in events {
        let stamp = Stamp::new(event.actor_id, event.occurred_at);
        let provenance = Provenance::Transfer(event.document_id);
        match &event.change {
            TransferChange::Shipped {
                origin_warehouse_id,
                correlation_id,
                lines,
            } => {
                for line in lines.iter().filter(|l| !l.quantity.is_zero()) {
                    let key = StockKey::new(event.company_id, line.product_id, *origin_warehouse_id);
                    let strategy = policy.strategy_for(line.product_id);
                    for draw in plan_draws(uow, key, line.quantity, line.lot_id, strategy, stamp)? {
                        let mut input = NewMovement::manual(
                            key.company_id,
                            key.product_id,
                            key.warehouse_id,
                            MovementType::TransferOut,
                            draw.quantity,
                        );
                        input.lot_id = draw.lot_id;
                        input.provenance = provenance;
                        input.transfer_correlation_id = Some(*correlation_id);
                        input.reference = transfer.reference().map(str::to_string);
                        input.pre_approved = true;
                        let movement = ledger::append(uow, input, stamp)?;
                        out.push(LineMovement::new(line.line_no, movement));
                    }
                }
            }
            TransferChange::Received {
                destination_warehouse_id,
                correlation_id,
                legs,
                discrepancies,
            } => {
                for d in discrepancies.iter().filter(|d| !d.discrepancy.is_zero()) {
                    tracing::warn!(
                        transfer_id = %event.document_id,
                        line_no = d.line_no,
                        requested = %d.requested,
                        shipped = %d.shipped,
                        "transfer received with a discrepancy"
                    );
                }
                for leg in legs {
                    let key =
                        StockKey::new(event.company_id, leg.product_id, *destination_warehouse_id);
                    let intake = LotIntake {
                        transfer_correlation_id: Some(*correlation_id),
                        reference: transfer.reference().map(str::to_string),
                        ..LotIntake::manual(MovementType::TransferIn).with_provenance(provenance)
                    };
                    let movement = match leg.origin_lot_id {
                        Some(origin_lot_id) => {
                            let origin = uow.lot(event.company_id, origin_lot_id)?.ok_or_else(
                                || LedgerError::not_found(format!("lot {origin_lot_id}")),
                            )?;
                            let receipt = LotReceipt {
                                company_id: key.company_id,
                                warehouse_id: key.warehouse_id,
                                product_id: key.product_id,
                                supplier_id: origin.supplier_id,
                                lot_number: origin.lot_number,
                                manufactured_date: origin.manufactured_date,
                                expiration_date: origin.expiration_date,
                                quantity: leg.quantity,
                                unit_cost: leg.unit_cost,
                                origin_lot_id: Some(origin_lot_id),
                            };
                            receive_lot(uow, receipt, intake, stamp)?.movement
                        }
                        None => {
                            let mut input = NewMovement::manual(
                                key.company_id,
                                key.product_id,
                                key.warehouse_id,
                                MovementType::TransferIn,
                                leg.quantity,
                            );
                            input.unit_cost = Some(leg.unit_cost);
                            input.provenance = provenance;
                            input.transfer_correlation_id = intake.transfer_correlation_id;
                            input.reference = intake.reference;
                            input.pre_approved = true;
                            ledger::append(uow, input, stamp)?
                        }
                    };
                    out.push(LineMovement::new(leg.line_no, movement));
                }
            }
            _ => {}
        }
    }
    Ok(out)
}
