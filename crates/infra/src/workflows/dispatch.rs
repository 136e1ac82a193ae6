//! Dispatches: approval holds the stock, dispatch draws it, cancellation
//! gives it back.

use stockledger_core::Stamp;
use stockledger_documents::{Dispatch, DispatchChange, DispatchEvent};
use stockledger_inventory::{MovementType, NewMovement, Provenance, RotationPolicy};

use crate::error::LedgerError;
use crate::ledger;
use crate::lots::plan_draws;
use crate::store::{StockKey, UnitOfWork};
use crate::workflows::LineMovement;

pub fn fulfil(
    uow: &mut dyn UnitOfWork,
    dispatch: &Dispatch,
    events: &[DispatchEvent],
    policy: &RotationPolicy,
) -> Result<Vec<LineMovement>, LedgerError> {
    let mut out = Vec::new();
    for event in events {
        let stamp = Stamp::new(event.actor_id, event.occurred_at);
        match &event.change {
            DispatchChange::Approved {
                warehouse_id,
                lines,
            } => {
                for line in lines {
                    let key = StockKey::new(event.company_id, line.product_id, *warehouse_id);
                    ledger::reserve(uow, key, line.quantity, stamp)?;
                }
            }
            DispatchChange::Cancelled {
                warehouse_id,
                released,
                ..
            } => {
                for line in released {
                    let key = StockKey::new(event.company_id, line.product_id, *warehouse_id);
                    ledger::release(uow, key, line.quantity, stamp)?;
                }
            }
            DispatchChange::Dispatched {
                warehouse_id,
                lines,
            } => {
                for line in lines {
                    let key = StockKey::new(event.company_id, line.product_id, *warehouse_id);
                    let strategy = policy.strategy_for(line.product_id);
                    for draw in plan_draws(uow, key, line.quantity, line.lot_id, strategy, stamp)? {
                        let mut input = NewMovement::manual(
                            key.company_id,
                            key.product_id,
                            key.warehouse_id,
                            MovementType::Dispatch,
                            draw.quantity,
                        );
                        input.lot_id = draw.lot_id;
                        input.provenance = Provenance::Dispatch(event.document_id);
                        input.reference = dispatch.reference().map(str::to_string);
                        input.notes = Some(format!("dispatched to {}", dispatch.recipient()));
                        input.pre_approved = true;
                        input.from_reservation = true;
                        let movement = ledger::append(uow, input, stamp)?;
                        out.push(LineMovement::new(line.line_no, movement));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lots::{LotIntake, receive_lot};
    use crate::store::{InMemoryInventoryStore, InventoryStore};
    use crate::workflows::run;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use stockledger_core::{ActorId, CompanyId, DocumentId, ProductId, WarehouseId};
    use stockledger_documents::{
        DispatchAction, DispatchLineInput, DispatchStatus, Document, DocumentCommand,
    };
    use stockledger_inventory::{LotReceipt, RotationStrategy};

    struct Fixture {
        store: InMemoryInventoryStore,
        key: StockKey,
        document_id: DocumentId,
        policy: RotationPolicy,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryInventoryStore::new(),
                key: StockKey::new(CompanyId::new(), ProductId::new(), WarehouseId::new()),
                document_id: DocumentId::new(),
                policy: RotationPolicy::new(RotationStrategy::Fifo),
            }
        }

        fn stock_lot(&self, lot_number: &str, quantity: Decimal) {
            let receipt = LotReceipt {
                company_id: self.key.company_id,
                warehouse_id: self.key.warehouse_id,
                product_id: self.key.product_id,
                supplier_id: None,
                lot_number: lot_number.to_string(),
                manufactured_date: None,
                expiration_date: None,
                quantity,
                unit_cost: dec!(2),
                origin_lot_id: None,
            };
            self.store
                .transaction(|uow| {
                    receive_lot(
                        uow,
                        receipt,
                        LotIntake::manual(MovementType::PurchaseReceipt),
                        Stamp::now(ActorId::new()),
                    )
                })
                .unwrap();
        }

        fn act(&self, action: DispatchAction) -> Result<crate::workflows::Transitioned<Dispatch>, LedgerError> {
            let stamp = Stamp::now(ActorId::new());
            let cmd = DocumentCommand::new(self.key.company_id, self.document_id, stamp, action);
            self.store
                .transaction(|uow| {
                    run::<Dispatch, _>(uow, self.key.company_id, self.document_id, stamp, cmd, |uow, doc, evs| {
                        fulfil(uow, doc, evs, &self.policy)
                    })
                })
                .map(|c| c.value)
        }

        fn reserved(&self) -> Decimal {
            self.store
                .transaction(|uow| Ok(uow.snapshot(self.key)?.reserved_quantity))
                .unwrap()
                .value
        }
    }

    fn prepared(fx: &Fixture, quantity: Decimal) {
        fx.act(DispatchAction::Create {
            warehouse_id: fx.key.warehouse_id,
            recipient: "Clinic 4".into(),
            reference: Some("D-1".into()),
        })
        .unwrap();
        fx.act(DispatchAction::AddLine(DispatchLineInput {
            product_id: fx.key.product_id,
            quantity,
            lot_id: None,
        }))
        .unwrap();
        fx.act(DispatchAction::Submit).unwrap();
    }

    #[test]
    fn approval_holds_and_dispatch_draws_by_rotation() {
        let fx = Fixture::new();
        fx.stock_lot("A", dec!(10));
        fx.stock_lot("B", dec!(10));
        prepared(&fx, dec!(15));

        fx.act(DispatchAction::Approve).unwrap();
        assert_eq!(fx.reserved(), dec!(15));

        let done = fx.act(DispatchAction::Dispatch).unwrap();
        assert_eq!(done.document.status(), DispatchStatus::Despachado);
        assert_eq!(done.movements.len(), 2);
        let taken: Vec<Decimal> = done.movements.iter().map(|m| m.movement.quantity()).collect();
        assert_eq!(taken, vec![dec!(10), dec!(5)]);
        assert_eq!(done.document.state().movements().len(), 2);
        assert_eq!(fx.reserved(), Decimal::ZERO);
    }

    #[test]
    fn approval_beyond_stock_is_refused() {
        let fx = Fixture::new();
        fx.stock_lot("A", dec!(4));
        prepared(&fx, dec!(5));

        let err = fx.act(DispatchAction::Approve).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientInventory { .. }));
        assert_eq!(fx.reserved(), Decimal::ZERO);
    }

    #[test]
    fn cancelling_an_approved_dispatch_releases_the_hold() {
        let fx = Fixture::new();
        fx.stock_lot("A", dec!(8));
        prepared(&fx, dec!(6));
        fx.act(DispatchAction::Approve).unwrap();

        let cancelled = fx.act(DispatchAction::Cancel { reason: None }).unwrap();
        assert_eq!(cancelled.document.status(), DispatchStatus::Cancelado);
        assert_eq!(fx.reserved(), Decimal::ZERO);
    }
}
