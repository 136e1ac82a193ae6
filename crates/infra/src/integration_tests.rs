//! End-to-end tests through [`InventoryService`].
//!
//! Command -> unit of work -> ledger / lots / documents -> commit -> bus.
//!
//! Verifies:
//! - documents turn into correctly costed movements
//! - transfers pair both sides under one correlation id
//! - lot rotation honours FIFO and FEFO
//! - refused operations leave no trace
//! - a multi-line transition that fails on a later line rolls back whole
//! - an approved closure keeps the ledger from moving under it
//! - lost races are retried up to the configured bound
//! - the movement chain adds up whatever the sequence of postings

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{Duration, NaiveDate, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;

    use stockledger_closing::ClosureStatus;
    use stockledger_core::{
        ActorId, CompanyId, DocumentId, Period, ProductId, Stamp, SupplierId, WarehouseId,
    };
    use stockledger_documents::{
        AdjustmentAction, AdjustmentLineInput, DispatchAction, DispatchLineInput, DocumentKind,
        DonationAction, DonationLineInput, PurchaseAction, PurchaseLineInput, TransferAction,
        TransferLineInput, TransferStatus,
    };
    use stockledger_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
    use stockledger_inventory::{
        LotReceipt, MovementStatus, MovementType, NewMovement, Provenance, RotationStrategy,
    };

    use crate::config::LedgerConfig;
    use crate::error::LedgerError;
    use crate::ledger;
    use crate::lots::LotIntake;
    use crate::service::{DocumentAction, DocumentView, InventoryService};
    use crate::store::{
        Committed, InMemoryInventoryStore, InventoryStore, MovementFilter, Pagination, StockKey,
        UnitOfWork,
    };

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    struct Harness<S: InventoryStore> {
        service: InventoryService<S, Bus>,
        events: Subscription<EventEnvelope<JsonValue>>,
        company_id: CompanyId,
        actor: ActorId,
    }

    impl Harness<InMemoryInventoryStore> {
        fn new() -> Self {
            Self::over(InMemoryInventoryStore::new(), LedgerConfig::default())
        }
    }

    impl<S: InventoryStore> Harness<S> {
        fn over(store: S, config: LedgerConfig) -> Self {
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let events = bus.subscribe();
            Self {
                service: InventoryService::new(store, bus, config),
                events,
                company_id: CompanyId::new(),
                actor: ActorId::new(),
            }
        }

        fn key(&self, product_id: ProductId, warehouse_id: WarehouseId) -> StockKey {
            StockKey::new(self.company_id, product_id, warehouse_id)
        }

        fn receive(&self, key: StockKey, quantity: Decimal, unit_cost: Decimal) {
            let mut input = NewMovement::manual(
                key.company_id,
                key.product_id,
                key.warehouse_id,
                MovementType::PurchaseReceipt,
                quantity,
            );
            input.unit_cost = Some(unit_cost);
            self.service.append_movement(input, self.actor).unwrap();
        }

        fn lot(&self, key: StockKey, number: &str, quantity: Decimal, expires: Option<NaiveDate>) {
            let receipt = LotReceipt {
                company_id: key.company_id,
                warehouse_id: key.warehouse_id,
                product_id: key.product_id,
                supplier_id: None,
                lot_number: number.to_string(),
                manufactured_date: None,
                expiration_date: expires,
                quantity,
                unit_cost: dec!(1),
                origin_lot_id: None,
            };
            self.service
                .receive_lot(receipt, LotIntake::manual(MovementType::PurchaseReceipt), self.actor)
                .unwrap();
        }

        fn on_hand(&self, key: StockKey) -> Decimal {
            self.service.balance(key).unwrap().quantity
        }

        fn act(&self, document_id: DocumentId, action: DocumentAction) -> DocumentView {
            self.service
                .transition_document(self.company_id, document_id, action, self.actor)
                .unwrap()
                .document
        }

        fn published(&self) -> Vec<String> {
            self.events
                .drain()
                .into_iter()
                .map(|e| e.event_type().to_string())
                .collect()
        }
    }

    fn in_days(days: i64) -> NaiveDate {
        (Utc::now() + Duration::days(days)).date_naive()
    }

    #[test]
    fn purchase_receipt_enters_stock_at_cost() {
        let h = Harness::new();
        let (product, warehouse, doc) = (ProductId::new(), WarehouseId::new(), DocumentId::new());
        let purchase = |a| DocumentAction::Purchase(a);

        h.act(
            doc,
            purchase(PurchaseAction::Create {
                warehouse_id: warehouse,
                supplier_id: SupplierId::new(),
                reference: Some("PO-100".into()),
            }),
        );
        h.act(
            doc,
            purchase(PurchaseAction::AddLine(PurchaseLineInput {
                product_id: product,
                quantity: dec!(100),
                unit_cost: dec!(10),
                lot_number: None,
                manufactured_date: None,
                expiration_date: None,
            })),
        );
        h.act(doc, purchase(PurchaseAction::Submit));
        h.act(doc, purchase(PurchaseAction::Approve));
        let outcome = h
            .service
            .transition_document(h.company_id, doc, purchase(PurchaseAction::Receive), h.actor)
            .unwrap();

        assert_eq!(outcome.document.status_label(), "recibido");
        assert_eq!(outcome.movements.len(), 1);
        let m = &outcome.movements[0].movement;
        assert_eq!(m.status, MovementStatus::Completed);
        assert_eq!(m.total_cost, dec!(1000));
        assert_eq!(m.provenance, Provenance::Purchase(doc));
        assert_eq!(m.reference.as_deref(), Some("PO-100"));
        assert_eq!(outcome.document.state().movements().len(), 1);

        let key = h.key(product, warehouse);
        assert_eq!(h.on_hand(key), dec!(100));
        let snapshot = h.service.snapshot(key).unwrap();
        assert_eq!(snapshot.quantity, dec!(100));
        assert_eq!(snapshot.unit_cost, dec!(10));
        assert_eq!(snapshot.total_value, dec!(1000));

        let reloaded = h
            .service
            .document(h.company_id, DocumentKind::Purchase, doc)
            .unwrap();
        assert_eq!(reloaded, outcome.document);

        let published = h.published();
        assert!(published.iter().any(|t| t == "documents.purchase.received"));
        assert!(published.iter().any(|t| t == "inventory.movement.posted"));
    }

    #[test]
    fn transfer_moves_stock_under_one_correlation_id() {
        let h = Harness::new();
        let (product, origin, destination) = (ProductId::new(), WarehouseId::new(), WarehouseId::new());
        let (from, to) = (h.key(product, origin), h.key(product, destination));
        h.receive(from, dec!(100), dec!(4));

        let doc = DocumentId::new();
        let transfer = |a| DocumentAction::Transfer(a);
        h.act(
            doc,
            transfer(TransferAction::Create {
                origin_warehouse_id: origin,
                destination_warehouse_id: destination,
                reference: Some("TR-1".into()),
            }),
        );
        h.act(
            doc,
            transfer(TransferAction::AddLine(TransferLineInput {
                product_id: product,
                quantity: dec!(40),
                lot_id: None,
            })),
        );
        h.act(doc, transfer(TransferAction::Approve));
        h.act(doc, transfer(TransferAction::Ship { shipped: Vec::new() }));
        assert_eq!(h.on_hand(from), dec!(60));
        assert_eq!(h.on_hand(to), Decimal::ZERO);

        let received = h.act(doc, transfer(TransferAction::Receive));
        let DocumentView::Transfer(done) = received else {
            panic!("expected a transfer, got {received:?}");
        };
        assert_eq!(done.status(), TransferStatus::Received);
        assert_eq!(h.on_hand(from), dec!(60));
        assert_eq!(h.on_hand(to), dec!(40));

        let correlation = done.correlation_id().unwrap();
        let out = h
            .service
            .movements(MovementFilter::for_key(from), Pagination::default())
            .unwrap();
        let inbound = h
            .service
            .movements(MovementFilter::for_key(to), Pagination::default())
            .unwrap();
        let shipped = out
            .items
            .iter()
            .find(|m| m.movement_type == MovementType::TransferOut)
            .unwrap();
        assert_eq!(shipped.transfer_correlation_id, Some(correlation));
        assert_eq!(inbound.items.len(), 1);
        assert_eq!(inbound.items[0].movement_type, MovementType::TransferIn);
        assert_eq!(inbound.items[0].transfer_correlation_id, Some(correlation));
        assert_eq!(inbound.items[0].unit_cost, dec!(4));
    }

    #[test]
    fn fifo_draws_the_oldest_lot_first() {
        let h = Harness::new();
        let key = h.key(ProductId::new(), WarehouseId::new());
        h.lot(key, "L-OLD", dec!(5), None);
        h.lot(key, "L-NEW", dec!(5), None);

        let picks = h
            .service
            .select_lots(
                key.company_id,
                key.product_id,
                key.warehouse_id,
                dec!(7),
                Some(RotationStrategy::Fifo),
                h.actor,
            )
            .unwrap();
        let drawn: Vec<(&str, Decimal)> =
            picks.iter().map(|a| (a.lot_number.as_str(), a.quantity)).collect();
        assert_eq!(drawn, vec![("L-OLD", dec!(5)), ("L-NEW", dec!(2))]);
    }

    #[test]
    fn fefo_draws_the_earliest_expiry_first() {
        let h = Harness::new();
        let key = h.key(ProductId::new(), WarehouseId::new());
        h.lot(key, "L-LATE", dec!(5), Some(in_days(90)));
        h.lot(key, "L-SOON", dec!(5), Some(in_days(10)));

        let picks = h
            .service
            .select_lots(
                key.company_id,
                key.product_id,
                key.warehouse_id,
                dec!(6),
                Some(RotationStrategy::Fefo),
                h.actor,
            )
            .unwrap();
        assert_eq!(picks[0].lot_number, "L-SOON");
        assert_eq!(picks[0].quantity, dec!(5));
        assert_eq!(picks[1].lot_number, "L-LATE");
        assert_eq!(picks[1].quantity, dec!(1));

        // Selection is advisory: nothing was consumed.
        assert_eq!(h.on_hand(key), dec!(10));
    }

    #[test]
    fn refused_outbound_leaves_no_trace() {
        let h = Harness::new();
        let key = h.key(ProductId::new(), WarehouseId::new());
        h.receive(key, dec!(3), dec!(1));
        h.published();

        let input = NewMovement::manual(
            key.company_id,
            key.product_id,
            key.warehouse_id,
            MovementType::Dispatch,
            dec!(5),
        );
        let err = h.service.append_movement(input, h.actor).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientInventory {
                requested: dec!(5),
                available: dec!(3)
            }
        );

        let page = h
            .service
            .movements(MovementFilter::for_key(key), Pagination::default())
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(h.on_hand(key), dec!(3));
        assert!(h.published().is_empty());
    }

    #[test]
    fn callers_cannot_forge_document_movements() {
        let h = Harness::new();
        let key = h.key(ProductId::new(), WarehouseId::new());
        let mut input = NewMovement::manual(
            key.company_id,
            key.product_id,
            key.warehouse_id,
            MovementType::PurchaseReceipt,
            dec!(1),
        );
        input.provenance = Provenance::Purchase(DocumentId::new());
        let err = h.service.append_movement(input, h.actor).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let link = DocumentAction::Purchase(PurchaseAction::LinkMovements { links: Vec::new() });
        let err = h
            .service
            .transition_document(h.company_id, DocumentId::new(), link, h.actor)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn repeating_a_fulfilling_transition_records_nothing_twice() {
        let h = Harness::new();
        let (product, warehouse, doc) = (ProductId::new(), WarehouseId::new(), DocumentId::new());
        let purchase = |a| DocumentAction::Purchase(a);
        h.act(
            doc,
            purchase(PurchaseAction::Create {
                warehouse_id: warehouse,
                supplier_id: SupplierId::new(),
                reference: None,
            }),
        );
        h.act(
            doc,
            purchase(PurchaseAction::AddLine(PurchaseLineInput {
                product_id: product,
                quantity: dec!(5),
                unit_cost: dec!(2),
                lot_number: Some("B-1".into()),
                manufactured_date: None,
                expiration_date: None,
            })),
        );
        h.act(doc, purchase(PurchaseAction::Submit));
        h.act(doc, purchase(PurchaseAction::Approve));
        h.act(doc, purchase(PurchaseAction::Receive));

        let again = h.service.transition_document(
            h.company_id,
            doc,
            purchase(PurchaseAction::Receive),
            h.actor,
        );
        assert!(matches!(again, Err(LedgerError::InvalidStateTransition { .. })));

        let key = h.key(product, warehouse);
        assert_eq!(h.on_hand(key), dec!(5));
        assert_eq!(h.service.lot_balances(key).unwrap().len(), 1);
    }

    #[test]
    fn closing_a_period_freezes_it() {
        let h = Harness::new();
        let key = h.key(ProductId::new(), WarehouseId::new());
        h.receive(key, dec!(20), dec!(3));
        let period = Period::containing(Utc::now());

        let closure = h
            .service
            .open_closure(h.company_id, key.warehouse_id, period.year(), period.month(), h.actor)
            .unwrap();
        let processed = h.service.process_closure(h.company_id, closure.id, h.actor).unwrap();
        assert_eq!(processed.details.len(), 1);
        assert_eq!(processed.details[0].calculated_quantity, dec!(20));
        assert_eq!(processed.details[0].calculated_value, dec!(60));

        let counted = h
            .service
            .record_physical_count(h.company_id, closure.id, key.product_id, dec!(18), h.actor)
            .unwrap();
        assert_eq!(counted.discrepancy_quantity, dec!(-2));

        h.service.approve_closure(h.company_id, closure.id, h.actor).unwrap();
        let closed = h.service.close_closure(h.company_id, closure.id, h.actor).unwrap();
        assert_eq!(closed.status, ClosureStatus::Cerrado);

        let mut late = NewMovement::manual(
            key.company_id,
            key.product_id,
            key.warehouse_id,
            MovementType::PurchaseReceipt,
            dec!(1),
        );
        late.unit_cost = Some(dec!(3));
        let refused = h.service.append_movement(late, h.actor);
        assert!(matches!(refused, Err(LedgerError::Validation(_))));

        let view = h.service.closure(h.company_id, closure.id).unwrap();
        assert_eq!(view.details[0].physical_quantity, Some(dec!(18)));

        let empty_reason = h
            .service
            .reopen_closure(h.company_id, closure.id, String::new(), h.actor);
        assert!(matches!(empty_reason, Err(LedgerError::Validation(_))));
        h.service
            .reopen_closure(h.company_id, closure.id, "late invoice".into(), h.actor)
            .unwrap();
    }

    #[test]
    fn an_approved_closure_keeps_later_postings_out() {
        let h = Harness::new();
        let key = h.key(ProductId::new(), WarehouseId::new());
        h.receive(key, dec!(20), dec!(3));
        let period = Period::containing(Utc::now());

        let closure = h
            .service
            .open_closure(h.company_id, key.warehouse_id, period.year(), period.month(), h.actor)
            .unwrap();
        h.service.process_closure(h.company_id, closure.id, h.actor).unwrap();
        h.service.approve_closure(h.company_id, closure.id, h.actor).unwrap();

        let mut late = NewMovement::manual(
            key.company_id,
            key.product_id,
            key.warehouse_id,
            MovementType::PurchaseReceipt,
            dec!(5),
        );
        late.unit_cost = Some(dec!(3));
        let refused = h.service.append_movement(late, h.actor);
        assert!(matches!(refused, Err(LedgerError::Validation(_))));

        h.service.close_closure(h.company_id, closure.id, h.actor).unwrap();
        let view = h.service.closure(h.company_id, closure.id).unwrap();
        assert_eq!(view.details[0].calculated_quantity, dec!(20));
        assert_eq!(h.on_hand(key), dec!(20));
        let snapshot = h.service.snapshot(key).unwrap();
        assert_eq!(snapshot.quantity, dec!(20));
        assert_eq!(snapshot.last_count_quantity, Some(dec!(20)));
    }

    #[test]
    fn a_later_line_failing_rolls_the_whole_adjustment_back() {
        let h = Harness::new();
        let warehouse = WarehouseId::new();
        let (tracked, short) = (h.key(ProductId::new(), warehouse), h.key(ProductId::new(), warehouse));
        h.lot(tracked, "A-1", dec!(10), None);
        h.receive(short, dec!(2), dec!(1));

        let doc = DocumentId::new();
        let adjust = |a| DocumentAction::Adjustment(a);
        h.act(
            doc,
            adjust(AdjustmentAction::Create {
                warehouse_id: warehouse,
                reason_code: None,
                notes: Some("cycle count".into()),
            }),
        );
        for (key, quantity) in [(tracked, dec!(-4)), (short, dec!(-5))] {
            h.act(
                doc,
                adjust(AdjustmentAction::AddLine(AdjustmentLineInput {
                    product_id: key.product_id,
                    quantity,
                    lot_id: None,
                    unit_cost: None,
                })),
            );
        }
        h.act(doc, adjust(AdjustmentAction::Submit));
        h.act(doc, adjust(AdjustmentAction::Approve));

        let snapshots = (h.service.snapshot(tracked).unwrap(), h.service.snapshot(short).unwrap());
        let lots = h.service.lot_balances(tracked).unwrap();
        h.published();

        let err = h
            .service
            .transition_document(h.company_id, doc, adjust(AdjustmentAction::Process), h.actor)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientInventory {
                requested: dec!(5),
                available: dec!(2)
            }
        );

        for key in [tracked, short] {
            let page = h
                .service
                .movements(MovementFilter::for_key(key), Pagination::default())
                .unwrap();
            assert_eq!(page.total, 1, "only the opening receipt is on record");
        }
        assert_eq!(h.service.snapshot(tracked).unwrap(), snapshots.0);
        assert_eq!(h.service.snapshot(short).unwrap(), snapshots.1);
        assert_eq!(h.service.lot_balances(tracked).unwrap(), lots);

        let document = h
            .service
            .document(h.company_id, DocumentKind::Adjustment, doc)
            .unwrap();
        assert_eq!(document.status_label(), "aprobado");
        assert!(document.state().movements().is_empty());
        assert!(h.published().is_empty());
    }

    #[test]
    fn a_later_line_failing_holds_nothing_for_the_dispatch() {
        let h = Harness::new();
        let warehouse = WarehouseId::new();
        let (tracked, short) = (h.key(ProductId::new(), warehouse), h.key(ProductId::new(), warehouse));
        h.lot(tracked, "D-1", dec!(10), None);
        h.receive(short, dec!(2), dec!(1));

        let doc = DocumentId::new();
        let dispatch = |a| DocumentAction::Dispatch(a);
        h.act(
            doc,
            dispatch(DispatchAction::Create {
                warehouse_id: warehouse,
                recipient: "Shelter 9".into(),
                reference: None,
            }),
        );
        for (key, quantity) in [(tracked, dec!(6)), (short, dec!(5))] {
            h.act(
                doc,
                dispatch(DispatchAction::AddLine(DispatchLineInput {
                    product_id: key.product_id,
                    quantity,
                    lot_id: None,
                })),
            );
        }
        h.act(doc, dispatch(DispatchAction::Submit));

        let err = h
            .service
            .transition_document(h.company_id, doc, dispatch(DispatchAction::Approve), h.actor)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientInventory { .. }));

        let held = h.service.snapshot(tracked).unwrap();
        assert_eq!(held.reserved_quantity, Decimal::ZERO);
        assert_eq!(held.available_quantity, dec!(10));
        let document = h
            .service
            .document(h.company_id, DocumentKind::Dispatch, doc)
            .unwrap();
        assert_eq!(document.status_label(), "pendiente");
    }

    #[test]
    fn donation_receipt_enters_stock_with_and_without_a_lot() {
        let h = Harness::new();
        let warehouse = WarehouseId::new();
        let (loose, batched) = (h.key(ProductId::new(), warehouse), h.key(ProductId::new(), warehouse));
        let doc = DocumentId::new();
        let donate = |a| DocumentAction::Donation(a);

        h.act(
            doc,
            donate(DonationAction::Create {
                warehouse_id: warehouse,
                donor: "Food Bank North".into(),
                reference: Some("DON-12".into()),
            }),
        );
        h.act(
            doc,
            donate(DonationAction::AddLine(DonationLineInput {
                product_id: loose.product_id,
                quantity: dec!(10),
                unit_value: dec!(2.5),
                lot_number: None,
                manufactured_date: None,
                expiration_date: None,
            })),
        );
        h.act(
            doc,
            donate(DonationAction::AddLine(DonationLineInput {
                product_id: batched.product_id,
                quantity: dec!(4),
                unit_value: dec!(5),
                lot_number: Some("DN-1".into()),
                manufactured_date: None,
                expiration_date: Some(in_days(60)),
            })),
        );
        assert_eq!(h.act(doc, donate(DonationAction::Submit)).status_label(), "pendiente");
        assert_eq!(h.act(doc, donate(DonationAction::Approve)).status_label(), "aprobado");

        let outcome = h
            .service
            .transition_document(h.company_id, doc, donate(DonationAction::Receive), h.actor)
            .unwrap();
        assert_eq!(outcome.document.status_label(), "recibido");
        assert_eq!(outcome.movements.len(), 2);
        for line in &outcome.movements {
            let m = &line.movement;
            assert_eq!(m.movement_type, MovementType::DonationReceipt);
            assert_eq!(m.status, MovementStatus::Completed);
            assert_eq!(m.provenance, Provenance::Donation(doc));
            assert_eq!(m.reference.as_deref(), Some("DON-12"));
        }
        assert_eq!(outcome.movements[0].movement.lot_id, None);
        assert_eq!(outcome.document.state().movements().len(), 2);

        assert_eq!(h.on_hand(loose), dec!(10));
        let snapshot = h.service.snapshot(loose).unwrap();
        assert_eq!(snapshot.unit_cost, dec!(2.5));
        assert_eq!(snapshot.total_value, dec!(25));
        assert!(h.service.lot_balances(loose).unwrap().is_empty());

        assert_eq!(h.on_hand(batched), dec!(4));
        assert_eq!(h.service.snapshot(batched).unwrap().total_value, dec!(20));
        let lots = h.service.lot_balances(batched).unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].lot_number, "DN-1");
        assert_eq!(lots[0].quantity_remaining, dec!(4));
        assert_eq!(outcome.movements[1].movement.lot_id, Some(lots[0].id));

        assert!(h.published().iter().any(|t| t == "documents.donation.received"));
    }

    /// Lets `races` competing receipts commit on `key` while a unit of work
    /// is in flight, so that unit of work loses its race.
    struct RacingStore {
        inner: InMemoryInventoryStore,
        key: StockKey,
        races: AtomicU32,
    }

    impl InventoryStore for RacingStore {
        fn transaction<T, F>(&self, work: F) -> Result<Committed<T>, LedgerError>
        where
            F: FnOnce(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
        {
            self.inner.transaction(|uow| {
                let value = work(uow)?;
                if self.races.load(Ordering::SeqCst) > 0 {
                    self.races.fetch_sub(1, Ordering::SeqCst);
                    let mut rival = NewMovement::manual(
                        self.key.company_id,
                        self.key.product_id,
                        self.key.warehouse_id,
                        MovementType::PurchaseReceipt,
                        dec!(1),
                    );
                    rival.unit_cost = Some(dec!(1));
                    self.inner
                        .transaction(|other| ledger::append(other, rival, Stamp::now(ActorId::new())))?;
                }
                Ok(value)
            })
        }
    }

    fn racing(races: u32, max_conflict_retries: u32) -> Harness<RacingStore> {
        let mut h = Harness::over(
            RacingStore {
                inner: InMemoryInventoryStore::new(),
                key: StockKey::new(CompanyId::new(), ProductId::new(), WarehouseId::new()),
                races: AtomicU32::new(races),
            },
            LedgerConfig {
                max_conflict_retries,
                ..LedgerConfig::default()
            },
        );
        h.company_id = h.service.store().key.company_id;
        h
    }

    #[test]
    fn a_lost_race_is_retried() {
        let h = racing(1, 3);
        let key = h.service.store().key;
        h.receive(key, dec!(10), dec!(1));

        // One rival receipt of 1 and our 10; no double posting.
        assert_eq!(h.on_hand(key), dec!(11));
        let report = h.service.verify_chain(key).unwrap();
        assert!(report.is_intact());
        assert_eq!(report.movements, 2);
    }

    #[test]
    fn retries_stop_at_the_configured_bound() {
        let h = racing(10, 2);
        let key = h.service.store().key;
        let mut input = NewMovement::manual(
            key.company_id,
            key.product_id,
            key.warehouse_id,
            MovementType::PurchaseReceipt,
            dec!(10),
        );
        input.unit_cost = Some(dec!(1));

        let err = h.service.append_movement(input, h.actor).unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyConflict(_)));
        // Three attempts, three rivals committed; ours never did.
        assert_eq!(h.service.store().races.load(Ordering::SeqCst), 7);
        h.service.store().races.store(0, Ordering::SeqCst);
        assert_eq!(h.on_hand(key), dec!(3));
        assert!(h.published().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Step {
        In(u32),
        Out(u32),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![(1u32..50).prop_map(Step::In), (1u32..50).prop_map(Step::Out)]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn chain_balances_follow_accepted_postings(steps in prop::collection::vec(step(), 1..12)) {
            let h = Harness::new();
            let key = h.key(ProductId::new(), WarehouseId::new());
            let mut expected = Decimal::ZERO;

            for s in &steps {
                let (movement_type, quantity) = match s {
                    Step::In(q) => (MovementType::AdjustmentIn, Decimal::from(*q)),
                    Step::Out(q) => (MovementType::AdjustmentOut, Decimal::from(*q)),
                };
                let mut input = NewMovement::manual(
                    key.company_id,
                    key.product_id,
                    key.warehouse_id,
                    movement_type,
                    quantity,
                );
                input.unit_cost = Some(dec!(1));
                match h.service.append_movement(input, h.actor) {
                    Ok(m) => {
                        prop_assert_eq!(m.previous_quantity, expected);
                        expected += m.signed_quantity();
                        prop_assert_eq!(m.balance_quantity, expected);
                    }
                    Err(LedgerError::InsufficientInventory { .. }) => {
                        prop_assert!(quantity > expected);
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                }
                prop_assert!(expected >= Decimal::ZERO);
            }

            let report = h.service.verify_chain(key).unwrap();
            prop_assert!(report.is_intact());
            prop_assert_eq!(report.balance, expected);
            prop_assert_eq!(h.on_hand(key), expected);

            let history = h
                .service
                .movements(MovementFilter::for_key(key), Pagination::new(Some(1000), None))
                .unwrap();
            let dates: Vec<_> = history.items.iter().map(|m| m.movement_date).collect();
            prop_assert!(dates.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
