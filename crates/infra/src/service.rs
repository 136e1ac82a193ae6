//! `InventoryService`: the entry point callers use.
//!
//! Every operation is one unit of work on the store, retried on concurrency
//! conflicts up to the configured bound. Events the unit of work queued are
//! published on the bus only after it committed; a publish failure is logged
//! and does not undo the operation.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tracing::instrument;

use stockledger_closing::{ClosureDetail, InventoryClosure};
use stockledger_core::{
    ActorId, AggregateRoot, ClosureId, CompanyId, DocumentId, LotId, MovementId, Period, ProductId,
    Stamp, WarehouseId,
};
use stockledger_documents::{
    AdjustmentAction, DispatchAction, Dispatch, Document, DocumentCommand, DocumentKind,
    DocumentState, DonationAction, Donation, InventoryAdjustment, InventoryTransfer, Purchase,
    PurchaseAction, TransferAction,
};
use stockledger_events::{EventBus, EventEnvelope};
use stockledger_inventory::{
    ChainReport, InventoryMovement, InventorySnapshot, LotAllocation, LotReceipt, MovementReason,
    NewMovement, ProductLot, Provenance, RotationPolicy, RotationStrategy, StockBalance,
};

use crate::closure_engine::{self, ClosureSettings};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::ledger;
use crate::lots::{self, LotIntake, ReceivedLot};
use crate::retry::with_retries;
use crate::store::{InventoryStore, MovementFilter, Page, Pagination, StockKey, UnitOfWork};
use crate::workflows::{self, LineMovement, Transitioned};

/// A command for one of the five document types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentAction {
    Purchase(PurchaseAction),
    Dispatch(DispatchAction),
    Donation(DonationAction),
    Adjustment(AdjustmentAction),
    Transfer(TransferAction),
}

impl DocumentAction {
    pub fn kind(&self) -> DocumentKind {
        match self {
            DocumentAction::Purchase(_) => DocumentKind::Purchase,
            DocumentAction::Dispatch(_) => DocumentKind::Dispatch,
            DocumentAction::Donation(_) => DocumentKind::Donation,
            DocumentAction::Adjustment(_) => DocumentKind::Adjustment,
            DocumentAction::Transfer(_) => DocumentKind::Transfer,
        }
    }

    /// Links are written by the workflows, never by callers.
    fn is_link(&self) -> bool {
        matches!(
            self,
            DocumentAction::Purchase(PurchaseAction::LinkMovements { .. })
                | DocumentAction::Dispatch(DispatchAction::LinkMovements { .. })
                | DocumentAction::Donation(DonationAction::LinkMovements { .. })
                | DocumentAction::Adjustment(AdjustmentAction::LinkMovements { .. })
                | DocumentAction::Transfer(TransferAction::LinkMovements { .. })
        )
    }
}

/// Current state of a document of any type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentView {
    Purchase(Purchase),
    Dispatch(Dispatch),
    Donation(Donation),
    Adjustment(InventoryAdjustment),
    Transfer(InventoryTransfer),
}

impl DocumentView {
    pub fn kind(&self) -> DocumentKind {
        match self {
            DocumentView::Purchase(_) => DocumentKind::Purchase,
            DocumentView::Dispatch(_) => DocumentKind::Dispatch,
            DocumentView::Donation(_) => DocumentKind::Donation,
            DocumentView::Adjustment(_) => DocumentKind::Adjustment,
            DocumentView::Transfer(_) => DocumentKind::Transfer,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            DocumentView::Purchase(d) => d.status_label(),
            DocumentView::Dispatch(d) => d.status_label(),
            DocumentView::Donation(d) => d.status_label(),
            DocumentView::Adjustment(d) => d.status_label(),
            DocumentView::Transfer(d) => d.status_label(),
        }
    }

    pub fn state(&self) -> &DocumentState {
        match self {
            DocumentView::Purchase(d) => d.state(),
            DocumentView::Dispatch(d) => d.state(),
            DocumentView::Donation(d) => d.state(),
            DocumentView::Adjustment(d) => d.state(),
            DocumentView::Transfer(d) => d.state(),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            DocumentView::Purchase(d) => d.version(),
            DocumentView::Dispatch(d) => d.version(),
            DocumentView::Donation(d) => d.version(),
            DocumentView::Adjustment(d) => d.version(),
            DocumentView::Transfer(d) => d.version(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentOutcome {
    pub document: DocumentView,
    /// Movements the transition recorded, in line order.
    pub movements: Vec<LineMovement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureView {
    pub closure: InventoryClosure,
    pub details: Vec<ClosureDetail>,
}

pub struct InventoryService<S, B> {
    store: S,
    bus: B,
    config: LedgerConfig,
    policy: RotationPolicy,
}

impl<S, B> core::fmt::Debug for InventoryService<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InventoryService")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn drive<D, A>(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    document_id: DocumentId,
    stamp: Stamp,
    action: A,
    fulfil: impl FnOnce(&mut dyn UnitOfWork, &D, &[D::Event]) -> Result<Vec<LineMovement>, LedgerError>,
    view: impl FnOnce(D) -> DocumentView,
) -> Result<DocumentOutcome, LedgerError>
where
    D: Document<Command = DocumentCommand<A>>,
    D::Event: stockledger_events::Event + serde::Serialize + serde::de::DeserializeOwned,
{
    let command = DocumentCommand::new(company_id, document_id, stamp, action);
    let Transitioned {
        document,
        movements,
        ..
    } = workflows::run::<D, _>(uow, company_id, document_id, stamp, command, fulfil)?;
    Ok(DocumentOutcome {
        document: view(document),
        movements,
    })
}

fn read<D>(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    document_id: DocumentId,
    view: impl FnOnce(D) -> DocumentView,
) -> Result<DocumentView, LedgerError>
where
    D: Document,
    D::Event: serde::de::DeserializeOwned,
{
    let (document, _) = workflows::load::<D>(uow, company_id, document_id)?;
    if document.state().created().is_none() {
        return Err(LedgerError::not_found(format!(
            "{} {document_id}",
            D::KIND.aggregate_type()
        )));
    }
    Ok(view(document))
}

impl<S, B> InventoryService<S, B>
where
    S: InventoryStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(store: S, bus: B, config: LedgerConfig) -> Self {
        let policy = config.rotation_policy();
        Self {
            store,
            bus,
            config,
            policy,
        }
    }

    /// Replace the rotation policy (per-product overrides).
    pub fn with_policy(mut self, policy: RotationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn closure_settings(&self) -> ClosureSettings {
        ClosureSettings {
            page_size: self.config.closure_page_size,
            tolerance: self.config.discrepancy_tolerance,
        }
    }

    /// One unit of work, retried on conflicts, published after commit.
    fn run<T>(
        &self,
        operation: &'static str,
        mut work: impl FnMut(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let committed = with_retries(operation, self.config.max_conflict_retries, || {
            self.store.transaction(|uow| work(uow))
        })?;
        for event in committed.events {
            let event_type = event.event_type().to_string();
            if let Err(err) = self.bus.publish(event) {
                tracing::warn!(operation, event_type = %event_type, error = ?err, "publish after commit failed");
            }
        }
        Ok(committed.value)
    }

    // movements

    #[instrument(
        skip(self, input),
        fields(
            company_id = %input.company_id,
            product_id = %input.product_id,
            warehouse_id = %input.warehouse_id,
            movement_type = %input.movement_type
        ),
        err
    )]
    pub fn append_movement(
        &self,
        input: NewMovement,
        actor: ActorId,
    ) -> Result<InventoryMovement, LedgerError> {
        if input.provenance != Provenance::Manual {
            return Err(LedgerError::validation(
                "document movements are recorded through document transitions",
            ));
        }
        if input.pre_approved || input.from_reservation {
            return Err(LedgerError::validation(
                "pre-approved and reservation draws are reserved for document workflows",
            ));
        }
        let stamp = Stamp::now(actor);
        self.run("append_movement", |uow| ledger::append(uow, input.clone(), stamp))
    }

    #[instrument(skip(self), err)]
    pub fn approve_movement(
        &self,
        company_id: CompanyId,
        movement_id: MovementId,
        actor: ActorId,
    ) -> Result<InventoryMovement, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("approve_movement", |uow| ledger::approve(uow, company_id, movement_id, stamp))
    }

    #[instrument(skip(self), err)]
    pub fn reject_movement(
        &self,
        company_id: CompanyId,
        movement_id: MovementId,
        reason: Option<String>,
        actor: ActorId,
    ) -> Result<InventoryMovement, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("reject_movement", |uow| {
            ledger::reject(uow, company_id, movement_id, reason.clone(), stamp)
        })
    }

    #[instrument(skip(self), err)]
    pub fn complete_movement(
        &self,
        company_id: CompanyId,
        movement_id: MovementId,
        actor: ActorId,
    ) -> Result<InventoryMovement, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("complete_movement", |uow| ledger::complete(uow, company_id, movement_id, stamp))
    }

    #[instrument(skip(self), err)]
    pub fn cancel_movement(
        &self,
        company_id: CompanyId,
        movement_id: MovementId,
        actor: ActorId,
    ) -> Result<InventoryMovement, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("cancel_movement", |uow| ledger::cancel(uow, company_id, movement_id, stamp))
    }

    #[instrument(skip(self), err)]
    pub fn record_quality_check(
        &self,
        company_id: CompanyId,
        movement_id: MovementId,
        passed: bool,
        actor: ActorId,
    ) -> Result<InventoryMovement, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("record_quality_check", |uow| {
            ledger::record_quality_check(uow, company_id, movement_id, passed, stamp)
        })
    }

    // documents

    #[instrument(skip(self, action), fields(kind = ?action.kind()), err)]
    pub fn transition_document(
        &self,
        company_id: CompanyId,
        document_id: DocumentId,
        action: DocumentAction,
        actor: ActorId,
    ) -> Result<DocumentOutcome, LedgerError> {
        if action.is_link() {
            return Err(LedgerError::validation(
                "movement links are recorded by the ledger",
            ));
        }
        let stamp = Stamp::now(actor);
        let policy = &self.policy;
        self.run("transition_document", |uow| match action.clone() {
            DocumentAction::Purchase(a) => drive::<Purchase, _>(
                uow,
                company_id,
                document_id,
                stamp,
                a,
                workflows::purchase::fulfil,
                DocumentView::Purchase,
            ),
            DocumentAction::Dispatch(a) => drive::<Dispatch, _>(
                uow,
                company_id,
                document_id,
                stamp,
                a,
                |uow, d, evs| workflows::dispatch::fulfil(uow, d, evs, policy),
                DocumentView::Dispatch,
            ),
            DocumentAction::Donation(a) => drive::<Donation, _>(
                uow,
                company_id,
                document_id,
                stamp,
                a,
                workflows::donation::fulfil,
                DocumentView::Donation,
            ),
            DocumentAction::Adjustment(a) => drive::<InventoryAdjustment, _>(
                uow,
                company_id,
                document_id,
                stamp,
                a,
                |uow, d, evs| workflows::adjustment::fulfil(uow, d, evs, policy),
                DocumentView::Adjustment,
            ),
            DocumentAction::Transfer(a) => drive::<InventoryTransfer, _>(
                uow,
                company_id,
                document_id,
                stamp,
                a,
                |uow, d, evs| workflows::transfer::fulfil(uow, d, evs, policy),
                DocumentView::Transfer,
            ),
        })
    }

    #[instrument(skip(self), err)]
    pub fn document(
        &self,
        company_id: CompanyId,
        kind: DocumentKind,
        document_id: DocumentId,
    ) -> Result<DocumentView, LedgerError> {
        self.run("document", |uow| match kind {
            DocumentKind::Purchase => read::<Purchase>(uow, company_id, document_id, DocumentView::Purchase),
            DocumentKind::Dispatch => read::<Dispatch>(uow, company_id, document_id, DocumentView::Dispatch),
            DocumentKind::Donation => read::<Donation>(uow, company_id, document_id, DocumentView::Donation),
            DocumentKind::Adjustment => {
                read::<InventoryAdjustment>(uow, company_id, document_id, DocumentView::Adjustment)
            }
            DocumentKind::Transfer => {
                read::<InventoryTransfer>(uow, company_id, document_id, DocumentView::Transfer)
            }
        })
    }

    // lots

    /// Lots (and quantities) an outbound request would draw. The policy's
    /// strategy for the product applies when none is given.
    #[instrument(skip(self), err)]
    pub fn select_lots(
        &self,
        company_id: CompanyId,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        quantity: Decimal,
        strategy: Option<RotationStrategy>,
        actor: ActorId,
    ) -> Result<Vec<LotAllocation>, LedgerError> {
        let key = StockKey::new(company_id, product_id, warehouse_id);
        let strategy = strategy.unwrap_or_else(|| self.policy.strategy_for(product_id));
        let stamp = Stamp::now(actor);
        self.run("select_lots", |uow| lots::select(uow, key, quantity, strategy, stamp))
    }

    #[instrument(
        skip(self, receipt, intake),
        fields(
            company_id = %receipt.company_id,
            product_id = %receipt.product_id,
            warehouse_id = %receipt.warehouse_id,
            lot_number = %receipt.lot_number
        ),
        err
    )]
    pub fn receive_lot(
        &self,
        receipt: LotReceipt,
        intake: LotIntake,
        actor: ActorId,
    ) -> Result<ReceivedLot, LedgerError> {
        if intake.provenance != Provenance::Manual || receipt.origin_lot_id.is_some() {
            return Err(LedgerError::validation(
                "document receipts are recorded through document transitions",
            ));
        }
        let stamp = Stamp::now(actor);
        self.run("receive_lot", |uow| {
            lots::receive_lot(uow, receipt.clone(), intake.clone(), stamp)
        })
    }

    #[instrument(skip(self), err)]
    pub fn quarantine_lot(
        &self,
        company_id: CompanyId,
        lot_id: LotId,
        actor: ActorId,
    ) -> Result<ProductLot, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("quarantine_lot", |uow| lots::quarantine(uow, company_id, lot_id, stamp))
    }

    #[instrument(skip(self), err)]
    pub fn release_lot(
        &self,
        company_id: CompanyId,
        lot_id: LotId,
        actor: ActorId,
    ) -> Result<ProductLot, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("release_lot", |uow| lots::release(uow, company_id, lot_id, stamp))
    }

    #[instrument(skip(self), err)]
    pub fn expire_lots(
        &self,
        company_id: CompanyId,
        today: NaiveDate,
        actor: ActorId,
    ) -> Result<Vec<ProductLot>, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("expire_lots", |uow| lots::expire(uow, company_id, today, stamp))
    }

    // closures

    #[instrument(skip(self), err)]
    pub fn open_closure(
        &self,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        year: i32,
        month: u32,
        actor: ActorId,
    ) -> Result<InventoryClosure, LedgerError> {
        let period = Period::new(year, month)?;
        let stamp = Stamp::now(actor);
        self.run("open_closure", |uow| {
            closure_engine::open(uow, company_id, warehouse_id, period, stamp)
        })
    }

    #[instrument(skip(self), err)]
    pub fn process_closure(
        &self,
        company_id: CompanyId,
        closure_id: ClosureId,
        actor: ActorId,
    ) -> Result<ClosureView, LedgerError> {
        let stamp = Stamp::now(actor);
        let settings = self.closure_settings();
        self.run("process_closure", |uow| {
            let (closure, details) = closure_engine::process(uow, company_id, closure_id, settings, stamp)?;
            Ok(ClosureView { closure, details })
        })
    }

    #[instrument(skip(self), err)]
    pub fn record_physical_count(
        &self,
        company_id: CompanyId,
        closure_id: ClosureId,
        product_id: ProductId,
        physical_quantity: Decimal,
        actor: ActorId,
    ) -> Result<ClosureDetail, LedgerError> {
        let stamp = Stamp::now(actor);
        let settings = self.closure_settings();
        self.run("record_physical_count", |uow| {
            closure_engine::record_physical_count(
                uow,
                company_id,
                closure_id,
                product_id,
                physical_quantity,
                settings,
                stamp,
            )
        })
    }

    #[instrument(skip(self), err)]
    pub fn approve_closure(
        &self,
        company_id: CompanyId,
        closure_id: ClosureId,
        actor: ActorId,
    ) -> Result<InventoryClosure, LedgerError> {
        let stamp = Stamp::now(actor);
        let settings = self.closure_settings();
        self.run("approve_closure", |uow| {
            closure_engine::approve(uow, company_id, closure_id, settings, stamp)
        })
    }

    #[instrument(skip(self), err)]
    pub fn close_closure(
        &self,
        company_id: CompanyId,
        closure_id: ClosureId,
        actor: ActorId,
    ) -> Result<InventoryClosure, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("close_closure", |uow| closure_engine::close(uow, company_id, closure_id, stamp))
    }

    #[instrument(skip(self), err)]
    pub fn reopen_closure(
        &self,
        company_id: CompanyId,
        closure_id: ClosureId,
        reason: String,
        actor: ActorId,
    ) -> Result<InventoryClosure, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("reopen_closure", |uow| {
            closure_engine::reopen(uow, company_id, closure_id, reason.clone(), stamp)
        })
    }

    #[instrument(skip(self), err)]
    pub fn cancel_closure(
        &self,
        company_id: CompanyId,
        closure_id: ClosureId,
        actor: ActorId,
    ) -> Result<InventoryClosure, LedgerError> {
        let stamp = Stamp::now(actor);
        self.run("cancel_closure", |uow| closure_engine::cancel(uow, company_id, closure_id, stamp))
    }

    // reads and configuration

    pub fn balance(&self, key: StockKey) -> Result<StockBalance, LedgerError> {
        self.run("balance", |uow| Ok(uow.lock_balance(key)?))
    }

    pub fn snapshot(&self, key: StockKey) -> Result<InventorySnapshot, LedgerError> {
        self.run("snapshot", |uow| Ok(uow.snapshot(key)?))
    }

    /// Every lot of the key, whatever its status.
    pub fn lot_balances(&self, key: StockKey) -> Result<Vec<ProductLot>, LedgerError> {
        self.run("lot_balances", |uow| Ok(uow.lots_for(key)?))
    }

    pub fn movement(
        &self,
        company_id: CompanyId,
        movement_id: MovementId,
    ) -> Result<InventoryMovement, LedgerError> {
        self.run("movement", |uow| ledger::load_movement(uow, company_id, movement_id))
    }

    pub fn movements(
        &self,
        filter: MovementFilter,
        pagination: Pagination,
    ) -> Result<Page<InventoryMovement>, LedgerError> {
        self.run("movements", |uow| Ok(uow.query_movements(&filter, pagination)?))
    }

    #[instrument(skip(self), err)]
    pub fn verify_chain(&self, key: StockKey) -> Result<ChainReport, LedgerError> {
        self.run("verify_chain", |uow| ledger::verify(uow, key))
    }

    pub fn closure(
        &self,
        company_id: CompanyId,
        closure_id: ClosureId,
    ) -> Result<ClosureView, LedgerError> {
        self.run("closure", |uow| {
            let closure = uow
                .closure(company_id, closure_id)?
                .ok_or_else(|| LedgerError::not_found(format!("closure {closure_id}")))?;
            let details = uow.closure_details(closure_id)?;
            Ok(ClosureView { closure, details })
        })
    }

    /// Add or replace a movement reason (company-scoped or global).
    #[instrument(skip(self, reason), fields(code = %reason.code), err)]
    pub fn register_reason(&self, reason: MovementReason) -> Result<(), LedgerError> {
        reason.validate()?;
        self.run("register_reason", |uow| Ok(uow.save_reason(&reason)?))
    }
}
