//! Document workflows: drive a document aggregate and turn its fulfilling
//! transitions into ledger movements, all inside one unit of work.
//!
//! ```text
//! command
//!   -> load + validate the document stream
//!   -> rehydrate
//!   -> handle (pure) + apply
//!   -> append document events (expected version)
//!   -> fulfil: movements for fulfilling events
//!   -> append the movement links
//! ```
//!
//! A failure at any step rolls back the document events and the movements
//! together.

pub mod adjustment;
pub mod dispatch;
pub mod donation;
pub mod purchase;
pub mod transfer;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use stockledger_core::{CompanyId, DocumentId, DomainError, ExpectedVersion, Stamp, SupplierId};
use stockledger_documents::{Document, MovementLink};
use stockledger_inventory::{InventoryMovement, LotReceipt, NewMovement};

use crate::error::{LedgerError, StoreError};
use crate::ledger;
use crate::lots::{self, LotIntake};
use crate::store::stream::stream_version;
use crate::store::{StockKey, StoredEvent, UncommittedEvent, UnitOfWork};

/// A movement produced for one document line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMovement {
    pub line_no: u32,
    pub movement: InventoryMovement,
}

impl LineMovement {
    pub(crate) fn new(line_no: u32, movement: InventoryMovement) -> Self {
        Self { line_no, movement }
    }

    fn link(&self) -> MovementLink {
        MovementLink {
            line_no: self.line_no,
            movement_id: self.movement.id,
            lot_id: self.movement.lot_id,
            quantity: self.movement.quantity(),
            unit_cost: self.movement.unit_cost,
        }
    }
}

/// Goods entering a warehouse on a document line.
#[derive(Debug, Clone)]
pub(crate) struct Arrival {
    pub key: StockKey,
    pub supplier_id: Option<SupplierId>,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub lot_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
}

/// Bring an arrival into stock: through a new lot when it carries a lot
/// number, as an untracked receipt otherwise.
pub(crate) fn receive(
    uow: &mut dyn UnitOfWork,
    arrival: Arrival,
    intake: LotIntake,
    stamp: Stamp,
) -> Result<InventoryMovement, LedgerError> {
    let key = arrival.key;
    match arrival.lot_number {
        Some(lot_number) => {
            let receipt = LotReceipt {
                company_id: key.company_id,
                warehouse_id: key.warehouse_id,
                product_id: key.product_id,
                supplier_id: arrival.supplier_id,
                lot_number,
                manufactured_date: arrival.manufactured_date,
                expiration_date: arrival.expiration_date,
                quantity: arrival.quantity,
                unit_cost: arrival.unit_cost,
                origin_lot_id: None,
            };
            Ok(lots::receive_lot(uow, receipt, intake, stamp)?.movement)
        }
        None => {
            let mut input = NewMovement::manual(
                key.company_id,
                key.product_id,
                key.warehouse_id,
                intake.movement_type,
                arrival.quantity,
            );
            input.unit_cost = Some(arrival.unit_cost);
            input.reason_code = intake.reason_code;
            input.provenance = intake.provenance;
            input.transfer_correlation_id = intake.transfer_correlation_id;
            input.reference = intake.reference;
            input.notes = intake.notes;
            input.pre_approved = true;
            ledger::append(uow, input, stamp)
        }
    }
}

/// Outcome of a document transition.
#[derive(Debug, Clone)]
pub struct Transitioned<D> {
    pub document: D,
    /// Document events appended by the transition, link event included.
    pub events: Vec<StoredEvent>,
    pub movements: Vec<LineMovement>,
}

/// Load a document by replaying its stream.
pub fn load<D>(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    document_id: DocumentId,
) -> Result<(D, u64), LedgerError>
where
    D: Document,
    D::Event: DeserializeOwned,
{
    let history = uow.load_stream(company_id, document_id)?;
    validate_loaded_stream(company_id, document_id, &history)?;

    let mut document = D::empty(document_id);
    for stored in &history {
        let event: D::Event = serde_json::from_value(stored.payload.clone()).map_err(|e| {
            StoreError::Serialization(format!(
                "event {} of document {document_id}: {e}",
                stored.sequence_number
            ))
        })?;
        document.apply(&event);
    }
    Ok((document, stream_version(&history)))
}

/// Run one command against a document and fulfil what it decided.
///
/// `fulfil` sees the rehydrated document after the new events were applied
/// and returns the movements it recorded; those are linked back to the
/// document with [`Document::link_command`].
pub fn run<D, F>(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    document_id: DocumentId,
    stamp: Stamp,
    command: D::Command,
    fulfil: F,
) -> Result<Transitioned<D>, LedgerError>
where
    D: Document,
    D::Event: stockledger_events::Event + Serialize + DeserializeOwned,
    F: FnOnce(&mut dyn UnitOfWork, &D, &[D::Event]) -> Result<Vec<LineMovement>, LedgerError>,
{
    let (mut document, version) = load::<D>(uow, company_id, document_id)?;

    let decided = decide(&document, &command)?;
    if decided.is_empty() {
        return Ok(Transitioned {
            document,
            events: Vec::new(),
            movements: Vec::new(),
        });
    }
    for event in &decided {
        document.apply(event);
    }
    let mut events = append::<D>(uow, company_id, document_id, version, &decided)?;

    let movements = fulfil(uow, &document, &decided)?;
    if !movements.is_empty() {
        let links = movements.iter().map(LineMovement::link).collect();
        let link = D::link_command(company_id, document_id, stamp, links);
        let linked = decide(&document, &link)?;
        for event in &linked {
            document.apply(event);
        }
        let version = version + decided.len() as u64;
        events.extend(append::<D>(uow, company_id, document_id, version, &linked)?);
    }

    tracing::info!(
        document_type = D::KIND.aggregate_type(),
        %document_id,
        status = document.status_label(),
        movements = movements.len(),
        "document transitioned"
    );
    Ok(Transitioned {
        document,
        events,
        movements,
    })
}

/// A create against an existing document is a caller mistake, not a race.
fn decide<D: Document>(document: &D, command: &D::Command) -> Result<Vec<D::Event>, LedgerError> {
    document.handle(command).map_err(|err| match err {
        DomainError::Conflict(msg) => LedgerError::Validation(msg),
        other => other.into(),
    })
}

fn append<D>(
    uow: &mut dyn UnitOfWork,
    company_id: CompanyId,
    document_id: DocumentId,
    version: u64,
    decided: &[D::Event],
) -> Result<Vec<StoredEvent>, LedgerError>
where
    D: Document,
    D::Event: stockledger_events::Event + Serialize,
{
    let uncommitted = decided
        .iter()
        .map(|ev| {
            UncommittedEvent::from_typed(
                company_id,
                document_id,
                D::KIND.aggregate_type(),
                Uuid::now_v7(),
                ev,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let expected = if version == 0 {
        ExpectedVersion::NoStream
    } else {
        ExpectedVersion::Exact(version)
    };
    let committed = uow.append_stream(uncommitted, expected)?;
    for stored in &committed {
        uow.emit(stored.to_envelope());
    }
    Ok(committed)
}

fn validate_loaded_stream(
    company_id: CompanyId,
    document_id: DocumentId,
    stream: &[StoredEvent],
) -> Result<(), StoreError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.company_id != company_id {
            return Err(StoreError::Backend(format!(
                "loaded stream contains wrong company_id at index {idx}"
            )));
        }
        if e.document_id != document_id {
            return Err(StoreError::Backend(format!(
                "loaded stream contains wrong document_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(StoreError::Backend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}
