//! Purchases: goods bought from a supplier and received into one warehouse.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateRoot, CompanyId, DocumentId, DomainError, ProductId, Stamp, SupplierId,
    WarehouseId,
};

use crate::common::{
    Document, DocumentChange, DocumentCommand, DocumentEvent, DocumentKind, DocumentState,
    MovementLink, ensure_cost, ensure_links, ensure_positive, next_line_no,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Borrador,
    Pendiente,
    Aprobado,
    Recibido,
    Cancelado,
}

impl PurchaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseStatus::Borrador => "borrador",
            PurchaseStatus::Pendiente => "pendiente",
            PurchaseStatus::Aprobado => "aprobado",
            PurchaseStatus::Recibido => "recibido",
            PurchaseStatus::Cancelado => "cancelado",
        }
    }
}

impl core::fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line data supplied by the caller. With a lot number, receipt creates a lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLineInput {
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub lot_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub lot_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
}

impl PurchaseLine {
    pub fn total_cost(&self) -> Decimal {
        self.quantity * self.unit_cost
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseAction {
    Create {
        warehouse_id: WarehouseId,
        supplier_id: SupplierId,
        reference: Option<String>,
    },
    AddLine(PurchaseLineInput),
    RemoveLine {
        line_no: u32,
    },
    Submit,
    Approve,
    Receive,
    Cancel {
        reason: Option<String>,
    },
    LinkMovements {
        links: Vec<MovementLink>,
    },
}

pub type PurchaseCommand = DocumentCommand<PurchaseAction>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseChange {
    Created {
        warehouse_id: WarehouseId,
        supplier_id: SupplierId,
        reference: Option<String>,
    },
    LineAdded(PurchaseLine),
    LineRemoved {
        line_no: u32,
    },
    Submitted,
    Approved,
    /// Fulfilling: every line enters stock.
    Received {
        warehouse_id: WarehouseId,
        supplier_id: SupplierId,
        lines: Vec<PurchaseLine>,
    },
    Cancelled {
        reason: Option<String>,
    },
    MovementsLinked {
        links: Vec<MovementLink>,
    },
}

impl DocumentChange for PurchaseChange {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseChange::Created { .. } => "documents.purchase.created",
            PurchaseChange::LineAdded(_) => "documents.purchase.line_added",
            PurchaseChange::LineRemoved { .. } => "documents.purchase.line_removed",
            PurchaseChange::Submitted => "documents.purchase.submitted",
            PurchaseChange::Approved => "documents.purchase.approved",
            PurchaseChange::Received { .. } => "documents.purchase.received",
            PurchaseChange::Cancelled { .. } => "documents.purchase.cancelled",
            PurchaseChange::MovementsLinked { .. } => "documents.purchase.movements_linked",
        }
    }
}

pub type PurchaseEvent = DocumentEvent<PurchaseChange>;

/// Aggregate root: Purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purchase {
    state: DocumentState,
    warehouse_id: Option<WarehouseId>,
    supplier_id: Option<SupplierId>,
    reference: Option<String>,
    status: PurchaseStatus,
    lines: Vec<PurchaseLine>,
    cancel_reason: Option<String>,
}

impl Purchase {
    pub fn status(&self) -> PurchaseStatus {
        self.status
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn lines(&self) -> &[PurchaseLine] {
        &self.lines
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn total_quantity(&self) -> Decimal {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    pub fn total_cost(&self) -> Decimal {
        self.lines.iter().map(PurchaseLine::total_cost).sum()
    }
}

impl AggregateRoot for Purchase {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn version(&self) -> u64 {
        self.state.version
    }
}

impl Aggregate for Purchase {
    type Command = PurchaseCommand;
    type Event = PurchaseEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        let stamp = event.stamp();
        match &event.change {
            PurchaseChange::Created {
                warehouse_id,
                supplier_id,
                reference,
            } => {
                self.warehouse_id = Some(*warehouse_id);
                self.supplier_id = Some(*supplier_id);
                self.reference = reference.clone();
                self.status = PurchaseStatus::Borrador;
                self.lines.clear();
                self.state
                    .record_created(event.company_id, self.status.as_str(), stamp);
            }
            PurchaseChange::LineAdded(line) => self.lines.push(line.clone()),
            PurchaseChange::LineRemoved { line_no } => self.lines.retain(|l| l.line_no != *line_no),
            PurchaseChange::Submitted => self.set_status(PurchaseStatus::Pendiente, stamp),
            PurchaseChange::Approved => self.set_status(PurchaseStatus::Aprobado, stamp),
            PurchaseChange::Received { .. } => self.set_status(PurchaseStatus::Recibido, stamp),
            PurchaseChange::Cancelled { reason } => {
                self.cancel_reason = reason.clone();
                self.set_status(PurchaseStatus::Cancelado, stamp);
            }
            PurchaseChange::MovementsLinked { links } => {
                self.state.movements.extend(links.iter().cloned());
            }
        }
        self.state.bump();
    }

    fn handle(&self, cmd: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let change = match &cmd.action {
            PurchaseAction::Create {
                warehouse_id,
                supplier_id,
                reference,
            } => {
                self.state.ensure_absent(cmd, "purchase")?;
                PurchaseChange::Created {
                    warehouse_id: *warehouse_id,
                    supplier_id: *supplier_id,
                    reference: reference.clone(),
                }
            }
            action => {
                self.state.ensure_target(cmd, "purchase")?;
                self.decide(action)?
            }
        };
        Ok(vec![DocumentEvent::new(cmd, change)])
    }
}

impl Purchase {
    fn set_status(&mut self, status: PurchaseStatus, stamp: Stamp) {
        self.status = status;
        self.state.record_status(status.as_str(), stamp);
    }

    fn require(&self, allowed: &[PurchaseStatus], action: &'static str) -> Result<(), DomainError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::transition("purchase", self.status, action))
        }
    }

    fn decide(&self, action: &PurchaseAction) -> Result<PurchaseChange, DomainError> {
        use PurchaseStatus::*;
        match action {
            PurchaseAction::Create { .. } => Err(DomainError::conflict("purchase already exists")),
            PurchaseAction::AddLine(input) => {
                self.require(&[Borrador], "add a line to")?;
                ensure_positive(input.quantity, "quantity")?;
                ensure_cost(input.unit_cost)?;
                if input.lot_number.as_deref().is_some_and(|n| n.trim().is_empty()) {
                    return Err(DomainError::validation("lot number cannot be blank"));
                }
                if let (Some(made), Some(expires)) = (input.manufactured_date, input.expiration_date) {
                    if expires < made {
                        return Err(DomainError::validation(
                            "expiration date precedes manufactured date",
                        ));
                    }
                }
                Ok(PurchaseChange::LineAdded(PurchaseLine {
                    line_no: next_line_no(&self.lines, |l| l.line_no),
                    product_id: input.product_id,
                    quantity: input.quantity,
                    unit_cost: input.unit_cost,
                    lot_number: input.lot_number.clone(),
                    manufactured_date: input.manufactured_date,
                    expiration_date: input.expiration_date,
                }))
            }
            PurchaseAction::RemoveLine { line_no } => {
                self.require(&[Borrador], "remove a line from")?;
                if !self.lines.iter().any(|l| l.line_no == *line_no) {
                    return Err(DomainError::not_found(format!("purchase line {line_no}")));
                }
                Ok(PurchaseChange::LineRemoved { line_no: *line_no })
            }
            PurchaseAction::Submit => {
                self.require(&[Borrador], "submit")?;
                if self.lines.is_empty() {
                    return Err(DomainError::validation("cannot submit a purchase without lines"));
                }
                Ok(PurchaseChange::Submitted)
            }
            PurchaseAction::Approve => {
                self.require(&[Pendiente], "approve")?;
                Ok(PurchaseChange::Approved)
            }
            PurchaseAction::Receive => {
                self.require(&[Aprobado], "receive")?;
                match (self.warehouse_id, self.supplier_id) {
                    (Some(warehouse_id), Some(supplier_id)) => Ok(PurchaseChange::Received {
                        warehouse_id,
                        supplier_id,
                        lines: self.lines.clone(),
                    }),
                    _ => Err(DomainError::invariant("purchase header is incomplete")),
                }
            }
            PurchaseAction::Cancel { reason } => {
                self.require(&[Borrador, Pendiente, Aprobado], "cancel")?;
                Ok(PurchaseChange::Cancelled {
                    reason: reason.clone(),
                })
            }
            PurchaseAction::LinkMovements { links } => {
                self.require(&[Recibido], "link movements to")?;
                ensure_links(links, |n| self.lines.iter().any(|l| l.line_no == n))?;
                Ok(PurchaseChange::MovementsLinked {
                    links: links.clone(),
                })
            }
        }
    }
}

impl Document for Purchase {
    const KIND: DocumentKind = DocumentKind::Purchase;

    fn empty(id: DocumentId) -> Self {
        Self {
            state: DocumentState::new(id),
            warehouse_id: None,
            supplier_id: None,
            reference: None,
            status: PurchaseStatus::Borrador,
            lines: Vec::new(),
            cancel_reason: None,
        }
    }

    fn state(&self) -> &DocumentState {
        &self.state
    }

    fn status_label(&self) -> &'static str {
        self.status.as_str()
    }

    fn link_command(
        company_id: CompanyId,
        document_id: DocumentId,
        stamp: Stamp,
        links: Vec<MovementLink>,
    ) -> Self::Command {
        DocumentCommand::new(
            company_id,
            document_id,
            stamp,
            PurchaseAction::LinkMovements { links },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockledger_core::{ActorId, MovementId, execute};

    fn test_company_id() -> CompanyId {
        CompanyId::new()
    }

    fn stamp() -> Stamp {
        Stamp::now(ActorId::new())
    }

    struct Fixture {
        company_id: CompanyId,
        document_id: DocumentId,
        purchase: Purchase,
    }

    impl Fixture {
        fn new() -> Self {
            let document_id = DocumentId::new();
            let mut f = Self {
                company_id: test_company_id(),
                document_id,
                purchase: Purchase::empty(document_id),
            };
            f.run(PurchaseAction::Create {
                warehouse_id: WarehouseId::new(),
                supplier_id: SupplierId::new(),
                reference: Some("PO-1".into()),
            })
            .unwrap();
            f
        }

        fn cmd(&self, action: PurchaseAction) -> PurchaseCommand {
            DocumentCommand::new(self.company_id, self.document_id, stamp(), action)
        }

        fn run(&mut self, action: PurchaseAction) -> Result<Vec<PurchaseEvent>, DomainError> {
            let cmd = self.cmd(action);
            execute(&mut self.purchase, &cmd)
        }

        fn add_line(&mut self, qty: Decimal, cost: Decimal) {
            self.run(PurchaseAction::AddLine(PurchaseLineInput {
                product_id: ProductId::new(),
                quantity: qty,
                unit_cost: cost,
                lot_number: Some("LOT-A".into()),
                manufactured_date: None,
                expiration_date: None,
            }))
            .unwrap();
        }
    }

    #[test]
    fn happy_path_reaches_recibido() {
        let mut f = Fixture::new();
        f.add_line(dec!(100), dec!(10));
        assert_eq!(f.purchase.total_cost(), dec!(1000));

        f.run(PurchaseAction::Submit).unwrap();
        f.run(PurchaseAction::Approve).unwrap();
        let events = f.run(PurchaseAction::Receive).unwrap();

        assert_eq!(f.purchase.status(), PurchaseStatus::Recibido);
        match &events[0].change {
            PurchaseChange::Received { lines, .. } => assert_eq!(lines.len(), 1),
            other => panic!("expected Received, got {other:?}"),
        }
        let statuses: Vec<&str> = f.purchase.state().history().iter().map(|h| h.status.as_str()).collect();
        assert_eq!(statuses, ["borrador", "pendiente", "aprobado", "recibido"]);
        assert_eq!(f.purchase.version(), 5);
    }

    #[test]
    fn cannot_receive_before_approval() {
        let mut f = Fixture::new();
        f.add_line(dec!(1), dec!(1));
        f.run(PurchaseAction::Submit).unwrap();

        let err = f.run(PurchaseAction::Receive).unwrap_err();
        assert_eq!(err, DomainError::transition("purchase", "pendiente", "receive"));
    }

    #[test]
    fn lines_are_editable_only_in_draft() {
        let mut f = Fixture::new();
        f.add_line(dec!(1), dec!(1));
        f.add_line(dec!(2), dec!(1));
        f.run(PurchaseAction::RemoveLine { line_no: 1 }).unwrap();
        assert_eq!(f.purchase.lines()[0].line_no, 2);
        f.add_line(dec!(3), dec!(1));
        assert_eq!(f.purchase.lines()[1].line_no, 3);

        assert!(f.run(PurchaseAction::RemoveLine { line_no: 9 }).is_err());
        f.run(PurchaseAction::Submit).unwrap();
        assert!(matches!(
            f.run(PurchaseAction::RemoveLine { line_no: 2 }),
            Err(DomainError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn cancel_is_blocked_once_received() {
        let mut f = Fixture::new();
        f.add_line(dec!(1), dec!(1));
        f.run(PurchaseAction::Submit).unwrap();
        f.run(PurchaseAction::Approve).unwrap();
        f.run(PurchaseAction::Receive).unwrap();

        assert!(f.run(PurchaseAction::Cancel { reason: None }).is_err());
        assert!(f.run(PurchaseAction::Receive).is_err());
    }

    #[test]
    fn links_require_received_status_and_known_lines() {
        let mut f = Fixture::new();
        f.add_line(dec!(1), dec!(1));
        let link = MovementLink {
            line_no: 1,
            movement_id: MovementId::new(),
            lot_id: None,
            quantity: dec!(1),
            unit_cost: dec!(1),
        };
        assert!(f.run(PurchaseAction::LinkMovements { links: vec![link.clone()] }).is_err());

        f.run(PurchaseAction::Submit).unwrap();
        f.run(PurchaseAction::Approve).unwrap();
        f.run(PurchaseAction::Receive).unwrap();

        let mut stray = link.clone();
        stray.line_no = 7;
        assert!(f.run(PurchaseAction::LinkMovements { links: vec![stray] }).is_err());
        f.run(PurchaseAction::LinkMovements { links: vec![link.clone()] }).unwrap();
        assert_eq!(f.purchase.state().movement_ids(), vec![link.movement_id]);
    }

    #[test]
    fn commands_for_another_company_are_rejected() {
        let mut f = Fixture::new();
        let cmd = DocumentCommand::new(test_company_id(), f.document_id, stamp(), PurchaseAction::Submit);
        assert!(matches!(
            execute(&mut f.purchase, &cmd),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn events_serialize_with_status_names() {
        let mut f = Fixture::new();
        f.add_line(dec!(1), dec!(1));
        let events = f.run(PurchaseAction::Submit).unwrap();
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["change"], "Submitted");
        assert_eq!(serde_json::to_value(PurchaseStatus::Pendiente).unwrap(), "pendiente");

        let back: PurchaseEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, events[0]);
    }
}
