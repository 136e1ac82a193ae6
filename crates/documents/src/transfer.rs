//! Inventory transfers between two warehouses of the same company.
//!
//! Shipping posts outbound legs at the origin; receiving posts one paired
//! inbound leg per shipped leg at the destination. Both sides share the
//! transfer's correlation id.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateRoot, CompanyId, DocumentId, DomainError, LotId, MovementId, ProductId,
    Stamp, TransferCorrelationId, WarehouseId,
};

use crate::common::{
    Document, DocumentChange, DocumentCommand, DocumentEvent, DocumentKind, DocumentState,
    MovementLink, ensure_links, ensure_positive, next_line_no,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Approved,
    InTransit,
    Received,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Approved => "approved",
            TransferStatus::InTransit => "in_transit",
            TransferStatus::Received => "received",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLineInput {
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub lot_id: Option<LotId>,
}

/// One lot split shipped for a line, and its paired receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeg {
    pub origin_lot_id: Option<LotId>,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub outbound_movement_id: MovementId,
    pub inbound_movement_id: Option<MovementId>,
    pub destination_lot_id: Option<LotId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub requested_quantity: Decimal,
    pub lot_id: Option<LotId>,
    pub shipped_quantity: Option<Decimal>,
    pub received_quantity: Option<Decimal>,
    /// `shipped - requested`, set on receipt.
    pub discrepancy: Option<Decimal>,
    pub legs: Vec<TransferLeg>,
}

/// Quantity actually shipped for a line, when it differs from the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippedQuantity {
    pub line_no: u32,
    pub quantity: Decimal,
}

/// What leaves the origin for one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub lot_id: Option<LotId>,
    pub quantity: Decimal,
}

/// What enters the destination for one shipped leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLeg {
    pub line_no: u32,
    pub product_id: ProductId,
    pub origin_lot_id: Option<LotId>,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub outbound_movement_id: MovementId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDiscrepancy {
    pub line_no: u32,
    pub requested: Decimal,
    pub shipped: Decimal,
    pub discrepancy: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferAction {
    Create {
        origin_warehouse_id: WarehouseId,
        destination_warehouse_id: WarehouseId,
        reference: Option<String>,
    },
    AddLine(TransferLineInput),
    RemoveLine {
        line_no: u32,
    },
    Approve,
    /// Lines not listed ship their requested quantity.
    Ship {
        shipped: Vec<ShippedQuantity>,
    },
    Receive,
    Cancel {
        reason: Option<String>,
    },
    LinkMovements {
        links: Vec<MovementLink>,
    },
}

pub type TransferCommand = DocumentCommand<TransferAction>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferChange {
    Created {
        origin_warehouse_id: WarehouseId,
        destination_warehouse_id: WarehouseId,
        correlation_id: TransferCorrelationId,
        reference: Option<String>,
    },
    LineAdded(TransferLine),
    LineRemoved {
        line_no: u32,
    },
    Approved,
    /// Fulfilling (origin side).
    Shipped {
        origin_warehouse_id: WarehouseId,
        correlation_id: TransferCorrelationId,
        lines: Vec<ShipmentLine>,
    },
    /// Fulfilling (destination side).
    Received {
        destination_warehouse_id: WarehouseId,
        correlation_id: TransferCorrelationId,
        legs: Vec<ReceiptLeg>,
        discrepancies: Vec<LineDiscrepancy>,
    },
    Cancelled {
        reason: Option<String>,
    },
    /// Outbound links while in transit, inbound links once received.
    MovementsLinked {
        links: Vec<MovementLink>,
    },
}

impl DocumentChange for TransferChange {
    fn event_type(&self) -> &'static str {
        match self {
            TransferChange::Created { .. } => "documents.transfer.created",
            TransferChange::LineAdded(_) => "documents.transfer.line_added",
            TransferChange::LineRemoved { .. } => "documents.transfer.line_removed",
            TransferChange::Approved => "documents.transfer.approved",
            TransferChange::Shipped { .. } => "documents.transfer.shipped",
            TransferChange::Received { .. } => "documents.transfer.received",
            TransferChange::Cancelled { .. } => "documents.transfer.cancelled",
            TransferChange::MovementsLinked { .. } => "documents.transfer.movements_linked",
        }
    }
}

pub type TransferEvent = DocumentEvent<TransferChange>;

/// Aggregate root: InventoryTransfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryTransfer {
    state: DocumentState,
    origin_warehouse_id: Option<WarehouseId>,
    destination_warehouse_id: Option<WarehouseId>,
    correlation_id: Option<TransferCorrelationId>,
    reference: Option<String>,
    status: TransferStatus,
    lines: Vec<TransferLine>,
    cancel_reason: Option<String>,
}

impl InventoryTransfer {
    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn origin_warehouse_id(&self) -> Option<WarehouseId> {
        self.origin_warehouse_id
    }

    pub fn destination_warehouse_id(&self) -> Option<WarehouseId> {
        self.destination_warehouse_id
    }

    pub fn correlation_id(&self) -> Option<TransferCorrelationId> {
        self.correlation_id
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn lines(&self) -> &[TransferLine] {
        &self.lines
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn total_requested(&self) -> Decimal {
        self.lines.iter().map(|l| l.requested_quantity).sum()
    }

    pub fn total_shipped(&self) -> Decimal {
        self.lines.iter().filter_map(|l| l.shipped_quantity).sum()
    }

    fn set_status(&mut self, status: TransferStatus, stamp: Stamp) {
        self.status = status;
        self.state.record_status(status.as_str(), stamp);
    }

    fn require(&self, allowed: &[TransferStatus], action: &'static str) -> Result<(), DomainError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::transition("transfer", self.status, action))
        }
    }

    fn header(&self) -> Result<(WarehouseId, WarehouseId, TransferCorrelationId), DomainError> {
        match (
            self.origin_warehouse_id,
            self.destination_warehouse_id,
            self.correlation_id,
        ) {
            (Some(o), Some(d), Some(c)) => Ok((o, d, c)),
            _ => Err(DomainError::invariant("transfer header is incomplete")),
        }
    }

    fn decide(&self, action: &TransferAction) -> Result<TransferChange, DomainError> {
        use TransferStatus::*;
        match action {
            TransferAction::Create { .. } => Err(DomainError::conflict("transfer already exists")),
            TransferAction::AddLine(input) => {
                self.require(&[Pending], "add a line to")?;
                ensure_positive(input.quantity, "quantity")?;
                Ok(TransferChange::LineAdded(TransferLine {
                    line_no: next_line_no(&self.lines, |l| l.line_no),
                    product_id: input.product_id,
                    requested_quantity: input.quantity,
                    lot_id: input.lot_id,
                    shipped_quantity: None,
                    received_quantity: None,
                    discrepancy: None,
                    legs: Vec::new(),
                }))
            }
            TransferAction::RemoveLine { line_no } => {
                self.require(&[Pending], "remove a line from")?;
                if !self.lines.iter().any(|l| l.line_no == *line_no) {
                    return Err(DomainError::not_found(format!("transfer line {line_no}")));
                }
                Ok(TransferChange::LineRemoved { line_no: *line_no })
            }
            TransferAction::Approve => {
                self.require(&[Pending], "approve")?;
                if self.lines.is_empty() {
                    return Err(DomainError::validation("cannot approve a transfer without lines"));
                }
                Ok(TransferChange::Approved)
            }
            TransferAction::Ship { shipped } => {
                self.require(&[Approved], "ship")?;
                let (origin, _, correlation_id) = self.header()?;
                if let Some(s) = shipped
                    .iter()
                    .find(|s| !self.lines.iter().any(|l| l.line_no == s.line_no))
                {
                    return Err(DomainError::not_found(format!("transfer line {}", s.line_no)));
                }
                if shipped.iter().any(|s| s.quantity < Decimal::ZERO) {
                    return Err(DomainError::validation("shipped quantity cannot be negative"));
                }
                let lines: Vec<ShipmentLine> = self
                    .lines
                    .iter()
                    .map(|l| ShipmentLine {
                        line_no: l.line_no,
                        product_id: l.product_id,
                        lot_id: l.lot_id,
                        quantity: shipped
                            .iter()
                            .find(|s| s.line_no == l.line_no)
                            .map_or(l.requested_quantity, |s| s.quantity),
                    })
                    .collect();
                if lines.iter().all(|l| l.quantity.is_zero()) {
                    return Err(DomainError::validation("a shipment must move some stock"));
                }
                Ok(TransferChange::Shipped {
                    origin_warehouse_id: origin,
                    correlation_id,
                    lines,
                })
            }
            TransferAction::Receive => {
                self.require(&[InTransit], "receive")?;
                let (_, destination, correlation_id) = self.header()?;
                let mut legs = Vec::new();
                let mut discrepancies = Vec::new();
                for line in &self.lines {
                    let shipped = line.shipped_quantity.unwrap_or(Decimal::ZERO);
                    let leg_total: Decimal = line.legs.iter().map(|l| l.quantity).sum();
                    if leg_total != shipped {
                        return Err(DomainError::invariant(format!(
                            "transfer line {} shipped {shipped} but legs carry {leg_total}",
                            line.line_no
                        )));
                    }
                    legs.extend(line.legs.iter().map(|leg| ReceiptLeg {
                        line_no: line.line_no,
                        product_id: line.product_id,
                        origin_lot_id: leg.origin_lot_id,
                        quantity: leg.quantity,
                        unit_cost: leg.unit_cost,
                        outbound_movement_id: leg.outbound_movement_id,
                    }));
                    discrepancies.push(LineDiscrepancy {
                        line_no: line.line_no,
                        requested: line.requested_quantity,
                        shipped,
                        discrepancy: shipped - line.requested_quantity,
                    });
                }
                Ok(TransferChange::Received {
                    destination_warehouse_id: destination,
                    correlation_id,
                    legs,
                    discrepancies,
                })
            }
            TransferAction::Cancel { reason } => {
                self.require(&[Pending, Approved], "cancel")?;
                Ok(TransferChange::Cancelled {
                    reason: reason.clone(),
                })
            }
            TransferAction::LinkMovements { links } => {
                self.require(&[InTransit, Received], "link movements to")?;
                ensure_links(links, |n| self.lines.iter().any(|l| l.line_no == n))?;
                if self.status == Received {
                    for line in &self.lines {
                        let incoming = links.iter().filter(|l| l.line_no == line.line_no).count();
                        let open = line
                            .legs
                            .iter()
                            .filter(|leg| leg.inbound_movement_id.is_none())
                            .count();
                        if incoming > open {
                            return Err(DomainError::invariant(format!(
                                "transfer line {} has no open leg for an inbound movement",
                                line.line_no
                            )));
                        }
                    }
                }
                Ok(TransferChange::MovementsLinked {
                    links: links.clone(),
                })
            }
        }
    }

    fn link(&mut self, links: &[MovementLink]) {
        let inbound = self.status == TransferStatus::Received;
        for link in links {
            let Some(line) = self.lines.iter_mut().find(|l| l.line_no == link.line_no) else {
                continue;
            };
            if inbound {
                if let Some(leg) = line.legs.iter_mut().find(|l| l.inbound_movement_id.is_none()) {
                    leg.inbound_movement_id = Some(link.movement_id);
                    leg.destination_lot_id = link.lot_id;
                }
            } else {
                line.legs.push(TransferLeg {
                    origin_lot_id: link.lot_id,
                    quantity: link.quantity,
                    unit_cost: link.unit_cost,
                    outbound_movement_id: link.movement_id,
                    inbound_movement_id: None,
                    destination_lot_id: None,
                });
            }
        }
        self.state.movements.extend(links.iter().cloned());
    }
}

impl AggregateRoot for InventoryTransfer {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn version(&self) -> u64 {
        self.state.version
    }
}

impl Aggregate for InventoryTransfer {
    type Command = TransferCommand;
    type Event = TransferEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        let stamp = event.stamp();
        match &event.change {
            TransferChange::Created {
                origin_warehouse_id,
                destination_warehouse_id,
                correlation_id,
                reference,
            } => {
                self.origin_warehouse_id = Some(*origin_warehouse_id);
                self.destination_warehouse_id = Some(*destination_warehouse_id);
                self.correlation_id = Some(*correlation_id);
                self.reference = reference.clone();
                self.status = TransferStatus::Pending;
                self.state
                    .record_created(event.company_id, self.status.as_str(), stamp);
            }
            TransferChange::LineAdded(line) => self.lines.push(line.clone()),
            TransferChange::LineRemoved { line_no } => self.lines.retain(|l| l.line_no != *line_no),
            TransferChange::Approved => self.set_status(TransferStatus::Approved, stamp),
            TransferChange::Shipped { lines, .. } => {
                for shipped in lines {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == shipped.line_no) {
                        line.shipped_quantity = Some(shipped.quantity);
                    }
                }
                self.set_status(TransferStatus::InTransit, stamp);
            }
            TransferChange::Received { discrepancies, .. } => {
                for d in discrepancies {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == d.line_no) {
                        line.received_quantity = Some(d.shipped);
                        line.discrepancy = Some(d.discrepancy);
                    }
                }
                self.set_status(TransferStatus::Received, stamp);
            }
            TransferChange::Cancelled { reason } => {
                self.cancel_reason = reason.clone();
                self.set_status(TransferStatus::Cancelled, stamp);
            }
            TransferChange::MovementsLinked { links } => self.link(links),
        }
        self.state.bump();
    }

    fn handle(&self, cmd: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let change = match &cmd.action {
            TransferAction::Create {
                origin_warehouse_id,
                destination_warehouse_id,
                reference,
            } => {
                self.state.ensure_absent(cmd, "transfer")?;
                if origin_warehouse_id == destination_warehouse_id {
                    return Err(DomainError::validation(
                        "origin and destination warehouses must differ",
                    ));
                }
                TransferChange::Created {
                    origin_warehouse_id: *origin_warehouse_id,
                    destination_warehouse_id: *destination_warehouse_id,
                    correlation_id: TransferCorrelationId::from_uuid(*cmd.document_id.as_uuid()),
                    reference: reference.clone(),
                }
            }
            action => {
                self.state.ensure_target(cmd, "transfer")?;
                self.decide(action)?
            }
        };
        Ok(vec![DocumentEvent::new(cmd, change)])
    }
}

impl Document for InventoryTransfer {
    const KIND: DocumentKind = DocumentKind::Transfer;

    fn empty(id: DocumentId) -> Self {
        Self {
            state: DocumentState::new(id),
            origin_warehouse_id: None,
            destination_warehouse_id: None,
            correlation_id: None,
            reference: None,
            status: TransferStatus::Pending,
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
            TransferAction::LinkMovements { links },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockledger_core::{ActorId, execute};

    struct Fixture {
        company_id: CompanyId,
        transfer: InventoryTransfer,
    }

    impl Fixture {
        fn new(quantities: &[Decimal]) -> Self {
            let mut f = Self {
                company_id: CompanyId::new(),
                transfer: InventoryTransfer::empty(DocumentId::new()),
            };
            f.run(TransferAction::Create {
                origin_warehouse_id: WarehouseId::new(),
                destination_warehouse_id: WarehouseId::new(),
                reference: None,
            })
            .unwrap();
            for q in quantities {
                f.run(TransferAction::AddLine(TransferLineInput {
                    product_id: ProductId::new(),
                    quantity: *q,
                    lot_id: None,
                }))
                .unwrap();
            }
            f
        }

        fn run(&mut self, action: TransferAction) -> Result<Vec<TransferEvent>, DomainError> {
            let cmd = DocumentCommand::new(
                self.company_id,
                *self.transfer.id(),
                Stamp::now(ActorId::new()),
                action,
            );
            execute(&mut self.transfer, &cmd)
        }

        fn link(line_no: u32, quantity: Decimal, lot_id: Option<LotId>) -> MovementLink {
            MovementLink {
                line_no,
                movement_id: MovementId::new(),
                lot_id,
                quantity,
                unit_cost: dec!(2),
            }
        }
    }

    #[test]
    fn ship_then_receive_pairs_every_leg() {
        let mut f = Fixture::new(&[dec!(40)]);
        f.run(TransferAction::Approve).unwrap();
        f.run(TransferAction::Ship { shipped: vec![] }).unwrap();
        assert_eq!(f.transfer.status(), TransferStatus::InTransit);

        let (lot_a, lot_b) = (LotId::new(), LotId::new());
        f.run(TransferAction::LinkMovements {
            links: vec![
                Fixture::link(1, dec!(25), Some(lot_a)),
                Fixture::link(1, dec!(15), Some(lot_b)),
            ],
        })
        .unwrap();

        let events = f.run(TransferAction::Receive).unwrap();
        let legs = match &events[0].change {
            TransferChange::Received { legs, discrepancies, .. } => {
                assert_eq!(discrepancies[0].discrepancy, dec!(0));
                legs.clone()
            }
            other => panic!("expected Received, got {other:?}"),
        };
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].origin_lot_id, Some(lot_a));

        let dest = LotId::new();
        f.run(TransferAction::LinkMovements {
            links: vec![Fixture::link(1, dec!(25), Some(dest)), Fixture::link(1, dec!(15), None)],
        })
        .unwrap();
        let line = &f.transfer.lines()[0];
        assert!(line.legs.iter().all(|l| l.inbound_movement_id.is_some()));
        assert_eq!(line.legs[0].destination_lot_id, Some(dest));

        assert!(
            f.run(TransferAction::LinkMovements {
                links: vec![Fixture::link(1, dec!(1), None)]
            })
            .is_err()
        );
    }

    #[test]
    fn short_shipment_records_a_discrepancy() {
        let mut f = Fixture::new(&[dec!(10), dec!(5)]);
        f.run(TransferAction::Approve).unwrap();
        f.run(TransferAction::Ship {
            shipped: vec![ShippedQuantity { line_no: 1, quantity: dec!(8) }],
        })
        .unwrap();
        f.run(TransferAction::LinkMovements {
            links: vec![Fixture::link(1, dec!(8), None), Fixture::link(2, dec!(5), None)],
        })
        .unwrap();
        f.run(TransferAction::Receive).unwrap();

        let lines = f.transfer.lines();
        assert_eq!(lines[0].discrepancy, Some(dec!(-2)));
        assert_eq!(lines[0].received_quantity, Some(dec!(8)));
        assert_eq!(lines[1].discrepancy, Some(dec!(0)));
        assert_eq!(f.transfer.total_shipped(), dec!(13));
    }

    #[test]
    fn receive_requires_recorded_legs() {
        let mut f = Fixture::new(&[dec!(3)]);
        f.run(TransferAction::Approve).unwrap();
        f.run(TransferAction::Ship { shipped: vec![] }).unwrap();
        assert!(matches!(
            f.run(TransferAction::Receive),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn cancellation_is_blocked_once_in_transit() {
        let mut f = Fixture::new(&[dec!(3)]);
        f.run(TransferAction::Approve).unwrap();
        f.run(TransferAction::Ship { shipped: vec![] }).unwrap();
        assert_eq!(
            f.run(TransferAction::Cancel { reason: None }).unwrap_err(),
            DomainError::transition("transfer", "in_transit", "cancel")
        );

        let mut g = Fixture::new(&[dec!(3)]);
        g.run(TransferAction::Cancel { reason: None }).unwrap();
        assert!(g.run(TransferAction::Approve).is_err());
    }

    #[test]
    fn same_warehouse_and_empty_shipments_are_rejected() {
        let w = WarehouseId::new();
        let t = InventoryTransfer::empty(DocumentId::new());
        let cmd = DocumentCommand::new(
            CompanyId::new(),
            *t.id(),
            Stamp::now(ActorId::new()),
            TransferAction::Create {
                origin_warehouse_id: w,
                destination_warehouse_id: w,
                reference: None,
            },
        );
        assert!(t.handle(&cmd).is_err());

        let mut f = Fixture::new(&[dec!(3)]);
        f.run(TransferAction::Approve).unwrap();
        assert!(
            f.run(TransferAction::Ship {
                shipped: vec![ShippedQuantity { line_no: 1, quantity: dec!(0) }],
            })
            .is_err()
        );
    }
}
