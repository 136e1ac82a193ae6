//! Donations: stock received free of charge from a donor.
//!
//! Receipt is inbound, valued at the declared unit value of each line.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateRoot, CompanyId, DocumentId, DomainError, ProductId, Stamp, WarehouseId,
};

use crate::common::{
    Document, DocumentChange, DocumentCommand, DocumentEvent, DocumentKind, DocumentState,
    MovementLink, ensure_cost, ensure_links, ensure_positive, next_line_no,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DonationStatus {
    Borrador,
    Pendiente,
    Aprobado,
    Recibido,
    Cancelado,
}

impl DonationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DonationStatus::Borrador => "borrador",
            DonationStatus::Pendiente => "pendiente",
            DonationStatus::Aprobado => "aprobado",
            DonationStatus::Recibido => "recibido",
            DonationStatus::Cancelado => "cancelado",
        }
    }
}

impl core::fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationLineInput {
    pub product_id: ProductId,
    pub quantity: Decimal,
    /// Declared value per unit.
    pub unit_value: Decimal,
    pub lot_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub unit_value: Decimal,
    pub lot_number: Option<String>,
    pub manufactured_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonationAction {
    Create {
        warehouse_id: WarehouseId,
        donor: String,
        reference: Option<String>,
    },
    AddLine(DonationLineInput),
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

pub type DonationCommand = DocumentCommand<DonationAction>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonationChange {
    Created {
        warehouse_id: WarehouseId,
        donor: String,
        reference: Option<String>,
    },
    LineAdded(DonationLine),
    LineRemoved {
        line_no: u32,
    },
    Submitted,
    Approved,
    Received {
        warehouse_id: WarehouseId,
        lines: Vec<DonationLine>,
    },
    Cancelled {
        reason: Option<String>,
    },
    MovementsLinked {
        links: Vec<MovementLink>,
    },
}

impl DocumentChange for DonationChange {
    fn event_type(&self) -> &'static str {
        match self {
            DonationChange::Created { .. } => "documents.donation.created",
            DonationChange::LineAdded(_) => "documents.donation.line_added",
            DonationChange::LineRemoved { .. } => "documents.donation.line_removed",
            DonationChange::Submitted => "documents.donation.submitted",
            DonationChange::Approved => "documents.donation.approved",
            DonationChange::Received { .. } => "documents.donation.received",
            DonationChange::Cancelled { .. } => "documents.donation.cancelled",
            DonationChange::MovementsLinked { .. } => "documents.donation.movements_linked",
        }
    }
}

pub type DonationEvent = DocumentEvent<DonationChange>;

/// Aggregate root: Donation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Donation {
    state: DocumentState,
    warehouse_id: Option<WarehouseId>,
    donor: String,
    reference: Option<String>,
    status: DonationStatus,
    lines: Vec<DonationLine>,
}

impl Donation {
    pub fn status(&self) -> DonationStatus {
        self.status
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn donor(&self) -> &str {
        &self.donor
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn lines(&self) -> &[DonationLine] {
        &self.lines
    }

    pub fn total_quantity(&self) -> Decimal {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    pub fn total_value(&self) -> Decimal {
        self.lines.iter().map(|l| l.quantity * l.unit_value).sum()
    }

    fn set_status(&mut self, status: DonationStatus, stamp: Stamp) {
        self.status = status;
        self.state.record_status(status.as_str(), stamp);
    }

    fn require(&self, allowed: &[DonationStatus], action: &'static str) -> Result<(), DomainError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::transition("donation", self.status, action))
        }
    }

    fn decide(&self, action: &DonationAction) -> Result<DonationChange, DomainError> {
        use DonationStatus::*;
        match action {
            DonationAction::Create { .. } => Err(DomainError::conflict("donation already exists")),
            DonationAction::AddLine(input) => {
                self.require(&[Borrador], "add a line to")?;
                ensure_positive(input.quantity, "quantity")?;
                ensure_cost(input.unit_value)?;
                if let (Some(made), Some(expires)) = (input.manufactured_date, input.expiration_date) {
                    if expires < made {
                        return Err(DomainError::validation(
                            "expiration date precedes manufactured date",
                        ));
                    }
                }
                Ok(DonationChange::LineAdded(DonationLine {
                    line_no: next_line_no(&self.lines, |l| l.line_no),
                    product_id: input.product_id,
                    quantity: input.quantity,
                    unit_value: input.unit_value,
                    lot_number: input.lot_number.clone(),
                    manufactured_date: input.manufactured_date,
                    expiration_date: input.expiration_date,
                }))
            }
            DonationAction::RemoveLine { line_no } => {
                self.require(&[Borrador], "remove a line from")?;
                if !self.lines.iter().any(|l| l.line_no == *line_no) {
                    return Err(DomainError::not_found(format!("donation line {line_no}")));
                }
                Ok(DonationChange::LineRemoved { line_no: *line_no })
            }
            DonationAction::Submit => {
                self.require(&[Borrador], "submit")?;
                if self.lines.is_empty() {
                    return Err(DomainError::validation("cannot submit a donation without lines"));
                }
                Ok(DonationChange::Submitted)
            }
            DonationAction::Approve => {
                self.require(&[Pendiente], "approve")?;
                Ok(DonationChange::Approved)
            }
            DonationAction::Receive => {
                self.require(&[Aprobado], "receive")?;
                let warehouse_id = self
                    .warehouse_id
                    .ok_or_else(|| DomainError::invariant("donation has no warehouse"))?;
                Ok(DonationChange::Received {
                    warehouse_id,
                    lines: self.lines.clone(),
                })
            }
            DonationAction::Cancel { reason } => {
                self.require(&[Borrador, Pendiente, Aprobado], "cancel")?;
                Ok(DonationChange::Cancelled {
                    reason: reason.clone(),
                })
            }
            DonationAction::LinkMovements { links } => {
                self.require(&[Recibido], "link movements to")?;
                ensure_links(links, |n| self.lines.iter().any(|l| l.line_no == n))?;
                Ok(DonationChange::MovementsLinked {
                    links: links.clone(),
                })
            }
        }
    }
}

impl AggregateRoot for Donation {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn version(&self) -> u64 {
        self.state.version
    }
}

impl Aggregate for Donation {
    type Command = DonationCommand;
    type Event = DonationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        let stamp = event.stamp();
        match &event.change {
            DonationChange::Created {
                warehouse_id,
                donor,
                reference,
            } => {
                self.warehouse_id = Some(*warehouse_id);
                self.donor = donor.clone();
                self.reference = reference.clone();
                self.status = DonationStatus::Borrador;
                self.state
                    .record_created(event.company_id, self.status.as_str(), stamp);
            }
            DonationChange::LineAdded(line) => self.lines.push(line.clone()),
            DonationChange::LineRemoved { line_no } => self.lines.retain(|l| l.line_no != *line_no),
            DonationChange::Submitted => self.set_status(DonationStatus::Pendiente, stamp),
            DonationChange::Approved => self.set_status(DonationStatus::Aprobado, stamp),
            DonationChange::Received { .. } => self.set_status(DonationStatus::Recibido, stamp),
            DonationChange::Cancelled { .. } => self.set_status(DonationStatus::Cancelado, stamp),
            DonationChange::MovementsLinked { links } => {
                self.state.movements.extend(links.iter().cloned());
            }
        }
        self.state.bump();
    }

    fn handle(&self, cmd: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let change = match &cmd.action {
            DonationAction::Create {
                warehouse_id,
                donor,
                reference,
            } => {
                self.state.ensure_absent(cmd, "donation")?;
                if donor.trim().is_empty() {
                    return Err(DomainError::validation("donor cannot be empty"));
                }
                DonationChange::Created {
                    warehouse_id: *warehouse_id,
                    donor: donor.clone(),
                    reference: reference.clone(),
                }
            }
            action => {
                self.state.ensure_target(cmd, "donation")?;
                self.decide(action)?
            }
        };
        Ok(vec![DocumentEvent::new(cmd, change)])
    }
}

impl Document for Donation {
    const KIND: DocumentKind = DocumentKind::Donation;

    fn empty(id: DocumentId) -> Self {
        Self {
            state: DocumentState::new(id),
            warehouse_id: None,
            donor: String::new(),
            reference: None,
            status: DonationStatus::Borrador,
            lines: Vec::new(),
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
            DonationAction::LinkMovements { links },
        )
    }
}
