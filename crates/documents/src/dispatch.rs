//! Dispatches: stock leaving a warehouse for a recipient.
//!
//! Approval reserves the stock, dispatching turns the reservation into
//! outbound movements, cancelling an approved dispatch releases it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateRoot, CompanyId, DocumentId, DomainError, LotId, ProductId, Stamp,
    WarehouseId,
};

use crate::common::{
    Document, DocumentChange, DocumentCommand, DocumentEvent, DocumentKind, DocumentState,
    MovementLink, ensure_links, ensure_positive, next_line_no,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Borrador,
    Pendiente,
    Aprobado,
    Despachado,
    Entregado,
    Cancelado,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Borrador => "borrador",
            DispatchStatus::Pendiente => "pendiente",
            DispatchStatus::Aprobado => "aprobado",
            DispatchStatus::Despachado => "despachado",
            DispatchStatus::Entregado => "entregado",
            DispatchStatus::Cancelado => "cancelado",
        }
    }
}

impl core::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchLineInput {
    pub product_id: ProductId,
    pub quantity: Decimal,
    /// Pin the line to one lot instead of letting rotation choose.
    pub lot_id: Option<LotId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub lot_id: Option<LotId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchAction {
    Create {
        warehouse_id: WarehouseId,
        recipient: String,
        reference: Option<String>,
    },
    AddLine(DispatchLineInput),
    RemoveLine {
        line_no: u32,
    },
    Submit,
    Approve,
    Dispatch,
    Deliver,
    Cancel {
        reason: Option<String>,
    },
    LinkMovements {
        links: Vec<MovementLink>,
    },
}

pub type DispatchCommand = DocumentCommand<DispatchAction>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchChange {
    Created {
        warehouse_id: WarehouseId,
        recipient: String,
        reference: Option<String>,
    },
    LineAdded(DispatchLine),
    LineRemoved {
        line_no: u32,
    },
    Submitted,
    /// Reserves every line at the warehouse.
    Approved {
        warehouse_id: WarehouseId,
        lines: Vec<DispatchLine>,
    },
    /// Fulfilling: converts the reservation into outbound movements.
    Dispatched {
        warehouse_id: WarehouseId,
        lines: Vec<DispatchLine>,
    },
    Delivered,
    /// `released` holds the lines whose reservation must be given back.
    Cancelled {
        reason: Option<String>,
        warehouse_id: WarehouseId,
        released: Vec<DispatchLine>,
    },
    MovementsLinked {
        links: Vec<MovementLink>,
    },
}

impl DocumentChange for DispatchChange {
    fn event_type(&self) -> &'static str {
        match self {
            DispatchChange::Created { .. } => "documents.dispatch.created",
            DispatchChange::LineAdded(_) => "documents.dispatch.line_added",
            DispatchChange::LineRemoved { .. } => "documents.dispatch.line_removed",
            DispatchChange::Submitted => "documents.dispatch.submitted",
            DispatchChange::Approved { .. } => "documents.dispatch.approved",
            DispatchChange::Dispatched { .. } => "documents.dispatch.dispatched",
            DispatchChange::Delivered => "documents.dispatch.delivered",
            DispatchChange::Cancelled { .. } => "documents.dispatch.cancelled",
            DispatchChange::MovementsLinked { .. } => "documents.dispatch.movements_linked",
        }
    }
}

pub type DispatchEvent = DocumentEvent<DispatchChange>;

/// Aggregate root: Dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    state: DocumentState,
    warehouse_id: Option<WarehouseId>,
    recipient: String,
    reference: Option<String>,
    status: DispatchStatus,
    lines: Vec<DispatchLine>,
    cancel_reason: Option<String>,
}

impl Dispatch {
    pub fn status(&self) -> DispatchStatus {
        self.status
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn lines(&self) -> &[DispatchLine] {
        &self.lines
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn total_quantity(&self) -> Decimal {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    /// Cost of what actually left, taken from the linked movements.
    pub fn total_cost(&self) -> Decimal {
        self.state
            .movements
            .iter()
            .map(|m| m.quantity * m.unit_cost)
            .sum()
    }

    fn set_status(&mut self, status: DispatchStatus, stamp: Stamp) {
        self.status = status;
        self.state.record_status(status.as_str(), stamp);
    }

    fn require(&self, allowed: &[DispatchStatus], action: &'static str) -> Result<(), DomainError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::transition("dispatch", self.status, action))
        }
    }

    fn warehouse(&self) -> Result<WarehouseId, DomainError> {
        self.warehouse_id
            .ok_or_else(|| DomainError::invariant("dispatch has no warehouse"))
    }

    fn decide(&self, action: &DispatchAction) -> Result<DispatchChange, DomainError> {
        use DispatchStatus::*;
        match action {
            DispatchAction::Create { .. } => Err(DomainError::conflict("dispatch already exists")),
            DispatchAction::AddLine(input) => {
                self.require(&[Borrador], "add a line to")?;
                ensure_positive(input.quantity, "quantity")?;
                Ok(DispatchChange::LineAdded(DispatchLine {
                    line_no: next_line_no(&self.lines, |l| l.line_no),
                    product_id: input.product_id,
                    quantity: input.quantity,
                    lot_id: input.lot_id,
                }))
            }
            DispatchAction::RemoveLine { line_no } => {
                self.require(&[Borrador], "remove a line from")?;
                if !self.lines.iter().any(|l| l.line_no == *line_no) {
                    return Err(DomainError::not_found(format!("dispatch line {line_no}")));
                }
                Ok(DispatchChange::LineRemoved { line_no: *line_no })
            }
            DispatchAction::Submit => {
                self.require(&[Borrador], "submit")?;
                if self.lines.is_empty() {
                    return Err(DomainError::validation("cannot submit a dispatch without lines"));
                }
                Ok(DispatchChange::Submitted)
            }
            DispatchAction::Approve => {
                self.require(&[Pendiente], "approve")?;
                Ok(DispatchChange::Approved {
                    warehouse_id: self.warehouse()?,
                    lines: self.lines.clone(),
                })
            }
            DispatchAction::Dispatch => {
                self.require(&[Aprobado], "dispatch")?;
                Ok(DispatchChange::Dispatched {
                    warehouse_id: self.warehouse()?,
                    lines: self.lines.clone(),
                })
            }
            DispatchAction::Deliver => {
                self.require(&[Despachado], "deliver")?;
                Ok(DispatchChange::Delivered)
            }
            DispatchAction::Cancel { reason } => {
                self.require(&[Borrador, Pendiente, Aprobado], "cancel")?;
                let released = if self.status == Aprobado {
                    self.lines.clone()
                } else {
                    Vec::new()
                };
                Ok(DispatchChange::Cancelled {
                    reason: reason.clone(),
                    warehouse_id: self.warehouse()?,
                    released,
                })
            }
            DispatchAction::LinkMovements { links } => {
                self.require(&[Despachado, Entregado], "link movements to")?;
                ensure_links(links, |n| self.lines.iter().any(|l| l.line_no == n))?;
                Ok(DispatchChange::MovementsLinked {
                    links: links.clone(),
                })
            }
        }
    }
}

impl AggregateRoot for Dispatch {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn version(&self) -> u64 {
        self.state.version
    }
}

impl Aggregate for Dispatch {
    type Command = DispatchCommand;
    type Event = DispatchEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        let stamp = event.stamp();
        match &event.change {
            DispatchChange::Created {
                warehouse_id,
                recipient,
                reference,
            } => {
                self.warehouse_id = Some(*warehouse_id);
                self.recipient = recipient.clone();
                self.reference = reference.clone();
                self.status = DispatchStatus::Borrador;
                self.lines.clear();
                self.state
                    .record_created(event.company_id, self.status.as_str(), stamp);
            }
            DispatchChange::LineAdded(line) => self.lines.push(line.clone()),
            DispatchChange::LineRemoved { line_no } => self.lines.retain(|l| l.line_no != *line_no),
            DispatchChange::Submitted => self.set_status(DispatchStatus::Pendiente, stamp),
            DispatchChange::Approved { .. } => self.set_status(DispatchStatus::Aprobado, stamp),
            DispatchChange::Dispatched { .. } => self.set_status(DispatchStatus::Despachado, stamp),
            DispatchChange::Delivered => self.set_status(DispatchStatus::Entregado, stamp),
            DispatchChange::Cancelled { reason, .. } => {
                self.cancel_reason = reason.clone();
                self.set_status(DispatchStatus::Cancelado, stamp);
            }
            DispatchChange::MovementsLinked { links } => {
                self.state.movements.extend(links.iter().cloned());
            }
        }
        self.state.bump();
    }

    fn handle(&self, cmd: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let change = match &cmd.action {
            DispatchAction::Create {
                warehouse_id,
                recipient,
                reference,
            } => {
                self.state.ensure_absent(cmd, "dispatch")?;
                if recipient.trim().is_empty() {
                    return Err(DomainError::validation("recipient cannot be empty"));
                }
                DispatchChange::Created {
                    warehouse_id: *warehouse_id,
                    recipient: recipient.clone(),
                    reference: reference.clone(),
                }
            }
            action => {
                self.state.ensure_target(cmd, "dispatch")?;
                self.decide(action)?
            }
        };
        Ok(vec![DocumentEvent::new(cmd, change)])
    }
}

impl Document for Dispatch {
    const KIND: DocumentKind = DocumentKind::Dispatch;

    fn empty(id: DocumentId) -> Self {
        Self {
            state: DocumentState::new(id),
            warehouse_id: None,
            recipient: String::new(),
            reference: None,
            status: DispatchStatus::Borrador,
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
            DispatchAction::LinkMovements { links },
        )
    }
}
