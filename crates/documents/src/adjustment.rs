//! Inventory adjustments: corrections after counts, damage or loss.
//!
//! Line quantities are signed. A positive line becomes an inbound movement,
//! a negative one an outbound movement.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateRoot, CompanyId, DocumentId, DomainError, LotId, ProductId, Stamp,
    WarehouseId,
};
use stockledger_inventory::MovementType;

use crate::common::{
    Document, DocumentChange, DocumentCommand, DocumentEvent, DocumentKind, DocumentState,
    MovementLink, ensure_cost, ensure_links, next_line_no,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentStatus {
    Borrador,
    Pendiente,
    Aprobado,
    Rechazado,
    Procesado,
    Cancelado,
}

impl AdjustmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustmentStatus::Borrador => "borrador",
            AdjustmentStatus::Pendiente => "pendiente",
            AdjustmentStatus::Aprobado => "aprobado",
            AdjustmentStatus::Rechazado => "rechazado",
            AdjustmentStatus::Procesado => "procesado",
            AdjustmentStatus::Cancelado => "cancelado",
        }
    }
}

impl core::fmt::Display for AdjustmentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentLineInput {
    pub product_id: ProductId,
    /// Signed, non-zero.
    pub quantity: Decimal,
    pub lot_id: Option<LotId>,
    pub unit_cost: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub lot_id: Option<LotId>,
    pub unit_cost: Option<Decimal>,
}

impl AdjustmentLine {
    pub fn movement_type(&self) -> MovementType {
        if self.quantity > Decimal::ZERO {
            MovementType::AdjustmentIn
        } else {
            MovementType::AdjustmentOut
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentAction {
    Create {
        warehouse_id: WarehouseId,
        /// Used for lines whose direction it matches; other lines fall back
        /// to the default reason.
        reason_code: Option<String>,
        notes: Option<String>,
    },
    AddLine(AdjustmentLineInput),
    RemoveLine {
        line_no: u32,
    },
    Submit,
    Approve,
    Reject {
        reason: Option<String>,
    },
    Process,
    Cancel {
        reason: Option<String>,
    },
    LinkMovements {
        links: Vec<MovementLink>,
    },
}

pub type AdjustmentCommand = DocumentCommand<AdjustmentAction>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentChange {
    Created {
        warehouse_id: WarehouseId,
        reason_code: Option<String>,
        notes: Option<String>,
    },
    LineAdded(AdjustmentLine),
    LineRemoved {
        line_no: u32,
    },
    Submitted,
    Approved,
    Rejected {
        reason: Option<String>,
    },
    /// Fulfilling: one movement per line, direction from the sign.
    Processed {
        warehouse_id: WarehouseId,
        reason_code: Option<String>,
        notes: Option<String>,
        lines: Vec<AdjustmentLine>,
    },
    Cancelled {
        reason: Option<String>,
    },
    MovementsLinked {
        links: Vec<MovementLink>,
    },
}

impl DocumentChange for AdjustmentChange {
    fn event_type(&self) -> &'static str {
        match self {
            AdjustmentChange::Created { .. } => "documents.adjustment.created",
            AdjustmentChange::LineAdded(_) => "documents.adjustment.line_added",
            AdjustmentChange::LineRemoved { .. } => "documents.adjustment.line_removed",
            AdjustmentChange::Submitted => "documents.adjustment.submitted",
            AdjustmentChange::Approved => "documents.adjustment.approved",
            AdjustmentChange::Rejected { .. } => "documents.adjustment.rejected",
            AdjustmentChange::Processed { .. } => "documents.adjustment.processed",
            AdjustmentChange::Cancelled { .. } => "documents.adjustment.cancelled",
            AdjustmentChange::MovementsLinked { .. } => "documents.adjustment.movements_linked",
        }
    }
}

pub type AdjustmentEvent = DocumentEvent<AdjustmentChange>;

/// Aggregate root: InventoryAdjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryAdjustment {
    state: DocumentState,
    warehouse_id: Option<WarehouseId>,
    reason_code: Option<String>,
    notes: Option<String>,
    status: AdjustmentStatus,
    lines: Vec<AdjustmentLine>,
    rejection_reason: Option<String>,
}

impl InventoryAdjustment {
    pub fn status(&self) -> AdjustmentStatus {
        self.status
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn reason_code(&self) -> Option<&str> {
        self.reason_code.as_deref()
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn lines(&self) -> &[AdjustmentLine] {
        &self.lines
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    /// Net signed quantity across lines.
    pub fn net_quantity(&self) -> Decimal {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    fn set_status(&mut self, status: AdjustmentStatus, stamp: Stamp) {
        self.status = status;
        self.state.record_status(status.as_str(), stamp);
    }

    fn require(&self, allowed: &[AdjustmentStatus], action: &'static str) -> Result<(), DomainError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::transition("adjustment", self.status, action))
        }
    }

    fn decide(&self, action: &AdjustmentAction) -> Result<AdjustmentChange, DomainError> {
        use AdjustmentStatus::*;
        match action {
            AdjustmentAction::Create { .. } => {
                Err(DomainError::conflict("adjustment already exists"))
            }
            AdjustmentAction::AddLine(input) => {
                self.require(&[Borrador], "add a line to")?;
                if input.quantity.is_zero() {
                    return Err(DomainError::validation("adjustment quantity cannot be zero"));
                }
                if let Some(cost) = input.unit_cost {
                    ensure_cost(cost)?;
                }
                Ok(AdjustmentChange::LineAdded(AdjustmentLine {
                    line_no: next_line_no(&self.lines, |l| l.line_no),
                    product_id: input.product_id,
                    quantity: input.quantity,
                    lot_id: input.lot_id,
                    unit_cost: input.unit_cost,
                }))
            }
            AdjustmentAction::RemoveLine { line_no } => {
                self.require(&[Borrador], "remove a line from")?;
                if !self.lines.iter().any(|l| l.line_no == *line_no) {
                    return Err(DomainError::not_found(format!("adjustment line {line_no}")));
                }
                Ok(AdjustmentChange::LineRemoved { line_no: *line_no })
            }
            AdjustmentAction::Submit => {
                self.require(&[Borrador], "submit")?;
                if self.lines.is_empty() {
                    return Err(DomainError::validation(
                        "cannot submit an adjustment without lines",
                    ));
                }
                Ok(AdjustmentChange::Submitted)
            }
            AdjustmentAction::Approve => {
                self.require(&[Pendiente], "approve")?;
                Ok(AdjustmentChange::Approved)
            }
            AdjustmentAction::Reject { reason } => {
                self.require(&[Pendiente], "reject")?;
                Ok(AdjustmentChange::Rejected {
                    reason: reason.clone(),
                })
            }
            AdjustmentAction::Process => {
                self.require(&[Aprobado], "process")?;
                let warehouse_id = self
                    .warehouse_id
                    .ok_or_else(|| DomainError::invariant("adjustment has no warehouse"))?;
                Ok(AdjustmentChange::Processed {
                    warehouse_id,
                    reason_code: self.reason_code.clone(),
                    notes: self.notes.clone(),
                    lines: self.lines.clone(),
                })
            }
            AdjustmentAction::Cancel { reason } => {
                self.require(&[Borrador, Pendiente, Aprobado], "cancel")?;
                Ok(AdjustmentChange::Cancelled {
                    reason: reason.clone(),
                })
            }
            AdjustmentAction::LinkMovements { links } => {
                self.require(&[Procesado], "link movements to")?;
                ensure_links(links, |n| self.lines.iter().any(|l| l.line_no == n))?;
                Ok(AdjustmentChange::MovementsLinked {
                    links: links.clone(),
                })
            }
        }
    }
}

impl AggregateRoot for InventoryAdjustment {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn version(&self) -> u64 {
        self.state.version
    }
}

impl Aggregate for InventoryAdjustment {
    type Command = AdjustmentCommand;
    type Event = AdjustmentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        let stamp = event.stamp();
        match &event.change {
            AdjustmentChange::Created {
                warehouse_id,
                reason_code,
                notes,
            } => {
                self.warehouse_id = Some(*warehouse_id);
                self.reason_code = reason_code.clone();
                self.notes = notes.clone();
                self.status = AdjustmentStatus::Borrador;
                self.state
                    .record_created(event.company_id, self.status.as_str(), stamp);
            }
            AdjustmentChange::LineAdded(line) => self.lines.push(line.clone()),
            AdjustmentChange::LineRemoved { line_no } => {
                self.lines.retain(|l| l.line_no != *line_no)
            }
            AdjustmentChange::Submitted => self.set_status(AdjustmentStatus::Pendiente, stamp),
            AdjustmentChange::Approved => self.set_status(AdjustmentStatus::Aprobado, stamp),
            AdjustmentChange::Rejected { reason } => {
                self.rejection_reason = reason.clone();
                self.set_status(AdjustmentStatus::Rechazado, stamp);
            }
            AdjustmentChange::Processed { .. } => {
                self.set_status(AdjustmentStatus::Procesado, stamp)
            }
            AdjustmentChange::Cancelled { .. } => {
                self.set_status(AdjustmentStatus::Cancelado, stamp)
            }
            AdjustmentChange::MovementsLinked { links } => {
                self.state.movements.extend(links.iter().cloned());
            }
        }
        self.state.bump();
    }

    fn handle(&self, cmd: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let change = match &cmd.action {
            AdjustmentAction::Create {
                warehouse_id,
                reason_code,
                notes,
            } => {
                self.state.ensure_absent(cmd, "adjustment")?;
                AdjustmentChange::Created {
                    warehouse_id: *warehouse_id,
                    reason_code: reason_code.clone(),
                    notes: notes.clone(),
                }
            }
            action => {
                self.state.ensure_target(cmd, "adjustment")?;
                self.decide(action)?
            }
        };
        Ok(vec![DocumentEvent::new(cmd, change)])
    }
}

impl Document for InventoryAdjustment {
    const KIND: DocumentKind = DocumentKind::Adjustment;

    fn empty(id: DocumentId) -> Self {
        Self {
            state: DocumentState::new(id),
            warehouse_id: None,
            reason_code: None,
            notes: None,
            status: AdjustmentStatus::Borrador,
            lines: Vec::new(),
            rejection_reason: None,
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
            AdjustmentAction::LinkMovements { links },
        )
    }
}
