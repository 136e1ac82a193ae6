//! Ledger entries and their lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    CompanyId, DocumentId, DomainError, DomainResult, LotId, MovementId, ProductId, Stamp,
    TransferCorrelationId, WarehouseId,
};

/// Direction of a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementCategory {
    In,
    Out,
}

/// Kind of ledger entry. The category is fixed per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    PurchaseReceipt,
    DonationReceipt,
    TransferIn,
    CustomerReturn,
    AdjustmentIn,
    Dispatch,
    TransferOut,
    AdjustmentOut,
    WriteOff,
}

impl MovementType {
    pub const ALL: [MovementType; 9] = [
        MovementType::PurchaseReceipt,
        MovementType::DonationReceipt,
        MovementType::TransferIn,
        MovementType::CustomerReturn,
        MovementType::AdjustmentIn,
        MovementType::Dispatch,
        MovementType::TransferOut,
        MovementType::AdjustmentOut,
        MovementType::WriteOff,
    ];

    pub fn category(self) -> MovementCategory {
        match self {
            MovementType::PurchaseReceipt
            | MovementType::DonationReceipt
            | MovementType::TransferIn
            | MovementType::CustomerReturn
            | MovementType::AdjustmentIn => MovementCategory::In,
            MovementType::Dispatch
            | MovementType::TransferOut
            | MovementType::AdjustmentOut
            | MovementType::WriteOff => MovementCategory::Out,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::PurchaseReceipt => "purchase_receipt",
            MovementType::DonationReceipt => "donation_receipt",
            MovementType::TransferIn => "transfer_in",
            MovementType::CustomerReturn => "customer_return",
            MovementType::AdjustmentIn => "adjustment_in",
            MovementType::Dispatch => "dispatch",
            MovementType::TransferOut => "transfer_out",
            MovementType::AdjustmentOut => "adjustment_out",
            MovementType::WriteOff => "write_off",
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a movement came from. Exactly one source per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "document_id", rename_all = "snake_case")]
pub enum Provenance {
    Purchase(DocumentId),
    Dispatch(DocumentId),
    Donation(DocumentId),
    Transfer(DocumentId),
    Adjustment(DocumentId),
    Manual,
}

impl Provenance {
    pub fn document_id(&self) -> Option<DocumentId> {
        match *self {
            Provenance::Purchase(id)
            | Provenance::Dispatch(id)
            | Provenance::Donation(id)
            | Provenance::Transfer(id)
            | Provenance::Adjustment(id) => Some(id),
            Provenance::Manual => None,
        }
    }

    fn admits(&self, movement_type: MovementType) -> bool {
        match self {
            Provenance::Purchase(_) => movement_type == MovementType::PurchaseReceipt,
            Provenance::Dispatch(_) => movement_type == MovementType::Dispatch,
            Provenance::Donation(_) => movement_type == MovementType::DonationReceipt,
            Provenance::Transfer(_) => matches!(
                movement_type,
                MovementType::TransferIn | MovementType::TransferOut
            ),
            Provenance::Adjustment(_) => matches!(
                movement_type,
                MovementType::AdjustmentIn | MovementType::AdjustmentOut | MovementType::WriteOff
            ),
            Provenance::Manual => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
    Cancelled,
}

impl MovementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MovementStatus::Rejected | MovementStatus::Completed | MovementStatus::Cancelled
        )
    }
}

impl core::fmt::Display for MovementStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            MovementStatus::Pending => "pending",
            MovementStatus::Approved => "approved",
            MovementStatus::Rejected => "rejected",
            MovementStatus::Completed => "completed",
            MovementStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCheck {
    NotRequired,
    Pending,
    Passed,
    Failed,
}

impl core::fmt::Display for QualityCheck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            QualityCheck::NotRequired => "not_required",
            QualityCheck::Pending => "pending",
            QualityCheck::Passed => "passed",
            QualityCheck::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Input for a new ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMovement {
    pub company_id: CompanyId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub lot_id: Option<LotId>,
    pub movement_type: MovementType,
    /// Explicit reason; `None` uses the default reason for the movement type.
    pub reason_code: Option<String>,
    /// Always positive; the direction comes from the movement type.
    pub quantity: Decimal,
    /// Explicit unit cost; otherwise the lot cost, then the weighted average.
    pub unit_cost: Option<Decimal>,
    pub provenance: Provenance,
    pub transfer_correlation_id: Option<TransferCorrelationId>,
    pub notes: Option<String>,
    pub reference: Option<String>,
    /// Approved upstream by the owning document.
    #[serde(default)]
    pub pre_approved: bool,
    /// Draws on stock already reserved for this request.
    #[serde(default)]
    pub from_reservation: bool,
}

impl NewMovement {
    pub fn manual(
        company_id: CompanyId,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        movement_type: MovementType,
        quantity: Decimal,
    ) -> Self {
        Self {
            company_id,
            product_id,
            warehouse_id,
            lot_id: None,
            movement_type,
            reason_code: None,
            quantity,
            unit_cost: None,
            provenance: Provenance::Manual,
            transfer_correlation_id: None,
            notes: None,
            reference: None,
            pre_approved: false,
            from_reservation: false,
        }
    }

    pub fn category(&self) -> MovementCategory {
        self.movement_type.category()
    }

    /// Structural checks that need no stored state.
    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity <= Decimal::ZERO {
            return Err(DomainError::validation("movement quantity must be positive"));
        }
        if self.unit_cost.is_some_and(|c| c < Decimal::ZERO) {
            return Err(DomainError::validation("unit cost cannot be negative"));
        }
        if !self.provenance.admits(self.movement_type) {
            return Err(DomainError::validation(format!(
                "{:?} provenance cannot produce a {} movement",
                self.provenance, self.movement_type
            )));
        }
        let is_transfer = matches!(
            self.movement_type,
            MovementType::TransferIn | MovementType::TransferOut
        );
        if is_transfer != self.transfer_correlation_id.is_some() {
            return Err(DomainError::validation(
                "transfer movements carry a correlation id, other movements must not",
            ));
        }
        if self.from_reservation && self.category() != MovementCategory::Out {
            return Err(DomainError::validation(
                "only outbound movements can draw on a reservation",
            ));
        }
        Ok(())
    }
}

/// Terms fixed when the entry is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementTerms {
    pub reason_code: String,
    pub unit_cost: Decimal,
    pub requires_approval: bool,
    pub requires_quality_check: bool,
}

/// One ledger entry.
///
/// Invariant: exactly one of `quantity_in` / `quantity_out` is non-zero.
/// Balance fields are meaningful once the entry is completed; completed
/// entries are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryMovement {
    pub id: MovementId,
    pub company_id: CompanyId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub lot_id: Option<LotId>,
    pub movement_type: MovementType,
    pub reason_code: String,
    pub quantity_in: Decimal,
    pub quantity_out: Decimal,
    pub unit_cost: Decimal,
    pub total_cost: Decimal,
    pub previous_quantity: Decimal,
    pub new_quantity: Decimal,
    pub balance_quantity: Decimal,
    /// Position in the (product, warehouse) chain; 0 until posted.
    pub sequence: u64,
    pub status: MovementStatus,
    pub requires_approval: bool,
    pub quality_check: QualityCheck,
    pub provenance: Provenance,
    pub transfer_correlation_id: Option<TransferCorrelationId>,
    pub notes: Option<String>,
    pub reference: Option<String>,
    /// Quantity held on the snapshot for this entry while it waits.
    pub reserved_quantity: Decimal,
    /// Business date; re-stamped when the entry is posted.
    pub movement_date: DateTime<Utc>,
    pub created: Stamp,
    pub approved: Option<Stamp>,
    pub rejected: Option<Stamp>,
    pub rejection_reason: Option<String>,
    pub completed: Option<Stamp>,
    pub cancelled: Option<Stamp>,
    pub quality_checked: Option<Stamp>,
}

impl InventoryMovement {
    /// Record an entry in `pending`. The ledger posts it right away when
    /// neither approval nor a quality check is outstanding.
    pub fn record(id: MovementId, input: NewMovement, terms: MovementTerms, created: Stamp) -> Self {
        let (quantity_in, quantity_out) = match input.category() {
            MovementCategory::In => (input.quantity, Decimal::ZERO),
            MovementCategory::Out => (Decimal::ZERO, input.quantity),
        };
        let approved = if input.pre_approved && terms.requires_approval {
            Some(created)
        } else {
            None
        };
        Self {
            id,
            company_id: input.company_id,
            product_id: input.product_id,
            warehouse_id: input.warehouse_id,
            lot_id: input.lot_id,
            movement_type: input.movement_type,
            reason_code: terms.reason_code,
            quantity_in,
            quantity_out,
            unit_cost: terms.unit_cost,
            total_cost: input.quantity * terms.unit_cost,
            previous_quantity: Decimal::ZERO,
            new_quantity: Decimal::ZERO,
            balance_quantity: Decimal::ZERO,
            sequence: 0,
            status: if approved.is_some() {
                MovementStatus::Approved
            } else {
                MovementStatus::Pending
            },
            requires_approval: terms.requires_approval,
            quality_check: if terms.requires_quality_check {
                QualityCheck::Pending
            } else {
                QualityCheck::NotRequired
            },
            provenance: input.provenance,
            transfer_correlation_id: input.transfer_correlation_id,
            notes: input.notes,
            reference: input.reference,
            reserved_quantity: Decimal::ZERO,
            movement_date: created.at,
            created,
            approved,
            rejected: None,
            rejection_reason: None,
            completed: None,
            cancelled: None,
            quality_checked: None,
        }
    }

    pub fn category(&self) -> MovementCategory {
        self.movement_type.category()
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity_in + self.quantity_out
    }

    /// `quantity_in - quantity_out`.
    pub fn signed_quantity(&self) -> Decimal {
        self.quantity_in - self.quantity_out
    }

    pub fn is_completed(&self) -> bool {
        self.status == MovementStatus::Completed
    }

    /// Whether `complete` would succeed now.
    pub fn is_ready(&self) -> bool {
        self.ensure_completable().is_ok()
    }

    pub fn approve(&mut self, stamp: Stamp) -> DomainResult<()> {
        if self.status != MovementStatus::Pending {
            return Err(DomainError::transition("movement", self.status, "approve"));
        }
        self.status = MovementStatus::Approved;
        self.approved = Some(stamp);
        Ok(())
    }

    pub fn reject(&mut self, stamp: Stamp, reason: Option<String>) -> DomainResult<()> {
        if self.status != MovementStatus::Pending {
            return Err(DomainError::transition("movement", self.status, "reject"));
        }
        self.status = MovementStatus::Rejected;
        self.rejected = Some(stamp);
        self.rejection_reason = reason;
        Ok(())
    }

    pub fn cancel(&mut self, stamp: Stamp) -> DomainResult<()> {
        match self.status {
            MovementStatus::Pending | MovementStatus::Approved => {
                self.status = MovementStatus::Cancelled;
                self.cancelled = Some(stamp);
                Ok(())
            }
            other => Err(DomainError::transition("movement", other, "cancel")),
        }
    }

    pub fn record_quality_check(&mut self, passed: bool, stamp: Stamp) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::transition(
                "movement",
                self.status,
                "record quality check for",
            ));
        }
        if self.quality_check != QualityCheck::Pending {
            return Err(DomainError::transition(
                "quality check",
                self.quality_check,
                "record",
            ));
        }
        self.quality_check = if passed {
            QualityCheck::Passed
        } else {
            QualityCheck::Failed
        };
        self.quality_checked = Some(stamp);
        Ok(())
    }

    /// Approval (if needed) granted and no quality check outstanding or failed.
    pub fn ensure_completable(&self) -> DomainResult<()> {
        match self.status {
            MovementStatus::Approved => {}
            MovementStatus::Pending if !self.requires_approval => {}
            other => return Err(DomainError::transition("movement", other, "complete")),
        }
        match self.quality_check {
            QualityCheck::NotRequired | QualityCheck::Passed => Ok(()),
            other => Err(DomainError::transition("quality check", other, "complete")),
        }
    }

    /// Mark as completed with the balance fields computed by the posting.
    pub(crate) fn mark_posted(
        &mut self,
        previous_quantity: Decimal,
        sequence: u64,
        movement_date: DateTime<Utc>,
        stamp: Stamp,
    ) {
        let new_quantity = previous_quantity + self.signed_quantity();
        self.previous_quantity = previous_quantity;
        self.new_quantity = new_quantity;
        self.balance_quantity = new_quantity;
        self.sequence = sequence;
        self.movement_date = movement_date;
        self.status = MovementStatus::Completed;
        self.completed = Some(stamp);
        self.reserved_quantity = Decimal::ZERO;
    }
}
