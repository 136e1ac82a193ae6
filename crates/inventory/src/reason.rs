//! Movement reason catalog.
//!
//! Reasons are referenced by movements, never owned by them. A company may
//! override a global reason by defining one with the same code.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{CompanyId, DomainError, DomainResult};

use crate::movement::{MovementCategory, MovementType, NewMovement};

/// Fields a reason can make mandatory on the movement input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredField {
    Lot,
    UnitCost,
    Notes,
    Reference,
}

impl RequiredField {
    fn is_present(self, input: &NewMovement) -> bool {
        fn filled(s: &Option<String>) -> bool {
            s.as_deref().is_some_and(|v| !v.trim().is_empty())
        }
        match self {
            RequiredField::Lot => input.lot_id.is_some(),
            RequiredField::UnitCost => input.unit_cost.is_some(),
            RequiredField::Notes => filled(&input.notes),
            RequiredField::Reference => filled(&input.reference),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementReason {
    pub code: String,
    /// `None` for global defaults.
    pub company_id: Option<CompanyId>,
    pub description: String,
    pub movement_type: MovementType,
    pub category: MovementCategory,
    /// Used when a movement names no reason.
    pub is_default: bool,
    pub requires_approval: bool,
    /// Approval applies when the movement's total cost reaches this value.
    pub approval_threshold: Decimal,
    pub requires_quality_check: bool,
    pub required_fields: Vec<RequiredField>,
    pub active: bool,
}

impl MovementReason {
    /// Global, active reason with no approval or quality check.
    pub fn global(code: &str, description: &str, movement_type: MovementType) -> Self {
        Self {
            code: code.to_string(),
            company_id: None,
            description: description.to_string(),
            movement_type,
            category: movement_type.category(),
            is_default: false,
            requires_approval: false,
            approval_threshold: Decimal::ZERO,
            requires_quality_check: false,
            required_fields: Vec::new(),
            active: true,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn for_company(mut self, company_id: CompanyId) -> Self {
        self.company_id = Some(company_id);
        self
    }

    pub fn with_approval(mut self, threshold: Decimal) -> Self {
        self.requires_approval = true;
        self.approval_threshold = threshold;
        self
    }

    pub fn with_quality_check(mut self) -> Self {
        self.requires_quality_check = true;
        self
    }

    pub fn requiring(mut self, field: RequiredField) -> Self {
        if !self.required_fields.contains(&field) {
            self.required_fields.push(field);
        }
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.code.trim().is_empty() {
            return Err(DomainError::validation("reason code cannot be empty"));
        }
        if self.category != self.movement_type.category() {
            return Err(DomainError::validation(format!(
                "reason {} category does not match {}",
                self.code, self.movement_type
            )));
        }
        if self.approval_threshold < Decimal::ZERO {
            return Err(DomainError::validation("approval threshold cannot be negative"));
        }
        Ok(())
    }

    /// Check that the reason applies to the input and that its required fields are set.
    pub fn check(&self, input: &NewMovement) -> DomainResult<()> {
        if self.movement_type != input.movement_type {
            return Err(DomainError::validation(format!(
                "reason {} applies to {} movements, not {}",
                self.code, self.movement_type, input.movement_type
            )));
        }
        let missing: Vec<String> = self
            .required_fields
            .iter()
            .filter(|f| !f.is_present(input))
            .map(|f| format!("{f:?}").to_lowercase())
            .collect();
        if !missing.is_empty() {
            return Err(DomainError::validation(format!(
                "reason {} requires: {}",
                self.code,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    pub fn requires_approval_for(&self, total_cost: Decimal) -> bool {
        self.requires_approval && total_cost >= self.approval_threshold
    }
}

/// The set of reasons visible to one company (its own plus the globals).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCatalog {
    reasons: Vec<MovementReason>,
}

impl ReasonCatalog {
    pub fn new(reasons: Vec<MovementReason>) -> Self {
        Self { reasons }
    }

    /// Global defaults: one default reason per movement type, plus a few
    /// specialised ones.
    pub fn standard() -> Self {
        use MovementType::*;
        Self::new(vec![
            MovementReason::global("purchase", "Purchase receipt", PurchaseReceipt).as_default(),
            MovementReason::global("donation", "Donation received", DonationReceipt).as_default(),
            MovementReason::global("transfer_in", "Transfer received", TransferIn).as_default(),
            MovementReason::global("transfer_out", "Transfer shipped", TransferOut).as_default(),
            MovementReason::global("customer_return", "Customer return", CustomerReturn)
                .as_default()
                .with_quality_check(),
            MovementReason::global("dispatch", "Dispatch", Dispatch).as_default(),
            MovementReason::global("count_surplus", "Count surplus", AdjustmentIn).as_default(),
            MovementReason::global("count_shortage", "Count shortage", AdjustmentOut).as_default(),
            MovementReason::global("damage", "Damaged goods", WriteOff)
                .as_default()
                .with_approval(Decimal::ZERO)
                .requiring(RequiredField::Notes),
            MovementReason::global("expiry", "Expired goods", WriteOff)
                .with_approval(Decimal::ZERO)
                .requiring(RequiredField::Lot),
        ])
    }

    fn find_scoped(
        &self,
        company_id: CompanyId,
        pred: impl Fn(&MovementReason) -> bool,
    ) -> Option<&MovementReason> {
        let visible = |owner: Option<CompanyId>| {
            self.reasons
                .iter()
                .find(|r| r.active && r.company_id == owner && pred(r))
        };
        visible(Some(company_id)).or_else(|| visible(None))
    }

    /// The active reason with `code`, the company's own before the global one.
    pub fn find(&self, company_id: CompanyId, code: &str) -> Option<&MovementReason> {
        self.find_scoped(company_id, |r| r.code == code)
    }

    pub fn reasons(&self) -> &[MovementReason] {
        &self.reasons
    }

    pub fn push(&mut self, reason: MovementReason) {
        self.reasons.push(reason);
    }

    /// Resolve the reason for a movement.
    ///
    /// An explicit code must exist (company first, then global) and match the
    /// movement type. Without a code, the company default for the type wins
    /// over the global default.
    pub fn resolve(
        &self,
        company_id: CompanyId,
        code: Option<&str>,
        movement_type: MovementType,
    ) -> DomainResult<&MovementReason> {
        match code {
            Some(code) => {
                let reason = self
                    .find(company_id, code)
                    .ok_or_else(|| {
                        DomainError::configuration_missing(format!("movement reason '{code}'"))
                    })?;
                if reason.movement_type != movement_type {
                    return Err(DomainError::validation(format!(
                        "reason {code} applies to {} movements, not {movement_type}",
                        reason.movement_type
                    )));
                }
                Ok(reason)
            }
            None => self
                .find_scoped(company_id, |r| {
                    r.is_default && r.movement_type == movement_type
                })
                .ok_or_else(|| {
                    DomainError::configuration_missing(format!(
                        "default movement reason for {movement_type}"
                    ))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockledger_core::{ProductId, WarehouseId};

    fn test_company_id() -> CompanyId {
        CompanyId::new()
    }

    #[test]
    fn standard_catalog_has_a_default_for_every_type() {
        let catalog = ReasonCatalog::standard();
        let company = test_company_id();
        for t in MovementType::ALL {
            let reason = catalog.resolve(company, None, t).unwrap();
            assert_eq!(reason.movement_type, t);
            reason.validate().unwrap();
        }
    }

    #[test]
    fn company_override_wins_over_global() {
        let company = test_company_id();
        let mut catalog = ReasonCatalog::standard();
        catalog.push(
            MovementReason::global("dispatch", "Dispatch with sign-off", MovementType::Dispatch)
                .as_default()
                .for_company(company)
                .with_approval(dec!(500)),
        );

        let own = catalog.resolve(company, Some("dispatch"), MovementType::Dispatch).unwrap();
        assert!(own.requires_approval);
        let own_default = catalog.resolve(company, None, MovementType::Dispatch).unwrap();
        assert_eq!(own_default.company_id, Some(company));

        let other = catalog
            .resolve(test_company_id(), Some("dispatch"), MovementType::Dispatch)
            .unwrap();
        assert!(!other.requires_approval);
    }

    #[test]
    fn find_looks_in_the_company_before_the_global_catalog() {
        let company = test_company_id();
        let mut catalog = ReasonCatalog::standard();
        catalog.push(
            MovementReason::global("damage", "Damaged in transit", MovementType::AdjustmentOut)
                .for_company(company),
        );

        assert_eq!(
            catalog.find(company, "damage").map(|r| r.movement_type),
            Some(MovementType::AdjustmentOut)
        );
        assert_eq!(
            catalog.find(test_company_id(), "damage").map(|r| r.movement_type),
            Some(MovementType::WriteOff)
        );
        assert!(catalog.find(company, "missing").is_none());
    }

    #[test]
    fn unknown_or_inactive_reason_is_configuration_missing() {
        let company = test_company_id();
        let mut catalog = ReasonCatalog::new(vec![
            MovementReason::global("dispatch", "Dispatch", MovementType::Dispatch).as_default(),
        ]);
        assert!(matches!(
            catalog.resolve(company, Some("nope"), MovementType::Dispatch),
            Err(DomainError::ConfigurationMissing(_))
        ));
        assert!(matches!(
            catalog.resolve(company, None, MovementType::WriteOff),
            Err(DomainError::ConfigurationMissing(_))
        ));

        catalog.reasons[0].active = false;
        assert!(catalog.resolve(company, None, MovementType::Dispatch).is_err());
    }

    #[test]
    fn reason_must_match_the_movement_type() {
        let catalog = ReasonCatalog::standard();
        let err = catalog
            .resolve(test_company_id(), Some("purchase"), MovementType::Dispatch)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn required_fields_and_threshold() {
        let reason = MovementReason::global("damage", "Damaged", MovementType::WriteOff)
            .with_approval(dec!(100))
            .requiring(RequiredField::Notes)
            .requiring(RequiredField::Lot);
        let mut input = NewMovement::manual(
            test_company_id(),
            ProductId::new(),
            WarehouseId::new(),
            MovementType::WriteOff,
            dec!(1),
        );

        let err = reason.check(&input).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("notes") && msg.contains("lot")));

        input.notes = Some("crushed pallet".into());
        input.lot_id = Some(stockledger_core::LotId::new());
        reason.check(&input).unwrap();

        assert!(!reason.requires_approval_for(dec!(99.99)));
        assert!(reason.requires_approval_for(dec!(100)));
    }
}
