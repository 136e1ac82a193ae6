//! Product lots: traceable physical batches.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    CompanyId, DomainError, DomainResult, LotId, ProductId, SupplierId, WarehouseId,
};

/// Lot lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LotStatus {
    Active,
    Expired,
    Quarantined,
    Depleted,
}

impl core::fmt::Display for LotStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            LotStatus::Active => "active",
            LotStatus::Expired => "expired",
            LotStatus::Quarantined => "quarantined",
            LotStatus::Depleted => "depleted",
        };
        f.write_str(s)
    }
}

/// Data captured when a batch is received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotReceipt {
    pub company_id: CompanyId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub supplier_id: Option<SupplierId>,
    pub lot_number: String,
    pub manufactured_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    /// Set when the batch arrives through a transfer.
    pub origin_lot_id: Option<LotId>,
}

/// One physical batch located in one warehouse.
///
/// Invariant: `0 <= quantity_remaining <= quantity_produced`. Lots are never
/// deleted; they end up depleted, expired or quarantined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductLot {
    pub id: LotId,
    pub company_id: CompanyId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub supplier_id: Option<SupplierId>,
    pub lot_number: String,
    pub manufactured_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub quantity_produced: Decimal,
    pub quantity_remaining: Decimal,
    pub unit_cost: Decimal,
    pub status: LotStatus,
    pub origin_lot_id: Option<LotId>,
    pub created_at: DateTime<Utc>,
}

impl ProductLot {
    /// Create a lot from a receipt.
    pub fn receive(id: LotId, receipt: LotReceipt, at: DateTime<Utc>) -> DomainResult<Self> {
        if receipt.lot_number.trim().is_empty() {
            return Err(DomainError::validation("lot number cannot be empty"));
        }
        if receipt.quantity <= Decimal::ZERO {
            return Err(DomainError::validation("lot quantity must be positive"));
        }
        if receipt.unit_cost < Decimal::ZERO {
            return Err(DomainError::validation("unit cost cannot be negative"));
        }
        if let (Some(made), Some(expires)) = (receipt.manufactured_date, receipt.expiration_date) {
            if expires < made {
                return Err(DomainError::validation(
                    "expiration date precedes manufactured date",
                ));
            }
        }

        Ok(Self {
            id,
            company_id: receipt.company_id,
            warehouse_id: receipt.warehouse_id,
            product_id: receipt.product_id,
            supplier_id: receipt.supplier_id,
            lot_number: receipt.lot_number,
            manufactured_date: receipt.manufactured_date,
            expiration_date: receipt.expiration_date,
            quantity_produced: receipt.quantity,
            quantity_remaining: receipt.quantity,
            unit_cost: receipt.unit_cost,
            status: LotStatus::Active,
            origin_lot_id: receipt.origin_lot_id,
            created_at: at,
        })
    }

    pub fn is_available(&self) -> bool {
        self.status == LotStatus::Active && self.quantity_remaining > Decimal::ZERO
    }

    /// Take `quantity` out of the lot.
    pub fn consume(&mut self, quantity: Decimal) -> DomainResult<()> {
        if quantity <= Decimal::ZERO {
            return Err(DomainError::validation("consumed quantity must be positive"));
        }
        if self.status != LotStatus::Active {
            return Err(DomainError::transition("lot", self.status, "consume"));
        }
        if quantity > self.quantity_remaining {
            return Err(DomainError::insufficient(quantity, self.quantity_remaining));
        }

        self.quantity_remaining -= quantity;
        if self.quantity_remaining.is_zero() {
            self.status = LotStatus::Depleted;
        }
        Ok(())
    }

    /// Put `quantity` back (reversal or positive adjustment).
    pub fn restore(&mut self, quantity: Decimal) -> DomainResult<()> {
        if quantity <= Decimal::ZERO {
            return Err(DomainError::validation("restored quantity must be positive"));
        }
        let restored = self.quantity_remaining + quantity;
        if restored > self.quantity_produced {
            return Err(DomainError::invariant(format!(
                "lot {} would exceed its produced quantity ({restored} > {})",
                self.lot_number, self.quantity_produced
            )));
        }

        self.quantity_remaining = restored;
        if self.status == LotStatus::Depleted {
            self.status = LotStatus::Active;
        }
        Ok(())
    }

    pub fn quarantine(&mut self) -> DomainResult<()> {
        match self.status {
            LotStatus::Active | LotStatus::Expired => {
                self.status = LotStatus::Quarantined;
                Ok(())
            }
            other => Err(DomainError::transition("lot", other, "quarantine")),
        }
    }

    /// Release a quarantined lot back into rotation.
    pub fn release(&mut self, today: NaiveDate) -> DomainResult<()> {
        if self.status != LotStatus::Quarantined {
            return Err(DomainError::transition("lot", self.status, "release"));
        }
        self.status = if self.quantity_remaining.is_zero() {
            LotStatus::Depleted
        } else if self.is_expired_on(today) {
            LotStatus::Expired
        } else {
            LotStatus::Active
        };
        Ok(())
    }

    pub fn is_expired_on(&self, today: NaiveDate) -> bool {
        self.expiration_date.is_some_and(|d| d < today)
    }

    /// Expiry sweep. Returns `true` when the status changed.
    pub fn expire_if_due(&mut self, today: NaiveDate) -> bool {
        if self.status == LotStatus::Active && self.is_expired_on(today) {
            self.status = LotStatus::Expired;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn receipt(quantity: Decimal) -> LotReceipt {
        LotReceipt {
            company_id: CompanyId::new(),
            warehouse_id: WarehouseId::new(),
            product_id: ProductId::new(),
            supplier_id: None,
            lot_number: "L-001".to_string(),
            manufactured_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            expiration_date: NaiveDate::from_ymd_opt(2024, 6, 1),
            quantity,
            unit_cost: dec!(2.5),
            origin_lot_id: None,
        }
    }

    fn lot(quantity: Decimal) -> ProductLot {
        ProductLot::receive(LotId::new(), receipt(quantity), Utc::now()).unwrap()
    }

    #[test]
    fn consuming_everything_depletes_the_lot() {
        let mut l = lot(dec!(10));
        l.consume(dec!(10)).unwrap();
        assert_eq!(l.status, LotStatus::Depleted);
        assert!(!l.is_available());

        l.restore(dec!(4)).unwrap();
        assert_eq!(l.status, LotStatus::Active);
        assert_eq!(l.quantity_remaining, dec!(4));
    }

    #[test]
    fn over_consumption_is_insufficient_and_leaves_lot_untouched() {
        let mut l = lot(dec!(10));
        let err = l.consume(dec!(11)).unwrap_err();
        assert_eq!(err, DomainError::insufficient(dec!(11), dec!(10)));
        assert_eq!(l.quantity_remaining, dec!(10));
    }

    #[test]
    fn restore_cannot_exceed_produced() {
        let mut l = lot(dec!(10));
        l.consume(dec!(3)).unwrap();
        assert!(matches!(
            l.restore(dec!(4)),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn expiration_before_manufacture_is_rejected() {
        let mut r = receipt(dec!(1));
        r.expiration_date = NaiveDate::from_ymd_opt(2023, 1, 1);
        assert!(ProductLot::receive(LotId::new(), r, Utc::now()).is_err());
    }

    #[test]
    fn expiry_sweep_and_quarantine_cycle() {
        let mut l = lot(dec!(5));
        let before = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();
        let after = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();

        assert!(!l.expire_if_due(before));
        l.quarantine().unwrap();
        assert!(l.consume(dec!(1)).is_err());
        l.release(before).unwrap();
        assert_eq!(l.status, LotStatus::Active);

        assert!(l.expire_if_due(after));
        assert_eq!(l.status, LotStatus::Expired);
        assert!(matches!(
            l.release(after),
            Err(DomainError::InvalidStateTransition { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: no sequence of consume/restore calls breaks
        /// 0 <= remaining <= produced.
        #[test]
        fn remaining_stays_within_bounds(
            produced in 1i64..1_000,
            ops in prop::collection::vec((any::<bool>(), 1i64..200), 0..40)
        ) {
            let mut l = lot(Decimal::from(produced));
            for (take, qty) in ops {
                let qty = Decimal::from(qty);
                let _ = if take { l.consume(qty) } else { l.restore(qty) };
                prop_assert!(l.quantity_remaining >= Decimal::ZERO);
                prop_assert!(l.quantity_remaining <= l.quantity_produced);
            }
        }
    }
}
