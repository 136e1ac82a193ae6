//! Cached per-(product, warehouse) inventory figures.
//!
//! Derived from the ledger, never authoritative. Closures reconcile it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    ActorId, CompanyId, DomainError, DomainResult, ProductId, Stamp, WarehouseId,
};

/// Scale kept for the weighted average cost.
const COST_SCALE: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub company_id: CompanyId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
    pub reserved_quantity: Decimal,
    /// `quantity - reserved_quantity`.
    pub available_quantity: Decimal,
    /// Weighted average unit cost.
    pub unit_cost: Decimal,
    pub total_value: Decimal,
    pub last_count_quantity: Option<Decimal>,
    pub last_count_date: Option<DateTime<Utc>>,
    pub last_count_by: Option<ActorId>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InventorySnapshot {
    pub fn empty(company_id: CompanyId, product_id: ProductId, warehouse_id: WarehouseId) -> Self {
        Self {
            company_id,
            product_id,
            warehouse_id,
            quantity: Decimal::ZERO,
            reserved_quantity: Decimal::ZERO,
            available_quantity: Decimal::ZERO,
            unit_cost: Decimal::ZERO,
            total_value: Decimal::ZERO,
            last_count_quantity: None,
            last_count_date: None,
            last_count_by: None,
            updated_at: None,
        }
    }

    fn refresh(&mut self, at: DateTime<Utc>) {
        self.available_quantity = self.quantity - self.reserved_quantity;
        self.updated_at = Some(at);
    }

    /// Inbound stock at `unit_cost`; re-weights the average cost.
    pub fn apply_inbound(&mut self, quantity: Decimal, unit_cost: Decimal, at: DateTime<Utc>) {
        self.quantity += quantity;
        self.total_value += quantity * unit_cost;
        if self.quantity > Decimal::ZERO {
            self.unit_cost = (self.total_value / self.quantity).round_dp(COST_SCALE);
        }
        self.refresh(at);
    }

    /// Outbound stock leaves at the current average cost.
    pub fn apply_outbound(&mut self, quantity: Decimal, at: DateTime<Utc>) -> DomainResult<()> {
        if quantity > self.quantity {
            return Err(DomainError::insufficient(quantity, self.quantity));
        }
        self.quantity -= quantity;
        self.total_value = if self.quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.total_value - quantity * self.unit_cost
        };
        self.refresh(at);
        Ok(())
    }

    /// Hold stock without touching the ledger.
    pub fn reserve(&mut self, quantity: Decimal, at: DateTime<Utc>) -> DomainResult<()> {
        if quantity <= Decimal::ZERO {
            return Err(DomainError::validation("reserved quantity must be positive"));
        }
        if quantity > self.available_quantity {
            return Err(DomainError::insufficient(quantity, self.available_quantity));
        }
        self.reserved_quantity += quantity;
        self.refresh(at);
        Ok(())
    }

    /// Give back a hold (cancellation or rejection).
    pub fn release(&mut self, quantity: Decimal, at: DateTime<Utc>) -> DomainResult<()> {
        if quantity > self.reserved_quantity {
            return Err(DomainError::invariant(format!(
                "cannot release {quantity}, only {} reserved",
                self.reserved_quantity
            )));
        }
        self.reserved_quantity -= quantity;
        self.refresh(at);
        Ok(())
    }

    pub fn record_count(&mut self, quantity: Decimal, stamp: Stamp) {
        self.last_count_quantity = Some(quantity);
        self.last_count_date = Some(stamp.at);
        self.last_count_by = Some(stamp.actor_id);
        self.updated_at = Some(stamp.at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot() -> InventorySnapshot {
        InventorySnapshot::empty(CompanyId::new(), ProductId::new(), WarehouseId::new())
    }

    #[test]
    fn weighted_average_cost() {
        let mut s = snapshot();
        let now = Utc::now();
        s.apply_inbound(dec!(100), dec!(10), now);
        assert_eq!(s.total_value, dec!(1000));
        s.apply_inbound(dec!(100), dec!(20), now);
        assert_eq!(s.unit_cost, dec!(15));

        s.apply_outbound(dec!(50), now).unwrap();
        assert_eq!(s.quantity, dec!(150));
        assert_eq!(s.total_value, dec!(2250));

        s.apply_outbound(dec!(150), now).unwrap();
        assert_eq!(s.total_value, dec!(0));
        assert!(s.apply_outbound(dec!(1), now).is_err());
    }

    #[test]
    fn reservations_only_move_available() {
        let mut s = snapshot();
        let now = Utc::now();
        s.apply_inbound(dec!(10), dec!(1), now);

        s.reserve(dec!(6), now).unwrap();
        assert_eq!(s.quantity, dec!(10));
        assert_eq!(s.available_quantity, dec!(4));
        assert_eq!(
            s.reserve(dec!(5), now).unwrap_err(),
            DomainError::insufficient(dec!(5), dec!(4))
        );

        s.release(dec!(6), now).unwrap();
        assert_eq!(s.available_quantity, dec!(10));
        assert!(s.release(dec!(1), now).is_err());
    }

    #[test]
    fn counts_are_stamped() {
        let mut s = snapshot();
        let stamp = Stamp::now(ActorId::new());
        s.record_count(dec!(42), stamp);
        assert_eq!(s.last_count_quantity, Some(dec!(42)));
        assert_eq!(s.last_count_by, Some(stamp.actor_id));
    }
}
