//! Per-product closure figures.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{ClosureId, CompanyId, ProductId, Stamp, WarehouseId};
use stockledger_inventory::{InventoryMovement, MovementStatus};

/// Default threshold under which a count difference is noise.
pub const DEFAULT_DISCREPANCY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 4);

const COST_SCALE: u32 = 6;

/// Quantity and value a product starts the period with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Opening {
    pub quantity: Decimal,
    pub value: Decimal,
}

/// Completed movements of one product inside the period.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeriodActivity {
    pub quantity_in: Decimal,
    pub value_in: Decimal,
    pub quantity_out: Decimal,
    pub value_out: Decimal,
    pub movement_count: u64,
    /// Running balance after the last movement of the period.
    pub last_balance: Option<Decimal>,
}

impl PeriodActivity {
    /// Aggregate completed movements; the latest by (movement_date, id) gives
    /// the closing balance.
    pub fn from_movements(movements: &[InventoryMovement]) -> Self {
        let mut activity = Self::default();
        let mut last: Option<&InventoryMovement> = None;
        for m in movements.iter().filter(|m| m.status == MovementStatus::Completed) {
            activity.quantity_in += m.quantity_in;
            activity.quantity_out += m.quantity_out;
            if m.quantity_in > Decimal::ZERO {
                activity.value_in += m.total_cost;
            } else {
                activity.value_out += m.total_cost;
            }
            activity.movement_count += 1;
            if last.is_none_or(|l| (m.movement_date, m.id) > (l.movement_date, l.id)) {
                last = Some(m);
            }
        }
        activity.last_balance = last.map(|m| m.balance_quantity);
        activity
    }
}

/// One product's line in a closure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureDetail {
    pub closure_id: ClosureId,
    pub company_id: CompanyId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub opening_quantity: Decimal,
    pub opening_value: Decimal,
    pub quantity_in: Decimal,
    pub value_in: Decimal,
    pub quantity_out: Decimal,
    pub value_out: Decimal,
    pub movement_count: u64,
    pub calculated_quantity: Decimal,
    pub calculated_value: Decimal,
    pub unit_cost: Decimal,
    pub physical_quantity: Option<Decimal>,
    pub counted: Option<Stamp>,
    pub discrepancy_quantity: Decimal,
    pub discrepancy_value: Decimal,
    pub has_discrepancy: bool,
    pub adjusted_quantity: Decimal,
    pub adjusted_value: Decimal,
}

impl ClosureDetail {
    /// Compute a product's figures. A count already recorded on `previous`
    /// is carried over and re-evaluated against the new calculation.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        closure_id: ClosureId,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        opening: Opening,
        activity: &PeriodActivity,
        previous: Option<&ClosureDetail>,
        tolerance: Decimal,
    ) -> Self {
        let calculated_quantity = activity
            .last_balance
            .unwrap_or(opening.quantity + activity.quantity_in - activity.quantity_out);
        let calculated_value = opening.value + activity.value_in - activity.value_out;
        let unit_cost = if calculated_quantity > Decimal::ZERO {
            (calculated_value / calculated_quantity).round_dp(COST_SCALE)
        } else {
            Decimal::ZERO
        };

        let mut detail = Self {
            closure_id,
            company_id,
            warehouse_id,
            product_id,
            opening_quantity: opening.quantity,
            opening_value: opening.value,
            quantity_in: activity.quantity_in,
            value_in: activity.value_in,
            quantity_out: activity.quantity_out,
            value_out: activity.value_out,
            movement_count: activity.movement_count,
            calculated_quantity,
            calculated_value,
            unit_cost,
            physical_quantity: None,
            counted: None,
            discrepancy_quantity: Decimal::ZERO,
            discrepancy_value: Decimal::ZERO,
            has_discrepancy: false,
            adjusted_quantity: calculated_quantity,
            adjusted_value: calculated_value,
        };

        if let Some((physical, stamp)) =
            previous.and_then(|p| p.physical_quantity.zip(p.counted))
        {
            detail.record_physical_count(physical, stamp, tolerance);
        }
        detail
    }

    /// Record a physical count. A difference beyond `tolerance` is flagged and
    /// the count becomes the adjusted closing.
    pub fn record_physical_count(&mut self, physical: Decimal, stamp: Stamp, tolerance: Decimal) {
        let discrepancy = physical - self.calculated_quantity;
        self.physical_quantity = Some(physical);
        self.counted = Some(stamp);
        self.discrepancy_quantity = discrepancy;
        self.discrepancy_value = (discrepancy * self.unit_cost).round_dp(COST_SCALE);
        self.has_discrepancy = discrepancy.abs() > tolerance;
        if self.has_discrepancy {
            self.adjusted_quantity = physical;
            self.adjusted_value = (physical * self.unit_cost).round_dp(COST_SCALE);
        } else {
            self.adjusted_quantity = self.calculated_quantity;
            self.adjusted_value = self.calculated_value;
        }
    }

    /// Figures the next period opens with.
    pub fn closing(&self) -> Opening {
        Opening {
            quantity: self.adjusted_quantity,
            value: self.adjusted_value,
        }
    }

    /// Quantity pushed to the snapshot's last count on close.
    pub fn counted_or_calculated(&self) -> Decimal {
        self.physical_quantity.unwrap_or(self.calculated_quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use stockledger_core::ActorId;

    fn activity(qin: Decimal, vin: Decimal, qout: Decimal, vout: Decimal) -> PeriodActivity {
        PeriodActivity {
            quantity_in: qin,
            value_in: vin,
            quantity_out: qout,
            value_out: vout,
            movement_count: 2,
            last_balance: None,
        }
    }

    fn compute(opening: Opening, a: &PeriodActivity, previous: Option<&ClosureDetail>) -> ClosureDetail {
        ClosureDetail::compute(
            ClosureId::new(),
            CompanyId::new(),
            WarehouseId::new(),
            ProductId::new(),
            opening,
            a,
            previous,
            DEFAULT_DISCREPANCY_TOLERANCE,
        )
    }

    fn stamp() -> Stamp {
        Stamp::new(ActorId::new(), Utc::now())
    }

    #[test]
    fn default_tolerance_is_one_ten_thousandth() {
        assert_eq!(DEFAULT_DISCREPANCY_TOLERANCE, dec!(0.0001));
    }

    #[test]
    fn calculated_closing_and_count_discrepancy() {
        let opening = Opening {
            quantity: dec!(100),
            value: dec!(1000),
        };
        let mut d = compute(opening, &activity(dec!(50), dec!(500), dec!(30), dec!(300)), None);
        assert_eq!(d.calculated_quantity, dec!(120));
        assert_eq!(d.calculated_value, dec!(1200));
        assert_eq!(d.unit_cost, dec!(10));
        assert!(!d.has_discrepancy);

        d.record_physical_count(dec!(115), stamp(), DEFAULT_DISCREPANCY_TOLERANCE);
        assert_eq!(d.discrepancy_quantity, dec!(-5));
        assert_eq!(d.discrepancy_value, dec!(-50));
        assert!(d.has_discrepancy);
        assert_eq!(d.adjusted_quantity, dec!(115));
        assert_eq!(d.closing().quantity, dec!(115));
    }

    #[test]
    fn differences_within_tolerance_keep_the_calculation() {
        let mut d = compute(Opening::default(), &activity(dec!(10), dec!(10), dec!(0), dec!(0)), None);
        d.record_physical_count(dec!(10.00005), stamp(), DEFAULT_DISCREPANCY_TOLERANCE);
        assert!(!d.has_discrepancy);
        assert_eq!(d.adjusted_quantity, dec!(10));
        assert_eq!(d.counted_or_calculated(), dec!(10.00005));
    }

    #[test]
    fn last_balance_overrides_the_arithmetic() {
        let mut a = activity(dec!(5), dec!(5), dec!(0), dec!(0));
        a.last_balance = Some(dec!(7));
        let d = compute(Opening::default(), &a, None);
        assert_eq!(d.calculated_quantity, dec!(7));
    }

    #[test]
    fn recompute_preserves_recorded_counts() {
        let a = activity(dec!(10), dec!(20), dec!(0), dec!(0));
        let mut first = compute(Opening::default(), &a, None);
        first.record_physical_count(dec!(9), stamp(), DEFAULT_DISCREPANCY_TOLERANCE);

        let again = compute(Opening::default(), &a, Some(&first));
        assert_eq!(again.physical_quantity, Some(dec!(9)));
        assert_eq!(again.adjusted_quantity, dec!(9));
        assert_eq!(again.discrepancy_quantity, dec!(-1));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: without a last balance, closing = opening + in - out, and
        /// the adjusted closing is either the count or the calculation.
        #[test]
        fn closing_arithmetic(
            opening in 0i64..10_000,
            qin in 0i64..10_000,
            qout in 0i64..10_000,
            physical in proptest::option::of(0i64..30_000),
        ) {
            let opening = Opening { quantity: Decimal::from(opening), value: Decimal::from(opening) };
            let a = activity(Decimal::from(qin), Decimal::from(qin), Decimal::from(qout), Decimal::from(qout));
            let mut d = compute(opening, &a, None);
            prop_assert_eq!(d.calculated_quantity, opening.quantity + a.quantity_in - a.quantity_out);

            if let Some(p) = physical {
                let p = Decimal::from(p);
                d.record_physical_count(p, stamp(), DEFAULT_DISCREPANCY_TOLERANCE);
                prop_assert_eq!(d.discrepancy_quantity, p - d.calculated_quantity);
                let expected = if d.has_discrepancy { p } else { d.calculated_quantity };
                prop_assert_eq!(d.adjusted_quantity, expected);
            }
        }
    }
}
