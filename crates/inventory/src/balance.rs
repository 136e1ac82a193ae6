//! Running balance per (product, warehouse) and the chain it guarantees.
//!
//! The balance row is the one record every posting on a key must update, so
//! it is also what serializes concurrent appends on that key.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    CompanyId, DomainError, DomainResult, MovementId, ProductId, Stamp, WarehouseId,
};

use crate::movement::{InventoryMovement, MovementStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBalance {
    pub company_id: CompanyId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
    /// Number of completed movements on the key.
    pub sequence: u64,
    pub last_movement_id: Option<MovementId>,
    pub last_movement_date: Option<DateTime<Utc>>,
}

impl StockBalance {
    pub fn empty(company_id: CompanyId, product_id: ProductId, warehouse_id: WarehouseId) -> Self {
        Self {
            company_id,
            product_id,
            warehouse_id,
            quantity: Decimal::ZERO,
            sequence: 0,
            last_movement_id: None,
            last_movement_date: None,
        }
    }

    /// Earliest date a new posting may carry: `at`, bumped past the last one.
    pub fn next_movement_date(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_movement_date {
            Some(last) if at <= last => last + Duration::microseconds(1),
            _ => at,
        }
    }

    /// Post a movement on this key: fill its balance fields and advance the chain.
    pub fn post(&mut self, movement: &mut InventoryMovement, stamp: Stamp) -> DomainResult<()> {
        if movement.product_id != self.product_id
            || movement.warehouse_id != self.warehouse_id
            || movement.company_id != self.company_id
        {
            return Err(DomainError::invariant(format!(
                "movement {} posted on another balance key",
                movement.id
            )));
        }
        movement.ensure_completable()?;

        let new_quantity = self.quantity + movement.signed_quantity();
        if new_quantity < Decimal::ZERO {
            return Err(DomainError::insufficient(movement.quantity(), self.quantity));
        }

        let date = self.next_movement_date(stamp.at);
        movement.mark_posted(self.quantity, self.sequence + 1, date, stamp);

        self.quantity = new_quantity;
        self.sequence += 1;
        self.last_movement_id = Some(movement.id);
        self.last_movement_date = Some(date);
        Ok(())
    }
}

/// First link of the chain that does not add up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub movement_id: MovementId,
    pub position: usize,
    pub expected_balance: Decimal,
    pub recorded_balance: Decimal,
}

/// Outcome of a chain verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub movements: usize,
    pub balance: Decimal,
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Replay completed movements of one key in (movement_date, id) order and
/// check each balance against its predecessor plus its signed quantity.
pub fn verify_chain(movements: &[InventoryMovement]) -> ChainReport {
    let mut completed: Vec<&InventoryMovement> = movements
        .iter()
        .filter(|m| m.status == MovementStatus::Completed)
        .collect();
    completed.sort_by(|a, b| (a.movement_date, a.id).cmp(&(b.movement_date, b.id)));

    let mut balance = Decimal::ZERO;
    let mut first_break = None;
    for (position, m) in completed.iter().enumerate() {
        let expected = balance + m.signed_quantity();
        if first_break.is_none()
            && (m.balance_quantity != expected || m.previous_quantity != balance)
        {
            first_break = Some(ChainBreak {
                movement_id: m.id,
                position,
                expected_balance: expected,
                recorded_balance: m.balance_quantity,
            });
        }
        balance = m.balance_quantity;
    }

    ChainReport {
        movements: completed.len(),
        balance,
        first_break,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{MovementTerms, MovementType, NewMovement};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use stockledger_core::ActorId;

    fn key() -> StockBalance {
        StockBalance::empty(CompanyId::new(), ProductId::new(), WarehouseId::new())
    }

    fn movement(balance: &StockBalance, t: MovementType, qty: Decimal) -> InventoryMovement {
        let input = NewMovement::manual(
            balance.company_id,
            balance.product_id,
            balance.warehouse_id,
            t,
            qty,
        );
        InventoryMovement::record(
            MovementId::new(),
            input,
            MovementTerms {
                reason_code: "test".into(),
                unit_cost: dec!(1),
                requires_approval: false,
                requires_quality_check: false,
            },
            Stamp::now(ActorId::new()),
        )
    }

    #[test]
    fn posting_advances_sequence_and_dates() {
        let mut b = key();
        let stamp = Stamp::now(ActorId::new());

        let mut first = movement(&b, MovementType::AdjustmentIn, dec!(10));
        b.post(&mut first, stamp).unwrap();
        let mut second = movement(&b, MovementType::AdjustmentOut, dec!(4));
        b.post(&mut second, stamp).unwrap();

        assert_eq!(first.balance_quantity, dec!(10));
        assert_eq!((second.previous_quantity, second.balance_quantity), (dec!(10), dec!(6)));
        assert_eq!(second.sequence, 2);
        assert!(second.movement_date > first.movement_date);
        assert_eq!(b.quantity, dec!(6));
        assert!(verify_chain(&[second, first]).is_intact());
    }

    #[test]
    fn posting_cannot_go_negative() {
        let mut b = key();
        let mut m = movement(&b, MovementType::Dispatch, dec!(1));
        let err = b.post(&mut m, Stamp::now(ActorId::new())).unwrap_err();
        assert_eq!(err, DomainError::insufficient(dec!(1), dec!(0)));
        assert_eq!(b.sequence, 0);
        assert_eq!(m.status, MovementStatus::Pending);
    }

    #[test]
    fn tampered_balance_is_reported() {
        let mut b = key();
        let stamp = Stamp::now(ActorId::new());
        let mut a = movement(&b, MovementType::AdjustmentIn, dec!(5));
        b.post(&mut a, stamp).unwrap();
        let mut c = movement(&b, MovementType::AdjustmentIn, dec!(5));
        b.post(&mut c, stamp).unwrap();
        c.balance_quantity = dec!(11);

        let report = verify_chain(&[a, c.clone()]);
        let br = report.first_break.unwrap();
        assert_eq!(br.movement_id, c.id);
        assert_eq!(br.expected_balance, dec!(10));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever postings succeed, the completed movements form an
        /// intact chain ending at the balance row's quantity.
        #[test]
        fn successful_postings_form_an_intact_chain(
            ops in prop::collection::vec((any::<bool>(), 1i64..50), 1..40)
        ) {
            let mut b = key();
            let stamp = Stamp::now(ActorId::new());
            let mut posted = Vec::new();
            for (inbound, qty) in ops {
                let t = if inbound { MovementType::AdjustmentIn } else { MovementType::AdjustmentOut };
                let mut m = movement(&b, t, Decimal::from(qty));
                if b.post(&mut m, stamp).is_ok() {
                    posted.push(m);
                }
            }
            let report = verify_chain(&posted);
            prop_assert!(report.is_intact());
            prop_assert_eq!(report.balance, b.quantity);
            prop_assert_eq!(report.movements as u64, b.sequence);
        }
    }
}
