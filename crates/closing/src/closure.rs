//! Closure header and lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{ClosureId, CompanyId, DomainError, DomainResult, Period, Stamp, WarehouseId};

use crate::detail::ClosureDetail;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureStatus {
    EnProceso,
    Cerrado,
    Reabierto,
    Cancelado,
}

impl ClosureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosureStatus::EnProceso => "en_proceso",
            ClosureStatus::Cerrado => "cerrado",
            ClosureStatus::Reabierto => "reabierto",
            ClosureStatus::Cancelado => "cancelado",
        }
    }

    /// Processing and counting are allowed.
    pub fn is_open(&self) -> bool {
        matches!(self, ClosureStatus::EnProceso | ClosureStatus::Reabierto)
    }
}

impl core::fmt::Display for ClosureStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header totals summed over the details.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClosureTotals {
    pub products: u64,
    pub movements: u64,
    pub opening_value: Decimal,
    pub value_in: Decimal,
    pub value_out: Decimal,
    pub calculated_value: Decimal,
    pub adjusted_value: Decimal,
    pub discrepancy_value: Decimal,
    pub products_with_discrepancy: u64,
}

impl ClosureTotals {
    pub fn from_details(details: &[ClosureDetail]) -> Self {
        details.iter().fold(Self::default(), |mut t, d| {
            t.products += 1;
            t.movements += d.movement_count;
            t.opening_value += d.opening_value;
            t.value_in += d.value_in;
            t.value_out += d.value_out;
            t.calculated_value += d.calculated_value;
            t.adjusted_value += d.adjusted_value;
            t.discrepancy_value += d.discrepancy_value;
            if d.has_discrepancy {
                t.products_with_discrepancy += 1;
            }
            t
        })
    }
}

/// Monthly closure of one warehouse.
///
/// Stored as a versioned row; every successful save bumps `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryClosure {
    pub id: ClosureId,
    pub company_id: CompanyId,
    pub warehouse_id: WarehouseId,
    pub period: Period,
    pub status: ClosureStatus,
    pub approved: Option<Stamp>,
    pub closed: Option<Stamp>,
    pub reopened: Option<Stamp>,
    pub reopen_reason: Option<String>,
    pub cancelled: Option<Stamp>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created: Stamp,
    pub totals: ClosureTotals,
    pub version: u64,
}

impl InventoryClosure {
    pub fn open(
        id: ClosureId,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        period: Period,
        stamp: Stamp,
    ) -> Self {
        Self {
            id,
            company_id,
            warehouse_id,
            period,
            status: ClosureStatus::EnProceso,
            approved: None,
            closed: None,
            reopened: None,
            reopen_reason: None,
            cancelled: None,
            processed_at: None,
            created: stamp,
            totals: ClosureTotals::default(),
            version: 0,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.approved.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.status == ClosureStatus::Cerrado
    }

    /// The period's figures are frozen: approved and awaiting close, or closed.
    pub fn locks_postings(&self) -> bool {
        self.is_closed() || (self.status.is_open() && self.is_approved())
    }

    /// Processing and physical counts need an open, unapproved closure.
    pub fn ensure_processable(&self, action: &'static str) -> DomainResult<()> {
        if !self.status.is_open() {
            return Err(DomainError::transition("closure", self.status, action));
        }
        if self.is_approved() {
            return Err(DomainError::transition("closure", "approved", action));
        }
        Ok(())
    }

    pub fn mark_processed(&mut self, details: &[ClosureDetail], at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_processable("process")?;
        self.totals = ClosureTotals::from_details(details);
        self.processed_at = Some(at);
        Ok(())
    }

    /// Refresh totals after a count without touching `processed_at`.
    pub fn refresh_totals(&mut self, details: &[ClosureDetail]) {
        self.totals = ClosureTotals::from_details(details);
    }

    pub fn approve(&mut self, stamp: Stamp) -> DomainResult<()> {
        self.ensure_processable("approve")?;
        if self.processed_at.is_none() {
            return Err(DomainError::validation(format!(
                "closure {} for {} has not been processed",
                self.id, self.period
            )));
        }
        self.approved = Some(stamp);
        Ok(())
    }

    pub fn close(&mut self, stamp: Stamp) -> DomainResult<()> {
        if !self.status.is_open() || !self.is_approved() {
            let from = if self.status.is_open() {
                "unapproved".to_string()
            } else {
                self.status.to_string()
            };
            return Err(DomainError::transition("closure", from, "close"));
        }
        self.status = ClosureStatus::Cerrado;
        self.closed = Some(stamp);
        Ok(())
    }

    pub fn reopen(&mut self, reason: impl Into<String>, stamp: Stamp) -> DomainResult<()> {
        if self.status != ClosureStatus::Cerrado {
            return Err(DomainError::transition("closure", self.status, "reopen"));
        }
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(DomainError::validation("reopen reason is required"));
        }
        self.status = ClosureStatus::Reabierto;
        self.approved = None;
        self.reopened = Some(stamp);
        self.reopen_reason = Some(reason);
        Ok(())
    }

    pub fn cancel(&mut self, stamp: Stamp) -> DomainResult<()> {
        if !self.status.is_open() {
            return Err(DomainError::transition("closure", self.status, "cancel"));
        }
        self.status = ClosureStatus::Cancelado;
        self.cancelled = Some(stamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detail::{ClosureDetail, DEFAULT_DISCREPANCY_TOLERANCE, Opening, PeriodActivity};
    use rust_decimal_macros::dec;
    use stockledger_core::{ActorId, ProductId};

    fn stamp() -> Stamp {
        Stamp::now(ActorId::new())
    }

    fn closure() -> InventoryClosure {
        InventoryClosure::open(
            ClosureId::new(),
            CompanyId::new(),
            WarehouseId::new(),
            Period::new(2024, 3).unwrap(),
            stamp(),
        )
    }

    fn detail(c: &InventoryClosure, value_in: Decimal) -> ClosureDetail {
        let activity = PeriodActivity {
            quantity_in: value_in,
            value_in,
            movement_count: 1,
            ..PeriodActivity::default()
        };
        ClosureDetail::compute(
            c.id,
            c.company_id,
            c.warehouse_id,
            ProductId::new(),
            Opening::default(),
            &activity,
            None,
            DEFAULT_DISCREPANCY_TOLERANCE,
        )
    }

    #[test]
    fn full_lifecycle() {
        let mut c = closure();
        let details = vec![detail(&c, dec!(10)), detail(&c, dec!(5))];
        c.mark_processed(&details, Utc::now()).unwrap();
        assert_eq!(c.totals.products, 2);
        assert_eq!(c.totals.value_in, dec!(15));

        c.approve(stamp()).unwrap();
        assert!(c.mark_processed(&details, Utc::now()).is_err());
        c.close(stamp()).unwrap();
        assert!(c.is_closed());
    }

    #[test]
    fn approval_locks_postings_until_reopened_or_cancelled() {
        let mut c = closure();
        assert!(!c.locks_postings());
        c.mark_processed(&[], Utc::now()).unwrap();
        assert!(!c.locks_postings());
        c.approve(stamp()).unwrap();
        assert!(c.locks_postings());
        c.close(stamp()).unwrap();
        assert!(c.locks_postings());
        c.reopen("missed receipt", stamp()).unwrap();
        assert!(!c.locks_postings());

        let mut dropped = closure();
        dropped.mark_processed(&[], Utc::now()).unwrap();
        dropped.approve(stamp()).unwrap();
        dropped.cancel(stamp()).unwrap();
        assert!(!dropped.locks_postings());
    }

    #[test]
    fn approval_requires_processing() {
        let mut c = closure();
        assert!(matches!(c.approve(stamp()), Err(DomainError::Validation(_))));
    }

    #[test]
    fn close_requires_approval() {
        let mut c = closure();
        c.mark_processed(&[], Utc::now()).unwrap();
        assert!(matches!(
            c.close(stamp()),
            Err(DomainError::InvalidStateTransition { action: "close", .. })
        ));
    }

    #[test]
    fn reopen_clears_approval_and_permits_processing() {
        let mut c = closure();
        c.mark_processed(&[], Utc::now()).unwrap();
        c.approve(stamp()).unwrap();
        c.close(stamp()).unwrap();

        assert!(c.cancel(stamp()).is_err());
        assert!(c.reopen("  ", stamp()).is_err());
        c.reopen("late supplier invoice", stamp()).unwrap();
        assert_eq!(c.status, ClosureStatus::Reabierto);
        assert!(!c.is_approved());
        c.mark_processed(&[], Utc::now()).unwrap();
        c.approve(stamp()).unwrap();
        c.close(stamp()).unwrap();
    }

    #[test]
    fn reopen_only_from_closed() {
        let mut c = closure();
        assert!(matches!(
            c.reopen("x", stamp()),
            Err(DomainError::InvalidStateTransition { action: "reopen", .. })
        ));
        c.cancel(stamp()).unwrap();
        assert!(c.cancel(stamp()).is_err());
        assert!(c.ensure_processable("process").is_err());
    }
}
