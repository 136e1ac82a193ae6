//! Lot rotation: which batches satisfy an outbound request.
//!
//! Selection is pure. It never mutates lots; callers consume the returned
//! allocations inside their unit of work.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, LotId, ProductId};

use crate::lot::ProductLot;

/// Lot consumption strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    /// First-in-first-out: (manufactured_date, created_at, id).
    Fifo,
    /// Strict first-expired-first-out: (expiration_date, manufactured_date, id).
    /// Lots without an expiration date are not candidates.
    Fefo,
    /// FEFO over dated lots, then FIFO over undated lots.
    Hybrid,
}

impl core::str::FromStr for RotationStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "fefo" => Ok(Self::Fefo),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(DomainError::validation(format!(
                "unknown rotation strategy '{other}'"
            ))),
        }
    }
}

/// One lot and the quantity taken from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotAllocation {
    pub lot_id: LotId,
    pub lot_number: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub expiration_date: Option<NaiveDate>,
}

/// Per-product strategy choice. Pure: same inputs, same strategy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RotationPolicy {
    default: Option<RotationStrategy>,
    overrides: HashMap<ProductId, RotationStrategy>,
}

impl RotationPolicy {
    pub fn new(default: RotationStrategy) -> Self {
        Self {
            default: Some(default),
            overrides: HashMap::new(),
        }
    }

    /// Pin a strategy for one product (e.g. short shelf-life goods to FEFO).
    pub fn with_override(mut self, product_id: ProductId, strategy: RotationStrategy) -> Self {
        self.overrides.insert(product_id, strategy);
        self
    }

    pub fn strategy_for(&self, product_id: ProductId) -> RotationStrategy {
        self.overrides
            .get(&product_id)
            .copied()
            .or(self.default)
            .unwrap_or(RotationStrategy::Fifo)
    }
}

fn none_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn fifo_order(a: &ProductLot, b: &ProductLot) -> Ordering {
    none_last(&a.manufactured_date, &b.manufactured_date)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

fn fefo_order(a: &ProductLot, b: &ProductLot) -> Ordering {
    none_last(&a.expiration_date, &b.expiration_date)
        .then(none_last(&a.manufactured_date, &b.manufactured_date))
        .then(a.id.cmp(&b.id))
}

/// Candidate lots in consumption order for a strategy.
pub fn order_candidates<'a>(
    lots: &'a [ProductLot],
    strategy: RotationStrategy,
) -> Vec<&'a ProductLot> {
    let mut candidates: Vec<&ProductLot> = lots.iter().filter(|l| l.is_available()).collect();

    match strategy {
        RotationStrategy::Fifo => candidates.sort_by(|a, b| fifo_order(a, b)),
        RotationStrategy::Fefo => {
            candidates.retain(|l| l.expiration_date.is_some());
            candidates.sort_by(|a, b| fefo_order(a, b));
        }
        RotationStrategy::Hybrid => {
            let (mut dated, mut undated): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|l| l.expiration_date.is_some());
            dated.sort_by(|a, b| fefo_order(a, b));
            undated.sort_by(|a, b| fifo_order(a, b));
            dated.extend(undated);
            candidates = dated;
        }
    }

    candidates
}

/// Greedily allocate `quantity` across `lots`.
///
/// All-or-nothing: if the candidates cannot cover the request, returns
/// `InsufficientInventory` and no allocation.
pub fn select_lots(
    lots: &[ProductLot],
    quantity: Decimal,
    strategy: RotationStrategy,
) -> DomainResult<Vec<LotAllocation>> {
    if quantity <= Decimal::ZERO {
        return Err(DomainError::validation("requested quantity must be positive"));
    }

    let ordered = order_candidates(lots, strategy);
    let available: Decimal = ordered.iter().map(|l| l.quantity_remaining).sum();
    if available < quantity {
        return Err(DomainError::insufficient(quantity, available));
    }

    let mut outstanding = quantity;
    let mut allocations = Vec::new();
    for lot in ordered {
        if outstanding.is_zero() {
            break;
        }
        let take = outstanding.min(lot.quantity_remaining);
        allocations.push(LotAllocation {
            lot_id: lot.id,
            lot_number: lot.lot_number.clone(),
            quantity: take,
            unit_cost: lot.unit_cost,
            expiration_date: lot.expiration_date,
        });
        outstanding -= take;
    }

    Ok(allocations)
}
