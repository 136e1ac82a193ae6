//! Period closure domain.
//!
//! Monthly closures per warehouse: opening balances, period activity,
//! physical counts and discrepancies. Pure logic; the engine that reads the
//! ledger lives in the infrastructure crate.

pub mod closure;
pub mod detail;
pub mod events;

pub use closure::{ClosureStatus, ClosureTotals, InventoryClosure};
pub use detail::{ClosureDetail, DEFAULT_DISCREPANCY_TOLERANCE, Opening, PeriodActivity};
pub use events::{ClosureChange, ClosureEvent};
