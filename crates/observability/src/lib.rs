//! Tracing and logging setup shared by every process embedding the ledger.

pub mod tracing;

pub use crate::tracing::{InitError, LogFormat, init, init_with};
