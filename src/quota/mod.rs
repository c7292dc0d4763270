//! Per-user storage quota
//!
//! Admission checks, reservations and releases against the quota ledger,
//! plus periodic reconciliation with the object registry.

mod service;
mod types;

pub use service::QuotaService;
pub use types::*;
