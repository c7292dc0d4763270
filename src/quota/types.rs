//! Quota types

use serde::{Deserialize, Serialize};

use crate::db::QuotaLedgerRow;

/// Point-in-time view of a user's ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub used: u64,
    pub limit: u64,
}

impl QuotaSnapshot {
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

impl From<&QuotaLedgerRow> for QuotaSnapshot {
    fn from(row: &QuotaLedgerRow) -> Self {
        Self {
            used: row.used_bytes.max(0) as u64,
            limit: row.limit_bytes.max(0) as u64,
        }
    }
}

/// Answer to an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCheck {
    pub has_quota: bool,
    pub required: u64,
    pub available: u64,
    pub used: u64,
    pub limit: u64,
}

impl QuotaCheck {
    pub fn evaluate(snapshot: QuotaSnapshot, required: u64) -> Self {
        let available = snapshot.available();
        Self {
            has_quota: required <= available,
            required,
            available,
            used: snapshot.used,
            limit: snapshot.limit,
        }
    }
}

/// Outcome of reconciling one user's ledger against stored objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub user_id: String,
    pub ledger_used: u64,
    pub actual_used: u64,
    /// Whether the ledger was overwritten
    pub corrected: bool,
}

impl ReconcileReport {
    pub fn drift(&self) -> u64 {
        self.ledger_used.abs_diff(self.actual_used)
    }
}
