//! Aggregated summary payload served by `get_summaries`

use crate::transaction::TransactionKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Budget as it stood when a month was last summarized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSnapshot {
    pub area_id: String,
    pub amount: f64,
    pub currency: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
}

/// Per-month totals, in base currency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySummary {
    pub income: f64,
    pub expense: f64,
    pub savings: f64,
    pub count: u64,
    /// Only recorded for the month that was current at summary time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_snapshots: Option<Vec<BudgetSnapshot>>,
}

/// Ledger-wide health figures, recomputed on each consolidation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSummary {
    pub total_income: f64,
    pub total_expense: f64,
    /// Liquidity across all accounts converted to base currency
    pub net_worth: f64,
    /// Mean monthly expense over the last 12 months present
    pub avg_monthly_burn_rate: f64,
    /// Percentage of income not spent
    pub savings_rate: f64,
    pub runway_months: f64,
    /// Keyed by `YYYY-MM`
    pub monthly_breakdown: BTreeMap<String, MonthlySummary>,
    /// RFC 3339 timestamp
    pub last_updated: String,
}
