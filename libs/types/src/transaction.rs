//! Transaction record and validation
//!
//! Field names serialize in camelCase so records written by older versions
//! of the host (including the single-file `data.json` format) load as-is.

use crate::errors::ValidationError;
use crate::ids::TransactionId;
use crate::numeric;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of a transaction, which decides its postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// +amount at the source account
    Income,
    /// -amount at the source account
    Expense,
    /// -amount at the source, +amount at the destination
    Transfer,
    /// +amount at the source account (value adjustment)
    Revaluation,
    /// Legacy kind, carried for old data; produces no posting
    Investment,
}

/// A single ledger transaction.
///
/// `amount_base` and `exchange_rate_snapshot` are frozen when the record is
/// created and are never recomputed from live rates afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default)]
    pub id: TransactionId,
    #[serde(default)]
    pub date: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: String,

    /// Source account id (preferred over `from`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<String>,
    /// Destination account id, transfers only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
    /// Source account display name (legacy reference)
    #[serde(default)]
    pub from: String,
    /// Destination account display name (legacy reference)
    #[serde(default)]
    pub to: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default)]
    pub area: String,

    #[serde(default)]
    pub note: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_base: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_rate_snapshot: Option<f64>,

    /// Host fields the engine does not interpret (sentiment, links, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Transaction {
    /// Create a transaction with the mandatory fields set.
    pub fn new(
        id: impl Into<TransactionId>,
        date: impl Into<String>,
        kind: TransactionKind,
        amount: f64,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            date: date.into(),
            kind,
            amount: Some(amount),
            currency: currency.into(),
            from_id: None,
            to_id: None,
            from: String::new(),
            to: String::new(),
            area_id: None,
            area: String::new(),
            note: String::new(),
            tags: Vec::new(),
            amount_base: None,
            exchange_rate_snapshot: None,
            extra: BTreeMap::new(),
        }
    }

    /// Set the source account by id
    pub fn from_account(mut self, account_id: impl Into<String>) -> Self {
        self.from_id = Some(account_id.into());
        self
    }

    /// Set the destination account by id
    pub fn to_account(mut self, account_id: impl Into<String>) -> Self {
        self.to_id = Some(account_id.into());
        self
    }

    /// Set the source account by display name only (legacy shape)
    pub fn from_name(mut self, name: impl Into<String>) -> Self {
        self.from = name.into();
        self
    }

    /// Set the destination account by display name only (legacy shape)
    pub fn to_name(mut self, name: impl Into<String>) -> Self {
        self.to = name.into();
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// Check the fields every stored transaction must carry.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_blank() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.date.trim().is_empty() {
            return Err(ValidationError::MissingField("date"));
        }
        if self.calendar_date().is_none() {
            return Err(ValidationError::InvalidDate(self.date.clone()));
        }
        if self.currency.trim().is_empty() {
            return Err(ValidationError::MissingField("currency"));
        }
        match self.amount {
            None => Err(ValidationError::MissingField("amount")),
            Some(a) if !a.is_finite() => Err(ValidationError::NonFiniteAmount(a)),
            Some(_) => Ok(()),
        }
    }

    /// Calendar date parsed from the leading `YYYY-MM-DD` of `date`.
    pub fn calendar_date(&self) -> Option<NaiveDate> {
        let head = self.date.get(..10)?;
        NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
    }

    /// Month key (`YYYY-MM`) used for shard partitioning.
    pub fn period(&self) -> Option<&str> {
        self.calendar_date()?;
        self.date.get(..7)
    }

    /// Freeze the exchange rate against the base currency, if not already set.
    ///
    /// Same-currency transactions get a rate of 1. A currency without a known
    /// rate falls back to parity.
    pub fn capture_rate(&mut self, base_currency: &str, rates: &BTreeMap<String, f64>) {
        if self.exchange_rate_snapshot.is_some() {
            return;
        }
        let rate = if self.currency == base_currency {
            1.0
        } else {
            rates
                .get(&self.currency)
                .copied()
                .filter(|r| r.is_finite() && *r > 0.0)
                .unwrap_or(1.0)
        };
        self.exchange_rate_snapshot = Some(rate);
        if self.amount_base.is_none() {
            self.amount_base = self.amount.map(|a| numeric::multiply(a, rate));
        }
    }

    /// Amount in base currency for aggregation: `amount_base` when frozen,
    /// the raw amount otherwise.
    pub fn base_amount(&self) -> f64 {
        self.amount_base.or(self.amount).unwrap_or(0.0)
    }
}

/// Sort transactions newest first by date; ties keep insertion order.
pub fn sort_by_date_desc(transactions: &mut [Transaction]) {
    transactions.sort_by(|a, b| b.date.cmp(&a.date));
}
