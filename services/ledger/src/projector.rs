//! Balance projection
//!
//! `project` folds a transaction set into per-account, per-currency
//! balances in one pass. The result is always derived: it is never stored,
//! and projecting the same inputs twice gives bit-identical maps.
//!
//! Postings:
//! - income / revaluation: `+amount` at the source
//! - expense: `-amount` at the source
//! - transfer: `-amount` at the source, `+amount` at the destination
//!
//! Transfers never convert currency; both legs post in the transaction's
//! currency.

use ledger_types::account::{Account, AccountResolver, NO_ACCOUNT};
use ledger_types::numeric;
use ledger_types::transaction::{Transaction, TransactionKind};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// account key → currency → balance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BalanceMap(BTreeMap<String, BTreeMap<String, f64>>);

impl BalanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance of one account in one currency (0 when never posted).
    pub fn get(&self, account: &str, currency: &str) -> f64 {
        self.0
            .get(account)
            .and_then(|by_currency| by_currency.get(currency))
            .copied()
            .unwrap_or(0.0)
    }

    /// Every currency bucket of one account.
    pub fn account(&self, account: &str) -> Option<&BTreeMap<String, f64>> {
        self.0.get(account)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All `(account, currency, balance)` buckets in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.0.iter().flat_map(|(account, by_currency)| {
            by_currency
                .iter()
                .map(move |(currency, balance)| (account.as_str(), currency.as_str(), *balance))
        })
    }

    fn post(&mut self, account: &str, currency: &str, delta: f64) {
        let bucket = self
            .0
            .entry(account.to_string())
            .or_default()
            .entry(currency.to_string())
            .or_insert(0.0);
        *bucket = numeric::add(*bucket, delta);
    }
}

/// Project balances from transactions.
///
/// Every registered account gets an entry, even with no postings.
/// Account archival is irrelevant here; archived accounts keep their
/// balances.
pub fn project(transactions: &[Transaction], accounts: &[Account]) -> BalanceMap {
    let resolver = AccountResolver::new(accounts);
    let mut balances = BalanceMap::new();
    for account in accounts {
        if !account.id.is_empty() && account.id != NO_ACCOUNT {
            balances.0.entry(account.id.clone()).or_default();
        }
    }

    for tx in transactions {
        let amount = match tx.amount {
            Some(a) if a != 0.0 => a,
            _ => {
                debug!(tx_id = %tx.id, "skipping posting: zero or missing amount");
                continue;
            }
        };
        if tx.currency.is_empty() {
            debug!(tx_id = %tx.id, "skipping posting: missing currency");
            continue;
        }

        let source = resolver.resolve(tx.from_id.as_deref(), &tx.from);
        let (source_delta, destination_delta) = match tx.kind {
            TransactionKind::Income | TransactionKind::Revaluation => (amount, None),
            TransactionKind::Expense => (-amount, None),
            TransactionKind::Transfer => (-amount, Some(amount)),
            TransactionKind::Investment => continue,
        };

        match source.posting_key() {
            Some(key) => balances.post(key, &tx.currency, source_delta),
            None => debug!(tx_id = %tx.id, "skipping posting: no source account"),
        }

        if let Some(delta) = destination_delta {
            let destination = resolver.resolve(tx.to_id.as_deref(), &tx.to);
            match destination.posting_key() {
                Some(key) => balances.post(key, &tx.currency, delta),
                None => debug!(tx_id = %tx.id, "skipping posting: no destination account"),
            }
        }
    }

    balances
}

/// Flatten the projection into plain nested maps for presentation
/// consumers. No computation happens here.
pub fn to_primitive(balances: &BalanceMap) -> BTreeMap<String, BTreeMap<String, f64>> {
    balances.0.clone()
}

/// Total across every bucket converted into `base_currency`.
///
/// `rates` maps a currency to its value in base units. Buckets whose
/// currency has no usable rate (missing, non-finite or ≤ 0) are left out.
pub fn liquidity(
    balances: &BalanceMap,
    base_currency: &str,
    rates: &BTreeMap<String, f64>,
) -> f64 {
    let converted = balances.iter().filter_map(|(_, currency, balance)| {
        if currency == base_currency {
            return Some(balance);
        }
        rates
            .get(currency)
            .copied()
            .filter(|r| r.is_finite() && *r > 0.0)
            .map(|rate| numeric::multiply(balance, rate))
    });
    numeric::sum(converted)
}
