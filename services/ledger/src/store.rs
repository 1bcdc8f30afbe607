//! Authoritative in-memory ledger state with bounded undo
//!
//! Every financially meaningful mutation (transaction add/update/delete,
//! bulk import, budget add/update/delete) pushes the pre-mutation state onto
//! the undo history before applying the change. Validation happens first, so
//! a rejected call leaves both the state and the history untouched.
//!
//! Checkpoints are cheap: [`LedgerData`] keeps each collection behind an
//! `Arc`, so a checkpoint clones pointers and the mutation that follows
//! copies only the collection it edits.

use chrono::{Datelike, Utc};
use ledger_types::account::{Account, Category};
use ledger_types::data::{Budget, CollectionKind, LedgerData};
use ledger_types::errors::{LedgerError, ValidationError};
use ledger_types::numeric;
use ledger_types::transaction::{sort_by_date_desc, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::projector::{self, BalanceMap};

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum retained undo checkpoints; the oldest is evicted past this
    pub undo_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { undo_capacity: 20 }
    }
}

// ── Undo history ────────────────────────────────────────────────────

/// Capped stack of prior states, oldest evicted first.
#[derive(Debug, Clone)]
struct UndoHistory {
    entries: VecDeque<LedgerData>,
    capacity: usize,
}

impl UndoHistory {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, state: LedgerData) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(state);
    }

    fn pop(&mut self) -> Option<LedgerData> {
        self.entries.pop_back()
    }

    fn last(&self) -> Option<&LedgerData> {
        self.entries.back()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// Owner of the live ledger state.
#[derive(Debug, Clone)]
pub struct TransactionStore {
    state: LedgerData,
    history: UndoHistory,
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new(LedgerData::default(), StoreConfig::default())
    }
}

impl TransactionStore {
    pub fn new(state: LedgerData, config: StoreConfig) -> Self {
        Self {
            state,
            history: UndoHistory::new(config.undo_capacity),
        }
    }

    /// Current state.
    pub fn state(&self) -> &LedgerData {
        &self.state
    }

    /// Owned copy of the current state (shares every collection).
    pub fn snapshot(&self) -> LedgerData {
        self.state.clone()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.state.transactions
    }

    pub fn undo_depth(&self) -> usize {
        self.history.len()
    }

    /// Balances projected from the current transactions and accounts.
    pub fn balances(&self) -> BalanceMap {
        projector::project(&self.state.transactions, &self.state.account_registry)
    }

    fn checkpoint(&mut self) {
        self.history.push(self.state.clone());
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.state
            .transactions
            .iter()
            .position(|t| t.id.as_str() == id)
    }

    // ── Transactions ────────────────────────────────────────────────

    /// Add a transaction, freezing its exchange-rate snapshot against the
    /// current rate table. Returns the stored record.
    pub fn add_transaction(&mut self, mut tx: Transaction) -> Result<Transaction, LedgerError> {
        tx.validate()?;
        if self.position(tx.id.as_str()).is_some() {
            return Err(ValidationError::DuplicateId(tx.id.to_string()).into());
        }
        tx.capture_rate(&self.state.base_currency, &self.state.exchange_rates);

        self.checkpoint();
        Arc::make_mut(&mut self.state.transactions).insert(0, tx.clone());
        debug!(tx_id = %tx.id, "transaction added");
        Ok(tx)
    }

    /// Replace the record stored under `tx.id`.
    ///
    /// When the replacement carries no rate snapshot and the currency did not
    /// change, the previous snapshot is kept so history is not repriced.
    pub fn update_transaction(&mut self, mut tx: Transaction) -> Result<Transaction, LedgerError> {
        tx.validate()?;
        let index = self
            .position(tx.id.as_str())
            .ok_or_else(|| LedgerError::NotFound { id: tx.id.to_string() })?;

        let previous = &self.state.transactions[index];
        if tx.exchange_rate_snapshot.is_none() && previous.currency == tx.currency {
            tx.exchange_rate_snapshot = previous.exchange_rate_snapshot;
            if tx.amount != previous.amount {
                tx.amount_base = None;
            } else if tx.amount_base.is_none() {
                tx.amount_base = previous.amount_base;
            }
        }
        tx.capture_rate(&self.state.base_currency, &self.state.exchange_rates);
        if tx.amount_base.is_none() {
            if let (Some(amount), Some(rate)) = (tx.amount, tx.exchange_rate_snapshot) {
                tx.amount_base = Some(numeric::multiply(amount, rate));
            }
        }

        self.checkpoint();
        Arc::make_mut(&mut self.state.transactions)[index] = tx.clone();
        debug!(tx_id = %tx.id, "transaction updated");
        Ok(tx)
    }

    /// Delete a transaction by id, returning the removed record.
    ///
    /// An empty id is rejected without touching state. Removing the last
    /// transaction is allowed but logged.
    pub fn delete_transaction(&mut self, id: &str) -> Result<Transaction, LedgerError> {
        if id.trim().is_empty() {
            warn!("delete rejected: empty transaction id");
            return Err(ValidationError::EmptyIdentifier.into());
        }
        let index = self
            .position(id)
            .ok_or_else(|| LedgerError::NotFound { id: id.to_string() })?;

        self.checkpoint();
        let transactions = Arc::make_mut(&mut self.state.transactions);
        let removed = transactions.remove(index);
        if transactions.is_empty() {
            warn!(tx_id = %removed.id, "delete emptied the transaction collection");
        }
        debug!(tx_id = %removed.id, "transaction deleted");
        Ok(removed)
    }

    /// Check a batch the way `add_transactions_bulk` does, without applying
    /// it: every record valid, no id repeated or already stored.
    pub fn validate_batch(&self, batch: &[Transaction]) -> Result<(), LedgerError> {
        let mut seen: HashSet<&str> = self
            .state
            .transactions
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        for tx in batch {
            tx.validate()?;
            if !seen.insert(tx.id.as_str()) {
                return Err(ValidationError::DuplicateId(tx.id.to_string()).into());
            }
        }
        Ok(())
    }

    /// Import many transactions as one undoable step.
    ///
    /// The batch is all-or-nothing: any invalid record or id clash rejects
    /// the whole batch. The merged list is re-sorted newest first.
    pub fn add_transactions_bulk(
        &mut self,
        batch: Vec<Transaction>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        if batch.is_empty() {
            return Ok(batch);
        }
        self.validate_batch(&batch)?;

        let mut batch = batch;
        for tx in &mut batch {
            tx.capture_rate(&self.state.base_currency, &self.state.exchange_rates);
        }

        self.checkpoint();
        let transactions = Arc::make_mut(&mut self.state.transactions);
        let mut merged = batch.clone();
        merged.append(transactions);
        sort_by_date_desc(&mut merged);
        *transactions = merged;
        debug!(count = batch.len(), "bulk import applied");
        Ok(batch)
    }

    /// Merge a shard of historical transactions loaded from disk.
    ///
    /// Idempotent by id; not undoable. Returns how many were new.
    pub fn hydrate_shard(&mut self, shard: Vec<Transaction>) -> usize {
        let known: HashSet<String> = self
            .state
            .transactions
            .iter()
            .map(|t| t.id.to_string())
            .collect();
        let fresh: Vec<Transaction> = shard
            .into_iter()
            .filter(|t| !known.contains(t.id.as_str()))
            .collect();
        if fresh.is_empty() {
            return 0;
        }

        let added = fresh.len();
        let transactions = Arc::make_mut(&mut self.state.transactions);
        transactions.extend(fresh);
        sort_by_date_desc(transactions);
        debug!(added, "shard hydrated");
        added
    }

    /// Drop cold transactions whose date starts with `prefix` from memory.
    ///
    /// The current year is never unloaded. Not undoable; the records stay on
    /// disk and can be hydrated again. Returns how many were dropped.
    pub fn unload_period(&mut self, prefix: &str) -> usize {
        let current_year = Utc::now().year().to_string();
        if prefix.is_empty() || prefix.starts_with(&current_year) || current_year.starts_with(prefix) {
            debug!(prefix, "refusing to unload active period");
            return 0;
        }
        let before = self.state.transactions.len();
        if !self.state.transactions.iter().any(|t| t.date.starts_with(prefix)) {
            return 0;
        }
        Arc::make_mut(&mut self.state.transactions).retain(|t| !t.date.starts_with(prefix));
        before - self.state.transactions.len()
    }

    // ── Budgets ─────────────────────────────────────────────────────

    pub fn add_budget(&mut self, budget: Budget) -> Result<(), LedgerError> {
        if budget.id.trim().is_empty() {
            return Err(ValidationError::EmptyIdentifier.into());
        }
        if !budget.amount.is_finite() {
            return Err(ValidationError::NonFiniteAmount(budget.amount).into());
        }
        self.checkpoint();
        Arc::make_mut(&mut self.state.budgets).push(budget);
        Ok(())
    }

    pub fn update_budget(&mut self, budget: Budget) -> Result<(), LedgerError> {
        if !budget.amount.is_finite() {
            return Err(ValidationError::NonFiniteAmount(budget.amount).into());
        }
        let index = self
            .state
            .budgets
            .iter()
            .position(|b| b.id == budget.id)
            .ok_or_else(|| LedgerError::BudgetNotFound { id: budget.id.clone() })?;
        self.checkpoint();
        Arc::make_mut(&mut self.state.budgets)[index] = budget;
        Ok(())
    }

    pub fn delete_budget(&mut self, id: &str) -> Result<Budget, LedgerError> {
        if id.trim().is_empty() {
            warn!("delete rejected: empty budget id");
            return Err(ValidationError::EmptyIdentifier.into());
        }
        let index = self
            .state
            .budgets
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| LedgerError::BudgetNotFound { id: id.to_string() })?;
        self.checkpoint();
        let budgets = Arc::make_mut(&mut self.state.budgets);
        let removed = budgets.remove(index);
        if budgets.is_empty() {
            warn!(budget_id = %removed.id, "delete emptied the budget collection");
        }
        Ok(removed)
    }

    // ── Wholesale setters (no checkpoint) ───────────────────────────

    pub fn set_collection(&mut self, kind: CollectionKind, items: Vec<Value>) {
        *self.state.collection_mut(kind) = Arc::new(items);
    }

    pub fn set_accounts(&mut self, accounts: Vec<Account>) {
        self.state.account_registry = Arc::new(accounts);
    }

    pub fn set_categories(&mut self, categories: Vec<Category>) {
        self.state.category_registry = Arc::new(categories);
    }

    /// Replace the live rate table. Already stored transactions keep the
    /// snapshot they were created with.
    pub fn set_exchange_rates(&mut self, rates: BTreeMap<String, f64>) {
        self.state.exchange_rates = rates;
    }

    // ── History ─────────────────────────────────────────────────────

    /// Restore the most recent checkpoint. Returns false when there is
    /// nothing to undo.
    pub fn undo(&mut self) -> bool {
        match self.history.pop() {
            Some(previous) => {
                self.state = previous;
                true
            }
            None => false,
        }
    }

    /// The state `undo` would restore, if any.
    pub fn last_checkpoint(&self) -> Option<&LedgerData> {
        self.history.last()
    }

    /// Take back a mutation that just succeeded: drop its checkpoint and
    /// restore `previous`.
    pub fn revert(&mut self, previous: LedgerData) {
        self.history.pop();
        self.state = previous;
    }

    /// Replace the whole state and forget the undo history.
    pub fn reset(&mut self, state: LedgerData) {
        self.state = state;
        self.history.clear();
    }
}
