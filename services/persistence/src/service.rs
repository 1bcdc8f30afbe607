//! LedgerService: the facade a host talks to
//!
//! Owns the in-memory [`TransactionStore`], the [`PersistenceEngine`] and
//! the [`BackupManager`]. Every mutation takes effect in memory at once,
//! is appended to the WAL, and schedules a debounced consolidation.

use crate::backup::{BackupError, BackupManager, BackupMetadata};
use crate::config::ServiceConfig;
use crate::engine::{LoadSource, PersistenceEngine, PersistenceError};
use crate::journal::WalRecord;
use crate::migration::MigrationPipeline;
use ledger_engine::projector::{self, BalanceMap};
use ledger_engine::TransactionStore;
use ledger_types::account::{Account, Category};
use ledger_types::data::{Budget, CollectionKind, LedgerData};
use ledger_types::errors::LedgerError;
use ledger_types::ids::BackupId;
use ledger_types::summary::GlobalSummary;
use ledger_types::transaction::Transaction;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<BackupError> for ServiceError {
    fn from(e: BackupError) -> Self {
        ServiceError::Persistence(e.into())
    }
}

impl From<crate::migration::MigrationError> for ServiceError {
    fn from(e: crate::migration::MigrationError) -> Self {
        ServiceError::Persistence(e.into())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

pub struct LedgerService {
    store: TransactionStore,
    engine: PersistenceEngine,
    backups: BackupManager,
    migrations: MigrationPipeline,
    /// Latest state, read by the auto-backup timer.
    published: watch::Sender<LedgerData>,
    source: LoadSource,
}

impl LedgerService {
    /// Initialize persistence and load the ledger.
    pub async fn open(config: ServiceConfig) -> ServiceResult<Self> {
        let engine = PersistenceEngine::new(config.persistence.clone());
        let outcome = engine.init().await?;
        if outcome.safe_mode {
            warn!(quarantined = outcome.quarantined.len(), "ledger opened in safe mode");
        }

        let store = TransactionStore::new(outcome.data, config.store);
        let (published, _) = watch::channel(store.snapshot());
        Ok(Self {
            migrations: MigrationPipeline::from_config(&config.persistence),
            backups: BackupManager::new(config.backup),
            store,
            engine,
            published,
            source: outcome.source,
        })
    }

    pub fn engine(&self) -> &PersistenceEngine {
        &self.engine
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn state(&self) -> &LedgerData {
        self.store.state()
    }

    pub fn transactions(&self) -> &[Transaction] {
        self.store.transactions()
    }

    pub fn undo_depth(&self) -> usize {
        self.store.undo_depth()
    }

    pub fn load_source(&self) -> LoadSource {
        self.source
    }

    pub fn is_safe_mode(&self) -> bool {
        self.engine.is_safe_mode()
    }

    /// Publish the current state and schedule a debounced save.
    fn changed(&mut self) -> ServiceResult<()> {
        let snapshot = self.store.snapshot();
        self.published.send_replace(snapshot.clone());
        self.engine.schedule_save(snapshot)?;
        Ok(())
    }

    /// Append `records` in order. A failure reports how many got in.
    async fn log_all(&self, records: &[WalRecord]) -> Result<(), (usize, PersistenceError)> {
        for (logged, record) in records.iter().enumerate() {
            self.engine.log_record(record).await.map_err(|e| (logged, e))?;
        }
        Ok(())
    }

    /// Make an applied mutation durable. When the WAL refuses it, memory
    /// goes back to `before` and the error is returned.
    async fn commit(&mut self, before: LedgerData, records: &[WalRecord]) -> ServiceResult<()> {
        if let Err((logged, e)) = self.log_all(records).await {
            self.store.revert(before);
            self.compensate(&records[..logged]).await;
            warn!(error = %e, "WAL append failed, change rolled back");
            return Err(e.into());
        }
        self.changed()
    }

    /// Log the current version of every record in `logged`, so a partly
    /// written batch replays to the state memory holds.
    async fn compensate(&self, logged: &[WalRecord]) {
        for record in logged {
            let restore = match (self.store.state().transaction(record.transaction_id()), record) {
                (Some(current), _) => WalRecord::Upsert(current.clone()),
                (None, WalRecord::Upsert(tx)) => WalRecord::deleted(tx),
                (None, WalRecord::Delete { .. }) => continue,
            };
            if let Err(e) = self.engine.log_record(&restore).await {
                warn!(error = %e, tx_id = record.transaction_id(), "could not log compensating record");
            }
        }
    }

    // ── Transactions ────────────────────────────────────────────────

    pub async fn add_transaction(&mut self, tx: Transaction) -> ServiceResult<Transaction> {
        let before = self.store.snapshot();
        let stored = self.store.add_transaction(tx)?;
        self.commit(before, &[WalRecord::Upsert(stored.clone())]).await?;
        Ok(stored)
    }

    /// Update a stored transaction. Moving it to another month also
    /// tombstones the copy in the old month's shard.
    pub async fn update_transaction(&mut self, tx: Transaction) -> ServiceResult<Transaction> {
        let before = self.store.snapshot();
        let stored = self.store.update_transaction(tx)?;
        let records = match before.transaction(stored.id.as_str()) {
            Some(previous) => replacement(previous, &stored),
            None => vec![WalRecord::Upsert(stored.clone())],
        };
        self.commit(before, &records).await?;
        Ok(stored)
    }

    pub async fn delete_transaction(&mut self, id: &str) -> ServiceResult<Transaction> {
        let before = self.store.snapshot();
        let removed = self.store.delete_transaction(id)?;
        self.commit(before, &[WalRecord::deleted(&removed)]).await?;
        Ok(removed)
    }

    /// Import a batch as one undoable step. A batch that validates gets a
    /// `pre-import` backup before it is applied.
    pub async fn add_transactions_bulk(&mut self, batch: Vec<Transaction>) -> ServiceResult<Vec<Transaction>> {
        if batch.is_empty() {
            return Ok(batch);
        }
        self.store.validate_batch(&batch)?;
        if let Err(e) = self.backups.create_pre_operation(self.store.state(), "import").await {
            warn!(error = %e, "pre-import backup failed, importing anyway");
        }
        let before = self.store.snapshot();
        let stored = self.store.add_transactions_bulk(batch)?;
        let records: Vec<WalRecord> = stored.iter().cloned().map(WalRecord::Upsert).collect();
        self.commit(before, &records).await?;
        Ok(stored)
    }

    /// Undo the last checkpointed mutation. The transaction difference is
    /// logged before memory changes. Returns false when there was nothing
    /// to undo.
    pub async fn undo(&mut self) -> ServiceResult<bool> {
        let Some(target) = self.store.last_checkpoint() else {
            return Ok(false);
        };
        let records = transaction_diff(self.store.transactions(), &target.transactions);
        if let Err((logged, e)) = self.log_all(&records).await {
            self.compensate(&records[..logged]).await;
            warn!(error = %e, "WAL append failed, undo not applied");
            return Err(e.into());
        }
        self.store.undo();
        self.changed()?;
        Ok(true)
    }

    // ── Budgets & collections ───────────────────────────────────────

    pub fn add_budget(&mut self, budget: Budget) -> ServiceResult<()> {
        self.store.add_budget(budget)?;
        self.changed()
    }

    pub fn update_budget(&mut self, budget: Budget) -> ServiceResult<()> {
        self.store.update_budget(budget)?;
        self.changed()
    }

    pub fn delete_budget(&mut self, id: &str) -> ServiceResult<Budget> {
        let removed = self.store.delete_budget(id)?;
        self.changed()?;
        Ok(removed)
    }

    pub fn set_collection(&mut self, kind: CollectionKind, items: Vec<Value>) -> ServiceResult<()> {
        self.store.set_collection(kind, items);
        self.changed()
    }

    pub fn set_accounts(&mut self, accounts: Vec<Account>) -> ServiceResult<()> {
        self.store.set_accounts(accounts);
        self.changed()
    }

    pub fn set_categories(&mut self, categories: Vec<Category>) -> ServiceResult<()> {
        self.store.set_categories(categories);
        self.changed()
    }

    pub fn set_exchange_rates(&mut self, rates: BTreeMap<String, f64>) -> ServiceResult<()> {
        self.store.set_exchange_rates(rates);
        self.changed()
    }

    /// Replace everything with fresh defaults, after a `pre-reset` backup.
    pub async fn reset_to_defaults(&mut self) -> ServiceResult<()> {
        self.backups.create_pre_operation(self.store.state(), "reset").await?;
        let defaults = self.fresh_defaults()?;
        self.replace_persisted(defaults.clone()).await?;
        self.store.reset(defaults);
        self.published.send_replace(self.store.snapshot());
        info!("ledger reset to defaults");
        Ok(())
    }

    /// Swap the persisted state for `data`. The live state is folded into
    /// the canonical store first, so a failed swap leaves it intact on disk.
    async fn replace_persisted(&self, data: LedgerData) -> ServiceResult<()> {
        self.engine.force_save(self.store.snapshot()).await?;
        self.engine.replace(data).await?;
        Ok(())
    }

    /// A fresh ledger, seeded the same way a first start seeds it.
    fn fresh_defaults(&self) -> ServiceResult<LedgerData> {
        let fresh = serde_json::to_value(LedgerData::default())
            .map_err(|e| crate::migration::MigrationError::Shape(e.to_string()))?;
        Ok(self.migrations.upgrade(fresh)?.0)
    }

    // ── Saves & reads ───────────────────────────────────────────────

    /// Write the current state now.
    pub async fn force_save(&self) -> ServiceResult<()> {
        self.engine.force_save(self.store.snapshot()).await?;
        Ok(())
    }

    pub fn balances(&self) -> BalanceMap {
        self.store.balances()
    }

    /// Balances as a plain `account → currency → amount` map.
    pub fn balances_primitive(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        projector::to_primitive(&self.store.balances())
    }

    pub async fn get_summaries(&self) -> ServiceResult<Option<GlobalSummary>> {
        Ok(self.engine.get_summaries().await?)
    }

    // ── Cold months ─────────────────────────────────────────────────

    /// Load one month shard into memory. Returns how many records were new.
    pub async fn hydrate_period(&mut self, period: &str) -> ServiceResult<usize> {
        let shard = self.engine.load_shard(period).await?;
        let added = self.store.hydrate_shard(shard);
        if added > 0 {
            self.published.send_replace(self.store.snapshot());
        }
        Ok(added)
    }

    /// Drop a cold period from memory; its shards stay on disk.
    pub fn unload_period(&mut self, prefix: &str) -> usize {
        let dropped = self.store.unload_period(prefix);
        if dropped > 0 {
            self.published.send_replace(self.store.snapshot());
        }
        dropped
    }

    pub async fn available_periods(&self) -> ServiceResult<Vec<String>> {
        Ok(self.engine.available_periods().await?)
    }

    // ── Backups ─────────────────────────────────────────────────────

    pub async fn create_backup(&self, context: &str) -> ServiceResult<BackupId> {
        Ok(self.backups.create(self.store.state(), context).await?)
    }

    pub async fn list_backups(&self) -> ServiceResult<Vec<BackupMetadata>> {
        Ok(self.backups.list().await?)
    }

    /// Replace the ledger with a verified backup.
    ///
    /// The current state is backed up first (`pre-restore`). The restored
    /// state is written before old month shards are dropped, so shards
    /// cannot bring back records the backup does not have. The undo
    /// history is cleared.
    pub async fn restore_backup(&mut self, id: &str) -> ServiceResult<LedgerData> {
        let artifact = self.backups.restore(id).await?;
        let (data, _) = self.migrations.upgrade(artifact.data)?;

        self.backups.create_pre_operation(self.store.state(), "restore").await?;
        self.replace_persisted(data.clone()).await?;
        self.store.reset(data.clone());
        self.published.send_replace(self.store.snapshot());
        info!(backup_id = id, transactions = data.transactions.len(), "backup restored");
        Ok(data)
    }

    /// Start automatic backups of the live state.
    pub fn start_auto_backup(&self) {
        let rx = self.published.subscribe();
        self.backups.start_auto_backup(move || rx.borrow().clone());
    }

    pub fn stop_auto_backup(&self) {
        self.backups.stop_auto_backup();
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Delete every persisted record (backups kept) and clear memory.
    pub async fn purge(&mut self) -> ServiceResult<()> {
        let defaults = self.fresh_defaults()?;
        self.engine.purge().await?;
        self.store.reset(defaults);
        self.published.send_replace(self.store.snapshot());
        Ok(())
    }

    /// Stop timers, flush pending work and close persistence.
    pub async fn close(self) -> ServiceResult<()> {
        self.backups.stop_auto_backup();
        self.engine.close().await?;
        Ok(())
    }
}

/// WAL records that turn `before` into `after`.
fn transaction_diff(before: &[Transaction], after: &[Transaction]) -> Vec<WalRecord> {
    let old: HashMap<&str, &Transaction> = before.iter().map(|t| (t.id.as_str(), t)).collect();
    let new: HashMap<&str, &Transaction> = after.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut records = Vec::new();
    for t in after {
        match old.get(t.id.as_str()) {
            Some(previous) if *previous == t => {}
            Some(previous) => records.extend(replacement(previous, t)),
            None => records.push(WalRecord::Upsert(t.clone())),
        }
    }
    records.extend(
        before
            .iter()
            .filter(|t| !new.contains_key(t.id.as_str()))
            .map(WalRecord::deleted),
    );
    records
}

/// Records that replace `previous` with `current`. A move to another month
/// tombstones the old month first.
fn replacement(previous: &Transaction, current: &Transaction) -> Vec<WalRecord> {
    let mut records = Vec::with_capacity(2);
    if previous.period().is_some() && previous.period() != current.period() {
        records.push(WalRecord::deleted(previous));
    }
    records.push(WalRecord::Upsert(current.clone()));
    records
}

// ── Tests ───────────────────────────────────────────────────────────
