//! PersistenceEngine: lifecycle, WAL logging and consolidation
//!
//! Lifecycle: `Uninitialized → Initializing → Ready ⇄ Flushing → Closed`.
//! Reads wait on the `Ready` barrier (a `watch` channel on the state).
//!
//! Write path:
//! - every mutation is appended to the WAL first (`log_record`)
//! - `schedule_save` parks the latest state and restarts a trailing-edge
//!   timer; when it fires, one consolidation writes the canonical store
//! - `force_save` cancels the timer and consolidates immediately
//!
//! Each pending state carries the WAL sequence watermark it already
//! contains. Consolidation compacts only entries at or below it, so
//! records logged while a write is in flight survive until the next one.

use crate::canonical::{CanonicalStore, Layout, ShardTombstone, StoreError};
use crate::config::PersistenceConfig;
use crate::journal::{JournalError, WalRecord, WalWriter};
use crate::migration::{MigrationError, MigrationPipeline, MigrationReport};
use crate::recovery::{RecoveryEngine, RecoveryError, RecoveryMetrics};
use chrono::Utc;
use ledger_engine::summaries;
use ledger_types::data::LedgerData;
use ledger_types::summary::GlobalSummary;
use ledger_types::transaction::Transaction;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Backup error: {0}")]
    Backup(#[from] crate::backup::BackupError),

    #[error("Persistence engine is closed")]
    Closed,

    #[error("Persistence engine is not ready (state: {0})")]
    NotReady(EngineState),
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    /// A consolidation is running; reads and WAL appends continue.
    Flushing,
    Closed,
}

impl EngineState {
    fn is_usable(self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Flushing)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initializing => "initializing",
            EngineState::Ready => "ready",
            EngineState::Flushing => "flushing",
            EngineState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Where the initial state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Granular,
    Legacy,
    LegacyBackup,
    /// Nothing on disk; fresh defaults
    Defaults,
    /// Every source failed; minimal safe defaults
    SafeDefaults,
}

/// Result of `init`.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub data: LedgerData,
    pub source: LoadSource,
    pub safe_mode: bool,
    pub migration: Option<MigrationReport>,
    pub recovery: RecoveryMetrics,
    /// Forensic copies of sources that failed to load
    pub quarantined: Vec<PathBuf>,
}

struct PendingSave {
    data: LedgerData,
    watermark: u64,
}

struct Inner {
    config: PersistenceConfig,
    store: CanonicalStore,
    migrations: MigrationPipeline,
    state: watch::Sender<EngineState>,
    /// Serializes physical consolidation writes.
    write_lock: Mutex<()>,
    wal: Mutex<Option<WalWriter>>,
    pending: StdMutex<Option<PendingSave>>,
    /// Deletes not yet applied to the month shards.
    tombstones: StdMutex<Vec<(u64, ShardTombstone)>>,
    last_logged: AtomicU64,
    generation: AtomicU64,
    timer: StdMutex<Option<JoinHandle<()>>>,
    safe_mode: AtomicBool,
}

/// Durable storage for one ledger. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PersistenceEngine {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PersistenceEngine {
    pub fn new(config: PersistenceConfig) -> Self {
        let layout = Layout::new(&config.base_dir);
        let (state, _) = watch::channel(EngineState::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                migrations: MigrationPipeline::from_config(&config),
                store: CanonicalStore::new(layout),
                config,
                state,
                write_lock: Mutex::new(()),
                wal: Mutex::new(None),
                pending: StdMutex::new(None),
                tombstones: StdMutex::new(Vec::new()),
                last_logged: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                timer: StdMutex::new(None),
                safe_mode: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub fn layout(&self) -> &Layout {
        self.inner.store.layout()
    }

    /// True when the last load fell back to safe defaults.
    pub fn is_safe_mode(&self) -> bool {
        self.inner.safe_mode.load(Ordering::SeqCst)
    }

    /// True while a debounced save is waiting to be written.
    pub fn has_pending(&self) -> bool {
        lock(&self.inner.pending).is_some()
    }

    /// Sequence of the last WAL record appended in this session.
    pub fn last_logged_sequence(&self) -> u64 {
        self.inner.last_logged.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: EngineState) {
        self.inner.state.send_replace(state);
    }

    fn ensure_usable(&self) -> Result<(), PersistenceError> {
        match self.state() {
            s if s.is_usable() => Ok(()),
            EngineState::Closed => Err(PersistenceError::Closed),
            s => Err(PersistenceError::NotReady(s)),
        }
    }

    /// Wait until the engine is ready. Fails once it is closed.
    pub async fn wait_ready(&self) -> Result<(), PersistenceError> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| s.is_usable() || *s == EngineState::Closed)
            .await
            .map_err(|_| PersistenceError::Closed)?;
        if state == EngineState::Closed {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }

    // ── Initialization ──────────────────────────────────────────────

    /// Load the canonical state, replay the WAL on top of it and, when
    /// anything changed, consolidate before signalling `Ready`.
    pub async fn init(&self) -> Result<LoadOutcome, PersistenceError> {
        match self.state() {
            EngineState::Uninitialized => {}
            EngineState::Closed => return Err(PersistenceError::Closed),
            s => return Err(PersistenceError::NotReady(s)),
        }
        self.set_state(EngineState::Initializing);
        info!(base = %self.layout().base_dir().display(), "persistence initializing");

        let result = self.load_and_recover().await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "persistence initialization failed");
                self.set_state(EngineState::Uninitialized);
                return Err(e);
            }
        };

        self.set_state(EngineState::Ready);
        info!(
            source = ?outcome.source,
            safe_mode = outcome.safe_mode,
            transactions = outcome.data.transactions.len(),
            replayed = outcome.recovery.replay_count,
            "persistence ready"
        );
        Ok(outcome)
    }

    async fn load_and_recover(&self) -> Result<LoadOutcome, PersistenceError> {
        let store = &self.inner.store;
        store.ensure_structure().await?;

        let mut outcome = self.load_canonical().await?;

        let wal_path = self.layout().wal_path();
        let recovery = RecoveryEngine::new(&wal_path).recover(&mut outcome.data).await?;
        let writer = WalWriter::open(&wal_path, self.inner.config.fsync).await?;
        let last = writer.last_sequence();
        self.inner.last_logged.store(last, Ordering::SeqCst);
        *lock(&self.inner.tombstones) = recovery.tombstones;
        *self.inner.wal.lock().await = Some(writer);
        outcome.recovery = recovery.metrics;

        let migrated = outcome.migration.as_ref().is_some_and(|r| !r.is_noop());
        let from_legacy = matches!(outcome.source, LoadSource::Legacy | LoadSource::LegacyBackup);
        let needs_consolidation = outcome.recovery.replay_count > 0 || migrated || from_legacy;

        if outcome.safe_mode {
            warn!("safe mode: skipping start-up consolidation");
        } else if needs_consolidation {
            let _guard = self.inner.write_lock.lock().await;
            if let Err(e) = self.consolidate(&outcome.data, last).await {
                // The WAL still holds every record; the next save retries.
                warn!(error = %e, "start-up consolidation failed");
            }
        }
        Ok(outcome)
    }

    /// Failover load: granular store, legacy file, legacy backup, defaults.
    async fn load_canonical(&self) -> Result<LoadOutcome, PersistenceError> {
        let store = &self.inner.store;
        let layout = self.layout().clone();
        let mut failed: Vec<PathBuf> = Vec::new();

        if store.has_granular().await {
            let chunk_paths = crate::canonical::Chunk::ALL.iter().map(|c| layout.chunk_path(*c));
            match store.read_granular().await {
                Ok(Some(raw)) => match self.inner.migrations.upgrade(raw) {
                    Ok((data, report)) => {
                        return self.loaded(data, LoadSource::Granular, Some(report), failed).await
                    }
                    Err(e) => {
                        warn!(error = %e, "granular store failed migration");
                        failed.extend(chunk_paths);
                    }
                },
                Ok(None) => debug!("granular store is empty"),
                Err(e) => {
                    warn!(error = %e, "granular store unreadable");
                    failed.extend(chunk_paths);
                }
            }
        }

        for (path, source) in [
            (layout.legacy_path(), LoadSource::Legacy),
            (layout.legacy_backup_path(), LoadSource::LegacyBackup),
        ] {
            match store.read_json::<Value>(&path).await {
                Ok(None) => continue,
                Ok(Some(raw)) => match self.inner.migrations.upgrade(raw) {
                    Ok((data, report)) => return self.loaded(data, source, Some(report), failed).await,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "legacy store failed migration");
                        failed.push(path);
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "legacy store unreadable");
                    failed.push(path);
                }
            }
        }

        if failed.is_empty() {
            let fresh = serde_json::to_value(LedgerData::default())
                .map_err(|e| MigrationError::Shape(e.to_string()))?;
            let (data, report) = self.inner.migrations.upgrade(fresh)?;
            return self.loaded(data, LoadSource::Defaults, Some(report), failed).await;
        }

        // Every existing source failed: keep them untouched, work on safe defaults
        warn!(sources = failed.len(), "no readable ledger state, entering safe mode");
        failed.push(layout.wal_path());
        let quarantined = store.quarantine(&failed).await?;
        self.inner.safe_mode.store(true, Ordering::SeqCst);
        Ok(LoadOutcome {
            data: LedgerData::safe_defaults(),
            source: LoadSource::SafeDefaults,
            safe_mode: true,
            migration: None,
            recovery: RecoveryMetrics::default(),
            quarantined,
        })
    }

    async fn loaded(
        &self,
        data: LedgerData,
        source: LoadSource,
        migration: Option<MigrationReport>,
        failed: Vec<PathBuf>,
    ) -> Result<LoadOutcome, PersistenceError> {
        let quarantined = if failed.is_empty() {
            Vec::new()
        } else {
            warn!(sources = failed.len(), loaded_from = ?source, "quarantining sources that failed to load");
            self.inner.store.quarantine(&failed).await?
        };
        Ok(LoadOutcome {
            data,
            source,
            safe_mode: false,
            migration,
            recovery: RecoveryMetrics::default(),
            quarantined,
        })
    }

    // ── WAL ─────────────────────────────────────────────────────────

    /// Append one mutation to the WAL. Returns its sequence number.
    pub async fn log_record(&self, record: &WalRecord) -> Result<u64, PersistenceError> {
        self.ensure_usable()?;
        let mut wal = self.inner.wal.lock().await;
        let writer = wal.as_mut().ok_or(PersistenceError::NotReady(self.state()))?;
        let entry = writer.write_record(record, Utc::now().timestamp_millis()).await?;
        self.inner.last_logged.store(entry.sequence, Ordering::SeqCst);

        if let WalRecord::Delete { id, period } = record {
            lock(&self.inner.tombstones).push((
                entry.sequence,
                ShardTombstone {
                    id: id.clone(),
                    period: period.clone(),
                },
            ));
        }
        Ok(entry.sequence)
    }

    // ── Saves ───────────────────────────────────────────────────────

    /// Park `data` for a debounced consolidation. A later call replaces
    /// the parked state and restarts the quiet window.
    pub fn schedule_save(&self, data: LedgerData) -> Result<(), PersistenceError> {
        self.ensure_usable()?;
        let watermark = self.inner.last_logged.load(Ordering::SeqCst);
        *lock(&self.inner.pending) = Some(PendingSave { data, watermark });

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = self.clone();
        let delay = self.inner.config.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if engine.inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            // Detached so that restarting the timer never cancels a write.
            let flusher = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = flusher.flush_pending().await {
                    warn!(error = %e, "debounced save failed, will retry on next change");
                }
            });
        });

        if let Some(previous) = lock(&self.inner.timer).replace(handle) {
            previous.abort();
            debug!(generation, "save coalesced");
        }
        Ok(())
    }

    /// Consolidate the parked state, if any. Returns true when a write ran.
    ///
    /// On failure the parked state is put back unless a newer one replaced it.
    pub async fn flush_pending(&self) -> Result<bool, PersistenceError> {
        let _guard = self.inner.write_lock.lock().await;
        let Some(pending) = lock(&self.inner.pending).take() else {
            return Ok(false);
        };
        match self.consolidate(&pending.data, pending.watermark).await {
            Ok(()) => Ok(true),
            Err(e) => {
                let mut slot = lock(&self.inner.pending);
                if slot.is_none() {
                    *slot = Some(pending);
                }
                Err(e)
            }
        }
    }

    /// Consolidate `data` now, bypassing the debounce window.
    pub async fn force_save(&self, data: LedgerData) -> Result<(), PersistenceError> {
        self.ensure_usable()?;
        self.cancel_timer();
        let _guard = self.inner.write_lock.lock().await;
        lock(&self.inner.pending).take();
        let watermark = self.inner.last_logged.load(Ordering::SeqCst);
        self.consolidate(&data, watermark).await.map_err(|e| {
            error!(error = %e, "forced save failed");
            e
        })
    }

    fn cancel_timer(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = lock(&self.inner.timer).take() {
            handle.abort();
        }
    }

    /// Write `data` to the canonical store and compact the WAL up to
    /// `watermark`. Callers hold the write lock.
    async fn consolidate(&self, data: &LedgerData, watermark: u64) -> Result<(), PersistenceError> {
        let store = &self.inner.store;
        let resume = self.state();
        if resume == EngineState::Ready {
            self.set_state(EngineState::Flushing);
        }
        let result = async {
            store.ensure_structure().await?;

            let tombstones: Vec<ShardTombstone> = lock(&self.inner.tombstones)
                .iter()
                .filter(|(seq, _)| *seq <= watermark)
                .map(|(_, t)| t.clone())
                .collect();
            let shards = store.write_shards(&data.transactions, &tombstones).await?;

            let previous = store.read_summaries().await;
            let summary = summaries::summarize(data, previous, Utc::now());
            store.write_summaries(&summary).await?;

            store.write_granular(data).await?;
            if !self.is_safe_mode() {
                store.retire_legacy().await?;
            }

            let kept = match self.inner.wal.lock().await.as_mut() {
                Some(writer) => writer.compact(watermark).await?,
                None => 0,
            };
            lock(&self.inner.tombstones).retain(|(seq, _)| *seq > watermark);

            info!(
                transactions = data.transactions.len(),
                shards,
                watermark,
                wal_kept = kept,
                "consolidation complete"
            );
            Ok::<(), PersistenceError>(())
        }
        .await;

        if resume == EngineState::Ready && self.state() == EngineState::Flushing {
            self.set_state(EngineState::Ready);
        }
        result
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Summaries written by the last consolidation.
    pub async fn get_summaries(&self) -> Result<Option<GlobalSummary>, PersistenceError> {
        self.wait_ready().await?;
        Ok(self.inner.store.read_summaries().await)
    }

    pub async fn load_shard(&self, period: &str) -> Result<Vec<Transaction>, PersistenceError> {
        self.wait_ready().await?;
        Ok(self.inner.store.load_shard(period).await?)
    }

    pub async fn available_periods(&self) -> Result<Vec<String>, PersistenceError> {
        self.wait_ready().await?;
        Ok(self.inner.store.available_periods().await?)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Make `data` the whole persisted state.
    ///
    /// The new canonical chunks are written before any old shard, summary
    /// or WAL entry is dropped. A failed write leaves the previous state
    /// loadable. Callers fold the WAL first (`force_save`) so nothing old
    /// can replay over the new chunks after a crash.
    pub async fn replace(&self, data: LedgerData) -> Result<(), PersistenceError> {
        self.ensure_usable()?;
        self.cancel_timer();
        let _guard = self.inner.write_lock.lock().await;
        lock(&self.inner.pending).take();
        let store = &self.inner.store;
        let watermark = self.inner.last_logged.load(Ordering::SeqCst);

        store.ensure_structure().await?;
        store.write_granular(&data).await.map_err(|e| {
            error!(error = %e, "replacement write failed, previous state kept");
            e
        })?;

        // Everything below belongs to the replaced state.
        if let Some(writer) = self.inner.wal.lock().await.as_mut() {
            writer.compact(watermark).await?;
        }
        lock(&self.inner.tombstones).clear();
        store.remove_derived().await?;
        self.consolidate(&data, watermark).await?;
        info!(transactions = data.transactions.len(), "ledger state replaced");
        Ok(())
    }

    /// Delete all persisted ledger data (backups and quarantine excepted).
    pub async fn purge(&self) -> Result<(), PersistenceError> {
        self.ensure_usable()?;
        self.cancel_timer();
        let _guard = self.inner.write_lock.lock().await;
        lock(&self.inner.pending).take();
        lock(&self.inner.tombstones).clear();

        let mut wal = self.inner.wal.lock().await;
        wal.take();
        self.inner.store.purge().await?;

        let mut writer = WalWriter::open(self.layout().wal_path(), self.inner.config.fsync).await?;
        // Sequences stay monotonic for the rest of the session.
        writer.set_next_sequence(self.inner.last_logged.load(Ordering::SeqCst) + 1);
        *wal = Some(writer);
        info!("ledger database purged");
        Ok(())
    }

    /// Flush any parked state, sync the WAL and close. Later calls fail
    /// with `Closed`; closing twice is a no-op.
    pub async fn close(&self) -> Result<(), PersistenceError> {
        match self.state() {
            EngineState::Closed => return Ok(()),
            s if !s.is_usable() => {
                self.set_state(EngineState::Closed);
                return Ok(());
            }
            _ => {}
        }
        self.cancel_timer();
        let flushed = self.flush_pending().await;
        if let Err(e) = &flushed {
            error!(error = %e, "final save on close failed");
        }

        let _guard = self.inner.write_lock.lock().await;
        if let Some(mut writer) = self.inner.wal.lock().await.take() {
            writer.sync().await?;
        }
        self.set_state(EngineState::Closed);
        info!("persistence closed");
        flushed.map(|_| ())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
