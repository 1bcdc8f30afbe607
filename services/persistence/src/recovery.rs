//! Recovery flow: canonical state + WAL replay
//!
//! At start-up the engine loads the canonical state (granular store or a
//! legacy file), then replays every intact WAL record on top of it. Records
//! are folded by transaction id, so replaying a record that is already part
//! of the canonical state changes nothing.
//!
//! Recovery process:
//! 1. Open the WAL, tolerating a torn tail
//! 2. Skip frames with a bad checksum, logging a corruption record
//! 3. Decode and apply each record in sequence order
//! 4. Re-sort transactions newest first

use crate::canonical::ShardTombstone;
use crate::journal::WalRecord;
use crate::reader::{CorruptionRecord, ReaderError, WalReader};
use ledger_types::data::LedgerData;
use ledger_types::transaction::{sort_by_date_desc, Transaction};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),
}

// ── Recovery Metrics ────────────────────────────────────────────────

/// Metrics collected during the recovery process.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    /// Number of WAL records applied.
    pub replay_count: u64,
    pub upserts: u64,
    pub deletes: u64,
    /// Records whose payload could not be decoded.
    pub undecodable: u64,
    /// Frames dropped for a bad checksum or a torn tail.
    pub corrupted_frames: u64,
    /// Sequence of the last intact entry (0 for an empty log).
    pub final_sequence: u64,
    pub replay_time_ms: u64,
    pub total_recovery_time_ms: u64,
    pub success: bool,
}

/// Result of a replay: metrics plus the deletes that still have to reach
/// the month shards.
#[derive(Debug, Clone, Default)]
pub struct RecoveryOutcome {
    pub metrics: RecoveryMetrics,
    /// `(sequence, tombstone)` for every replayed delete
    pub tombstones: Vec<(u64, ShardTombstone)>,
    pub corruption: Vec<CorruptionRecord>,
}

// ── Recovery Log Entry ──────────────────────────────────────────────

/// Structured recovery log entry for diagnostics.
#[derive(Debug, Clone)]
pub struct RecoveryLogEntry {
    pub stage: RecoveryStage,
    pub message: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryStage {
    Start,
    JournalOpen,
    Replay,
    Complete,
    Error,
}

// ── Record Applier ──────────────────────────────────────────────────

/// State that WAL records can be folded into.
pub trait RecordApplier {
    /// Apply one record. Returns true when the state changed.
    fn apply_record(&mut self, record: &WalRecord) -> bool;
}

impl RecordApplier for LedgerData {
    fn apply_record(&mut self, record: &WalRecord) -> bool {
        match record {
            WalRecord::Upsert(tx) => {
                let transactions = Arc::make_mut(&mut self.transactions);
                match transactions.iter_mut().find(|t| t.id == tx.id) {
                    Some(existing) if existing == tx => false,
                    Some(existing) => {
                        *existing = tx.clone();
                        true
                    }
                    None => {
                        transactions.insert(0, tx.clone());
                        true
                    }
                }
            }
            WalRecord::Delete { id, .. } => {
                if !self.transactions.iter().any(|t| t.id.as_str() == id) {
                    return false;
                }
                Arc::make_mut(&mut self.transactions).retain(|t| t.id.as_str() != id);
                true
            }
        }
    }
}

// ── Recovery Engine ─────────────────────────────────────────────────

/// Replays the WAL onto a loaded state.
pub struct RecoveryEngine {
    wal_path: PathBuf,
    log: Vec<RecoveryLogEntry>,
}

impl RecoveryEngine {
    pub fn new(wal_path: impl Into<PathBuf>) -> Self {
        Self {
            wal_path: wal_path.into(),
            log: Vec::new(),
        }
    }

    /// Replay every intact WAL record into `state`.
    pub async fn recover(&mut self, state: &mut LedgerData) -> Result<RecoveryOutcome, RecoveryError> {
        let total_start = Instant::now();
        let mut outcome = RecoveryOutcome::default();

        self.log_stage(RecoveryStage::Start, "Recovery started", 0);
        self.log_stage(RecoveryStage::JournalOpen, "Opening WAL", 0);
        let mut reader = match WalReader::open(&self.wal_path).await {
            Ok(reader) => reader,
            Err(e) => {
                self.log_stage(RecoveryStage::Error, &format!("Open error: {}", e), 0);
                error!(path = %self.wal_path.display(), error = %e, "WAL could not be opened");
                return Err(e.into());
            }
        };

        let replay_start = Instant::now();
        let (entries, corruption) = reader.recover_entries();
        for record in &corruption {
            warn!(
                offset = record.byte_offset,
                kind = ?record.kind,
                detail = %record.detail,
                "WAL corruption skipped during recovery"
            );
        }
        outcome.metrics.corrupted_frames = corruption.len() as u64;
        outcome.corruption = corruption;

        let mut changed = false;
        for entry in &entries {
            let record = match WalRecord::decode(entry) {
                Ok(record) => record,
                Err(e) => {
                    warn!(seq = entry.sequence, error = %e, "undecodable WAL record skipped");
                    outcome.metrics.undecodable += 1;
                    continue;
                }
            };
            if let WalRecord::Delete { id, period } = &record {
                outcome.tombstones.push((
                    entry.sequence,
                    ShardTombstone {
                        id: id.clone(),
                        period: period.clone(),
                    },
                ));
                outcome.metrics.deletes += 1;
            } else {
                outcome.metrics.upserts += 1;
            }
            changed |= state.apply_record(&record);
            outcome.metrics.replay_count += 1;
            outcome.metrics.final_sequence = entry.sequence;
        }
        if changed {
            let transactions: &mut Vec<Transaction> = Arc::make_mut(&mut state.transactions);
            sort_by_date_desc(transactions);
        }

        outcome.metrics.replay_time_ms = replay_start.elapsed().as_millis() as u64;
        self.log_stage(
            RecoveryStage::Replay,
            &format!(
                "Replayed {} records in {}ms",
                outcome.metrics.replay_count, outcome.metrics.replay_time_ms
            ),
            outcome.metrics.replay_time_ms,
        );

        outcome.metrics.total_recovery_time_ms = total_start.elapsed().as_millis() as u64;
        outcome.metrics.success = true;
        self.log_stage(
            RecoveryStage::Complete,
            &format!(
                "Recovery complete: {} records, final seq={}",
                outcome.metrics.replay_count, outcome.metrics.final_sequence
            ),
            outcome.metrics.total_recovery_time_ms,
        );

        if outcome.metrics.replay_count > 0 || outcome.metrics.corrupted_frames > 0 {
            info!(
                replayed = outcome.metrics.replay_count,
                upserts = outcome.metrics.upserts,
                deletes = outcome.metrics.deletes,
                corrupted = outcome.metrics.corrupted_frames,
                final_seq = outcome.metrics.final_sequence,
                "WAL recovery finished"
            );
        }
        Ok(outcome)
    }

    /// Get recovery log entries.
    pub fn log(&self) -> &[RecoveryLogEntry] {
        &self.log
    }

    fn log_stage(&mut self, stage: RecoveryStage, message: &str, elapsed_ms: u64) {
        self.log.push(RecoveryLogEntry {
            stage,
            message: message.to_string(),
            elapsed_ms,
        });
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{FsyncPolicy, WalWriter};
    use ledger_types::transaction::{Transaction, TransactionKind};
    use std::path::Path;
    use tempfile::TempDir;

    fn tx(id: &str, date: &str, amount: f64) -> Transaction {
        Transaction::new(id, date, TransactionKind::Expense, amount, "COP").from_account("c1")
    }

    async fn write_records(path: &Path, records: &[WalRecord]) {
        let mut writer = WalWriter::open(path, FsyncPolicy::EveryWrite).await.unwrap();
        for (i, record) in records.iter().enumerate() {
            writer.write_record(record, i as i64).await.unwrap();
        }
        writer.sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_replays_upserts_and_deletes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wal").join("recovery.log");
        let b = tx("b", "2024-02-01", 2.0);
        write_records(
            &path,
            &[
                WalRecord::Upsert(tx("a", "2024-01-01", 1.0)),
                WalRecord::Upsert(b.clone()),
                WalRecord::Upsert(tx("a", "2024-01-01", 5.0)),
                WalRecord::deleted(&b),
            ],
        )
        .await;

        let mut state = LedgerData::default();
        let mut engine = RecoveryEngine::new(&path);
        let outcome = engine.recover(&mut state).await.unwrap();

        assert!(outcome.metrics.success);
        assert_eq!(outcome.metrics.replay_count, 4);
        assert_eq!(outcome.metrics.final_sequence, 4);
        assert_eq!(state.transactions.len(), 1);
        assert_eq!(state.transactions[0].amount, Some(5.0));
        assert_eq!(
            outcome.tombstones,
            vec![(4, ShardTombstone { id: "b".into(), period: Some("2024-02".into()) })]
        );
        assert_eq!(engine.log().last().unwrap().stage, RecoveryStage::Complete);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recovery.log");
        write_records(
            &path,
            &[
                WalRecord::Upsert(tx("a", "2024-01-01", 1.0)),
                WalRecord::Upsert(tx("b", "2024-03-01", 2.0)),
            ],
        )
        .await;

        let mut state = LedgerData::default();
        RecoveryEngine::new(&path).recover(&mut state).await.unwrap();
        let once = state.clone();
        RecoveryEngine::new(&path).recover(&mut state).await.unwrap();
        assert_eq!(state, once);
        let ids: Vec<_> = state.transactions.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_missing_wal_is_empty_recovery() {
        let tmp = TempDir::new().unwrap();
        let mut state = LedgerData::default();
        let outcome = RecoveryEngine::new(tmp.path().join("none.log"))
            .recover(&mut state)
            .await
            .unwrap();
        assert_eq!(outcome.metrics.replay_count, 0);
        assert_eq!(outcome.metrics.final_sequence, 0);
    }

    #[tokio::test]
    async fn test_torn_tail_keeps_intact_records() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recovery.log");
        write_records(
            &path,
            &[
                WalRecord::Upsert(tx("a", "2024-01-01", 1.0)),
                WalRecord::Upsert(tx("b", "2024-01-02", 1.0)),
            ],
        )
        .await;
        let mut bytes = std::fs::read(&path).unwrap();
        let new_len = bytes.len() - 7;
        bytes.truncate(new_len);
        std::fs::write(&path, &bytes).unwrap();

        let mut state = LedgerData::default();
        let outcome = RecoveryEngine::new(&path).recover(&mut state).await.unwrap();
        assert_eq!(outcome.metrics.replay_count, 1);
        assert_eq!(outcome.metrics.corrupted_frames, 1);
        assert!(state.transaction("a").is_some());
        assert!(state.transaction("b").is_none());
    }
}
