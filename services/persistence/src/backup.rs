//! Backup manager: checksum-verified full-state artifacts
//!
//! One file per backup under the backup directory:
//! `<id>.json` (pretty JSON) or `<id>.json.zst` when compression is on.
//!
//! Artifact shape: `{ id, timestamp, version, data, checksum, context }`.
//! The checksum is a 32-bit rolling hash (`h = h*31 + unit`, wrapping) over
//! the UTF-16 code units of the compact `data` JSON, rendered as signed
//! lowercase hex. It detects corruption; it is not a security measure.
//!
//! Rotation keeps the newest `max_auto` backups with context `auto` and,
//! independently, the newest `max_manual` of every other context.

use crate::canonical::{write_atomic, StoreError};
use crate::config::BackupConfig;
use chrono::{SecondsFormat, Utc};
use ledger_types::data::LedgerData;
use ledger_types::ids::BackupId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Context of scheduled backups; every other context is "manual".
pub const AUTO_CONTEXT: &str = "auto";

const EXT_PLAIN: &str = ".json";
const EXT_COMPRESSED: &str = ".json.zst";

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Backup {id} is corrupted: expected checksum {expected}, got {actual}")]
    Corrupted {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<StoreError> for BackupError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(io) => BackupError::Io(io),
            StoreError::Serialization { detail, .. } => BackupError::Serialization(detail),
        }
    }
}

// ── Artifacts ───────────────────────────────────────────────────────

/// A stored backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: BackupId,
    /// RFC 3339 UTC, millisecond precision
    pub timestamp: String,
    pub version: u32,
    pub data: Value,
    pub checksum: String,
    pub context: String,
}

/// Artifact without its payload, as returned by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: BackupId,
    pub timestamp: String,
    pub version: u32,
    pub checksum: String,
    pub context: String,
}

impl BackupMetadata {
    pub fn is_auto(&self) -> bool {
        self.context == AUTO_CONTEXT
    }
}

/// Rolling hash of `text`, matching the legacy artifact format.
pub fn checksum(text: &str) -> String {
    let hash = text
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    if hash < 0 {
        format!("-{:x}", i64::from(hash).unsigned_abs())
    } else {
        format!("{:x}", hash)
    }
}

fn payload_checksum(data: &Value) -> Result<String, BackupError> {
    let compact = serde_json::to_string(data).map_err(|e| BackupError::Serialization(e.to_string()))?;
    Ok(checksum(&compact))
}

/// Keep `[A-Za-z0-9_-]`, replace everything else with `_`.
fn sanitize_context(context: &str) -> String {
    let cleaned: String = context
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "manual".to_string()
    } else {
        cleaned
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// Creates, lists, restores and rotates backups. Clones share the
/// auto-backup timer.
#[derive(Clone)]
pub struct BackupManager {
    config: BackupConfig,
    /// Serializes create + rotate so ids stay unique.
    create_lock: Arc<Mutex<()>>,
    timer: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl BackupManager {
    pub fn new(config: BackupConfig) -> Self {
        Self {
            config,
            create_lock: Arc::new(Mutex::new(())),
            timer: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    fn path_for(&self, id: &str, compressed: bool) -> PathBuf {
        let ext = if compressed { EXT_COMPRESSED } else { EXT_PLAIN };
        self.config.dir.join(format!("{}{}", id, ext))
    }

    async fn exists(&self, id: &str) -> bool {
        for compressed in [false, true] {
            if fs::try_exists(self.path_for(id, compressed)).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    /// Store a full copy of `data`, then rotate. Returns the new id.
    pub async fn create(&self, data: &LedgerData, context: &str) -> Result<BackupId, BackupError> {
        let _guard = self.create_lock.lock().await;
        fs::create_dir_all(&self.config.dir).await?;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let stem = format!(
            "backup_{}_{}",
            timestamp.replace([':', '.'], "-"),
            sanitize_context(context)
        );
        let mut id = stem.clone();
        let mut n = 2;
        while self.exists(&id).await {
            id = format!("{}_{}", stem, n);
            n += 1;
        }

        let payload = serde_json::to_value(data).map_err(|e| BackupError::Serialization(e.to_string()))?;
        let artifact = BackupArtifact {
            id: BackupId::new(id.clone()),
            timestamp,
            version: data.version,
            checksum: payload_checksum(&payload)?,
            data: payload,
            context: context.to_string(),
        };

        let json = serde_json::to_vec_pretty(&artifact).map_err(|e| BackupError::Serialization(e.to_string()))?;
        let bytes = if self.config.compress {
            zstd::encode_all(json.as_slice(), 3).map_err(|e| BackupError::Compression(e.to_string()))?
        } else {
            json
        };
        write_atomic(&self.path_for(&id, self.config.compress), &bytes).await?;
        info!(backup_id = %id, context, bytes = bytes.len(), "backup created");

        self.rotate().await?;
        Ok(artifact.id)
    }

    /// Backup taken right before a risky operation (`pre-<operation>`).
    pub async fn create_pre_operation(&self, data: &LedgerData, operation: &str) -> Result<BackupId, BackupError> {
        self.create(data, &format!("pre-{}", operation)).await
    }

    /// Read a full artifact without verifying it.
    async fn read_artifact(&self, id: &str) -> Result<Vec<u8>, BackupError> {
        for compressed in [false, true] {
            let path = self.path_for(id, compressed);
            match fs::read(&path).await {
                Ok(bytes) if compressed => {
                    return zstd::decode_all(bytes.as_slice()).map_err(|e| BackupError::Compression(e.to_string()))
                }
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(BackupError::NotFound(id.to_string()))
    }

    /// Load and verify a backup. Returns the artifact whose `data` matched
    /// its checksum; any mismatch is a `Corrupted` error.
    pub async fn restore(&self, id: &str) -> Result<BackupArtifact, BackupError> {
        let bytes = self.read_artifact(id).await?;
        let artifact: BackupArtifact = serde_json::from_slice(&bytes).map_err(|e| BackupError::Corrupted {
            id: id.to_string(),
            expected: "a readable artifact".to_string(),
            actual: e.to_string(),
        })?;

        let actual = payload_checksum(&artifact.data)?;
        if actual != artifact.checksum {
            error!(backup_id = id, expected = %artifact.checksum, actual = %actual, "backup checksum mismatch");
            return Err(BackupError::Corrupted {
                id: id.to_string(),
                expected: artifact.checksum,
                actual,
            });
        }
        info!(backup_id = id, version = artifact.version, "backup verified");
        Ok(artifact)
    }

    /// Metadata of every readable backup, newest first.
    pub async fn list(&self) -> Result<Vec<BackupMetadata>, BackupError> {
        let mut dir = match fs::read_dir(&self.config.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name
                .strip_suffix(EXT_COMPRESSED)
                .or_else(|| name.strip_suffix(EXT_PLAIN))
            else {
                continue;
            };
            let meta = match self.read_artifact(id).await {
                Ok(bytes) => serde_json::from_slice::<BackupMetadata>(&bytes)
                    .map_err(|e| BackupError::Serialization(e.to_string())),
                Err(e) => Err(e),
            };
            match meta {
                Ok(meta) => backups.push(meta),
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable backup"),
            }
        }

        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(backups)
    }

    /// Remove one backup.
    pub async fn delete(&self, id: &str) -> Result<(), BackupError> {
        let mut removed = false;
        for compressed in [false, true] {
            match fs::remove_file(self.path_for(id, compressed)).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !removed {
            return Err(BackupError::NotFound(id.to_string()));
        }
        debug!(backup_id = id, "backup deleted");
        Ok(())
    }

    /// Delete the oldest backups beyond each category's limit.
    async fn rotate(&self) -> Result<usize, BackupError> {
        let backups = self.list().await?;
        let (auto, manual): (Vec<_>, Vec<_>) = backups.into_iter().partition(BackupMetadata::is_auto);

        let mut deleted = 0;
        for (list, keep) in [(auto, self.config.max_auto), (manual, self.config.max_manual)] {
            for old in list.iter().skip(keep) {
                self.delete(old.id.as_str()).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            debug!(deleted, "backups rotated");
        }
        Ok(deleted)
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Take an `auto` backup every `auto_interval`, reading the state
    /// through `accessor` at fire time. A failed cycle is logged and the
    /// timer keeps running. Restarting replaces the previous timer.
    pub fn start_auto_backup<F>(&self, accessor: F)
    where
        F: Fn() -> LedgerData + Send + Sync + 'static,
    {
        self.stop_auto_backup();
        let manager = self.clone();
        let period = self.config.auto_interval;
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let data = accessor();
                if let Err(e) = manager.create(&data, AUTO_CONTEXT).await {
                    error!(error = %e, "automatic backup failed");
                }
            }
        });
        *self.timer_slot() = Some(handle);
        info!(interval_ms = period.as_millis() as u64, "automatic backups started");
    }

    pub fn stop_auto_backup(&self) {
        let handle = self.timer_slot().take();
        if let Some(handle) = handle {
            handle.abort();
            info!("automatic backups stopped");
        }
    }

    pub fn auto_backup_running(&self) -> bool {
        self.timer_slot().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn timer_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_types::transaction::{Transaction, TransactionKind};
    use std::sync::Arc as StdArc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sample() -> LedgerData {
        let mut data = LedgerData::default();
        data.transactions = StdArc::new(vec![Transaction::new(
            "t1",
            "2024-01-01",
            TransactionKind::Income,
            1000.0,
            "COP",
        )
        .from_account("c1")]);
        data
    }

    fn manager(tmp: &TempDir) -> BackupManager {
        BackupManager::new(BackupConfig::new(tmp.path().join("backups")))
    }

    #[test]
    fn test_checksum_matches_legacy_format() {
        assert_eq!(checksum(""), "0");
        assert_eq!(checksum("a"), "61");
        assert_eq!(checksum("hello"), "5e918d2");
        assert_eq!(checksum("polygenelubricants"), "-80000000");
        assert_eq!(checksum("ñ"), "f1");
    }

    #[test]
    fn test_sanitize_context() {
        assert_eq!(sanitize_context("pre-import"), "pre-import");
        assert_eq!(sanitize_context("my backup/1"), "my_backup_1");
        assert_eq!(sanitize_context(""), "manual");
    }

    #[tokio::test]
    async fn test_create_and_restore() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp);
        let data = sample();

        let id = manager.create(&data, "manual").await.unwrap();
        assert!(id.as_str().starts_with("backup_"));
        assert!(id.as_str().ends_with("_manual"));
        assert!(!id.as_str().contains(':'));

        let artifact = manager.restore(id.as_str()).await.unwrap();
        assert_eq!(artifact.context, "manual");
        assert_eq!(artifact.version, data.version);
        let restored: LedgerData = serde_json::from_value(artifact.data).unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_restore_verifies_many_fractional_amounts() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp);
        let mut data = LedgerData::default();
        data.transactions = StdArc::new(
            (0..2000)
                .map(|i| {
                    let amount = if i % 2 == 0 {
                        ledger_types::numeric::from_integer((i * 7919 % 100_000_000) as f64)
                    } else {
                        (i as f64) / 7.0 + 0.1
                    };
                    Transaction::new(format!("t{}", i), "2024-01-01", TransactionKind::Expense, amount, "USD")
                        .from_account("c1")
                })
                .collect(),
        );

        let id = manager.create(&data, "manual").await.unwrap();
        let artifact = manager.restore(id.as_str()).await.unwrap();
        let restored: LedgerData = serde_json::from_value(artifact.data).unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_ids_unique_within_same_millisecond() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp);
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(manager.create(&sample(), "manual").await.unwrap());
        }
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp);
        let id = manager.create(&sample(), "manual").await.unwrap();

        let path = tmp.path().join("backups").join(format!("{}.json", id));
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replacen("1000.0", "1001.0", 1)).unwrap();

        match manager.restore(id.as_str()).await {
            Err(BackupError::Corrupted { id: bad, expected, actual }) => {
                assert_eq!(bad, id.as_str());
                assert_ne!(expected, actual);
            }
            other => panic!("expected corruption error, got {:?}", other.map(|a| a.id)),
        }
    }

    #[tokio::test]
    async fn test_rotation_per_category() {
        let tmp = TempDir::new().unwrap();
        let mut config = BackupConfig::new(tmp.path().join("backups"));
        config.max_auto = 2;
        config.max_manual = 3;
        let manager = BackupManager::new(config);

        for _ in 0..4 {
            manager.create(&sample(), AUTO_CONTEXT).await.unwrap();
        }
        for _ in 0..5 {
            manager.create(&sample(), "manual").await.unwrap();
        }
        manager.create_pre_operation(&sample(), "import").await.unwrap();

        let list = manager.list().await.unwrap();
        assert_eq!(list.iter().filter(|b| b.is_auto()).count(), 2);
        assert_eq!(list.iter().filter(|b| !b.is_auto()).count(), 3);
        assert!(list.iter().any(|b| b.context == "pre-import"));
    }

    #[tokio::test]
    async fn test_list_skips_unreadable_and_sorts_newest_first() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(&tmp);
        manager.create(&sample(), "first").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.create(&sample(), "second").await.unwrap();
        std::fs::write(tmp.path().join("backups").join("junk.json"), b"not json").unwrap();

        let list = manager.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].context, "second");
    }

    #[tokio::test]
    async fn test_compressed_artifacts() {
        let tmp = TempDir::new().unwrap();
        let mut config = BackupConfig::new(tmp.path().join("backups"));
        config.compress = true;
        let manager = BackupManager::new(config);

        let id = manager.create(&sample(), "manual").await.unwrap();
        assert!(tmp.path().join("backups").join(format!("{}.json.zst", id)).exists());
        assert_eq!(manager.list().await.unwrap().len(), 1);
        manager.restore(id.as_str()).await.unwrap();
        manager.delete(id.as_str()).await.unwrap();
        assert!(matches!(manager.restore(id.as_str()).await, Err(BackupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_auto_backup_timer() {
        let tmp = TempDir::new().unwrap();
        let mut config = BackupConfig::new(tmp.path().join("backups"));
        config.auto_interval = Duration::from_millis(100);
        let manager = BackupManager::new(config);

        manager.start_auto_backup(sample);
        assert!(manager.auto_backup_running());
        tokio::time::sleep(Duration::from_millis(450)).await;
        manager.stop_auto_backup();
        assert!(!manager.auto_backup_running());

        let list = manager.list().await.unwrap();
        assert!(list.len() >= 2);
        assert!(list.iter().all(BackupMetadata::is_auto));
    }
}
