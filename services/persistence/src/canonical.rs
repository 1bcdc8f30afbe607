//! Canonical on-disk store
//!
//! Layout under the base directory:
//! ```text
//! data.json                 legacy single-file store
//! data.json.bak             legacy backup copy
//! data.json.migrated        legacy file after the first consolidation
//! .ledger-db/
//!   wal/recovery.log
//!   registry.json           account/category registries (marks the granular store)
//!   settings.json           scalar settings and unknown top-level fields
//!   ledger.json             transactions and budgets
//!   collections.json        opaque host collections
//!   ledger/YYYY-MM.json     month shards
//!   core/summaries.json
//!   quarantine/             copies of sources that failed to load
//! ```
//!
//! Every file is replaced atomically: write `<file>.tmp`, fsync, rename.

use chrono::Utc;
use ledger_types::data::{CollectionKind, LedgerData};
use ledger_types::summary::GlobalSummary;
use ledger_types::transaction::{sort_by_date_desc, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error in {path}: {detail}")]
    Serialization { path: PathBuf, detail: String },
}

// ── Layout ──────────────────────────────────────────────────────────

pub const DB_DIR: &str = ".ledger-db";
pub const LEGACY_FILE: &str = "data.json";

/// Granular chunk files the full state is split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    Registry,
    Settings,
    Ledger,
    Collections,
}

impl Chunk {
    pub const ALL: [Chunk; 4] = [Chunk::Registry, Chunk::Settings, Chunk::Ledger, Chunk::Collections];

    pub fn file_name(self) -> &'static str {
        match self {
            Chunk::Registry => "registry.json",
            Chunk::Settings => "settings.json",
            Chunk::Ledger => "ledger.json",
            Chunk::Collections => "collections.json",
        }
    }

    /// Chunk a top-level state field belongs to.
    fn for_field(field: &str) -> Chunk {
        match field {
            "accountRegistry" | "categoryRegistry" => Chunk::Registry,
            "transactions" | "budgets" => Chunk::Ledger,
            f if CollectionKind::ALL.iter().any(|k| k.field_name() == f) => Chunk::Collections,
            _ => Chunk::Settings,
        }
    }
}

/// Resolved paths of every persisted artifact.
#[derive(Debug, Clone)]
pub struct Layout {
    base_dir: PathBuf,
    db_dir: PathBuf,
}

impl Layout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let db_dir = base_dir.join(DB_DIR);
        Self { base_dir, db_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.db_dir.join("wal")
    }

    pub fn wal_path(&self) -> PathBuf {
        self.wal_dir().join("recovery.log")
    }

    pub fn chunk_path(&self, chunk: Chunk) -> PathBuf {
        self.db_dir.join(chunk.file_name())
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.db_dir.join("ledger")
    }

    pub fn shard_path(&self, period: &str) -> PathBuf {
        self.shard_dir().join(format!("{}.json", period))
    }

    pub fn core_dir(&self) -> PathBuf {
        self.db_dir.join("core")
    }

    pub fn summaries_path(&self) -> PathBuf {
        self.core_dir().join("summaries.json")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.db_dir.join("quarantine")
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.base_dir.join(LEGACY_FILE)
    }

    pub fn legacy_backup_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}.bak", LEGACY_FILE))
    }

    pub fn legacy_migrated_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}.migrated", LEGACY_FILE))
    }
}

// ── Shards ──────────────────────────────────────────────────────────

/// One month of transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardFile {
    pub period: String,
    /// Unix millis of the last rewrite
    pub updated: i64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// A delete that must also be applied to the month shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTombstone {
    pub id: String,
    /// Month shard holding the record; `None` means search every shard.
    pub period: Option<String>,
}

fn is_period(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 7
        && bytes[4] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[5..].iter().all(u8::is_ascii_digit)
}

// ── Store ───────────────────────────────────────────────────────────

/// Reader/writer of the canonical files. Holds no state beyond the layout.
#[derive(Debug, Clone)]
pub struct CanonicalStore {
    layout: Layout,
}

impl CanonicalStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Create every directory of the layout. Idempotent.
    pub async fn ensure_structure(&self) -> Result<(), StoreError> {
        for dir in [self.layout.wal_dir(), self.layout.shard_dir(), self.layout.core_dir()] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    // ── Raw JSON I/O ────────────────────────────────────────────────

    /// Replace `path` with the pretty-printed JSON of `value`.
    pub async fn write_json_atomic<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        write_atomic(path, &bytes).await
    }

    /// Parse a JSON file; a missing file is `Ok(None)`.
    pub async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
    }

    // ── Granular chunks ─────────────────────────────────────────────

    /// True once a consolidation has written the granular store.
    pub async fn has_granular(&self) -> bool {
        fs::try_exists(self.layout.chunk_path(Chunk::Registry))
            .await
            .unwrap_or(false)
    }

    /// Split the state by top-level field and write one file per chunk.
    pub async fn write_granular(&self, data: &LedgerData) -> Result<(), StoreError> {
        let value = serde_json::to_value(data).map_err(|e| StoreError::Serialization {
            path: self.layout.db_dir().to_path_buf(),
            detail: e.to_string(),
        })?;
        let Value::Object(fields) = value else {
            return Err(StoreError::Serialization {
                path: self.layout.db_dir().to_path_buf(),
                detail: "ledger state did not serialize to an object".into(),
            });
        };

        let mut chunks: BTreeMap<&'static str, Map<String, Value>> = Chunk::ALL
            .iter()
            .map(|c| (c.file_name(), Map::new()))
            .collect();
        for (field, v) in fields {
            let chunk = Chunk::for_field(&field);
            chunks.entry(chunk.file_name()).or_default().insert(field, v);
        }

        // Registry last: its presence marks a complete granular store.
        for chunk in [Chunk::Settings, Chunk::Ledger, Chunk::Collections, Chunk::Registry] {
            let body = chunks.remove(chunk.file_name()).unwrap_or_default();
            self.write_json_atomic(&self.layout.chunk_path(chunk), &body).await?;
        }
        Ok(())
    }

    /// Merge every chunk back into one raw state object.
    ///
    /// `Ok(None)` when the granular store does not exist.
    pub async fn read_granular(&self) -> Result<Option<Value>, StoreError> {
        if !self.has_granular().await {
            return Ok(None);
        }
        let mut combined = Map::new();
        for chunk in Chunk::ALL {
            let path = self.layout.chunk_path(chunk);
            match self.read_json::<Value>(&path).await? {
                Some(Value::Object(part)) => combined.extend(part),
                Some(_) => {
                    return Err(StoreError::Serialization {
                        path,
                        detail: "chunk is not a JSON object".into(),
                    })
                }
                None => debug!(chunk = chunk.file_name(), "granular chunk missing"),
            }
        }
        if combined.is_empty() {
            return Ok(None);
        }
        Ok(Some(Value::Object(combined)))
    }

    // ── Month shards ────────────────────────────────────────────────

    /// Merge the in-memory transactions into their month shards.
    ///
    /// Records already in a shard are kept unless replaced by id or named
    /// by a tombstone. Only shards touched by `transactions` or `tombstones`
    /// are rewritten. Returns the number of shards written.
    pub async fn write_shards(
        &self,
        transactions: &[Transaction],
        tombstones: &[ShardTombstone],
    ) -> Result<usize, StoreError> {
        let mut by_period: BTreeMap<String, Vec<&Transaction>> = BTreeMap::new();
        for tx in transactions {
            match tx.period() {
                Some(period) => by_period.entry(period.to_string()).or_default().push(tx),
                None => debug!(tx_id = %tx.id, "transaction without a valid date left out of shards"),
            }
        }

        let removed: HashSet<&str> = tombstones.iter().map(|t| t.id.as_str()).collect();
        let mut periods: BTreeSet<String> = by_period.keys().cloned().collect();
        for tombstone in tombstones {
            match &tombstone.period {
                Some(p) => {
                    periods.insert(p.clone());
                }
                None => periods.extend(self.available_periods().await?),
            }
        }

        let now = Utc::now().timestamp_millis();
        let mut written = 0;
        for period in periods {
            let path = self.layout.shard_path(&period);
            let existing = match self.read_json::<ShardFile>(&path).await {
                Ok(shard) => shard.map(|s| s.transactions).unwrap_or_default(),
                Err(e) => {
                    warn!(period = %period, error = %e, "unreadable shard, rewriting from memory");
                    Vec::new()
                }
            };
            let incoming = by_period.get(&period).map(Vec::as_slice).unwrap_or(&[]);
            if incoming.is_empty() && !existing.iter().any(|t| removed.contains(t.id.as_str())) {
                continue;
            }

            let mut merged: BTreeMap<String, Transaction> = existing
                .into_iter()
                .filter(|t| !removed.contains(t.id.as_str()))
                .map(|t| (t.id.to_string(), t))
                .collect();
            for tx in incoming {
                merged.insert(tx.id.to_string(), (*tx).clone());
            }
            let mut transactions: Vec<Transaction> = merged.into_values().collect();
            sort_by_date_desc(&mut transactions);

            let shard = ShardFile {
                period,
                updated: now,
                transactions,
            };
            self.write_json_atomic(&path, &shard).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Transactions of one month (empty when the shard does not exist).
    pub async fn load_shard(&self, period: &str) -> Result<Vec<Transaction>, StoreError> {
        let shard: Option<ShardFile> = self.read_json(&self.layout.shard_path(period)).await?;
        Ok(shard.map(|s| s.transactions).unwrap_or_default())
    }

    /// Months that have a shard on disk, newest first.
    pub async fn available_periods(&self) -> Result<Vec<String>, StoreError> {
        let mut periods = Vec::new();
        let mut dir = match fs::read_dir(self.layout.shard_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(periods),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(period) = name.strip_suffix(".json") {
                if is_period(period) {
                    periods.push(period.to_string());
                }
            }
        }
        periods.sort_by(|a, b| b.cmp(a));
        Ok(periods)
    }

    // ── Summaries ───────────────────────────────────────────────────

    pub async fn write_summaries(&self, summary: &GlobalSummary) -> Result<(), StoreError> {
        self.write_json_atomic(&self.layout.summaries_path(), summary).await
    }

    /// Last written summaries; unreadable content reads as absent.
    pub async fn read_summaries(&self) -> Option<GlobalSummary> {
        match self.read_json(&self.layout.summaries_path()).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable summaries");
                None
            }
        }
    }

    // ── Legacy & maintenance ────────────────────────────────────────

    /// Rename a legacy `data.json` to `data.json.migrated` once its content
    /// lives in the granular store. Returns true when a file was renamed.
    pub async fn retire_legacy(&self) -> Result<bool, StoreError> {
        let legacy = self.layout.legacy_path();
        if !fs::try_exists(&legacy).await.unwrap_or(false) {
            return Ok(false);
        }
        fs::rename(&legacy, self.layout.legacy_migrated_path()).await?;
        info!(path = %legacy.display(), "legacy store retired after migration");
        Ok(true)
    }

    /// Copy `sources` into the quarantine directory, leaving the originals
    /// where they are. Returns the copies made.
    pub async fn quarantine(&self, sources: &[PathBuf]) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.layout.quarantine_dir();
        fs::create_dir_all(&dir).await?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");

        let mut copies = Vec::new();
        for source in sources {
            if !fs::try_exists(source).await.unwrap_or(false) {
                continue;
            }
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "unnamed".to_string());
            let target = dir.join(format!("{}-{}", stamp, name));
            fs::copy(source, &target).await?;
            copies.push(target);
        }
        Ok(copies)
    }

    /// Drop shards and summaries. Canonical chunks, the WAL and legacy
    /// files are left alone.
    pub async fn remove_derived(&self) -> Result<(), StoreError> {
        remove_dir_if_exists(&self.layout.shard_dir()).await?;
        remove_dir_if_exists(&self.layout.core_dir()).await?;
        self.ensure_structure().await
    }

    /// Delete every persisted artifact except backups and quarantine, then
    /// recreate the empty structure.
    pub async fn purge(&self) -> Result<(), StoreError> {
        warn!(path = %self.layout.base_dir().display(), "purging ledger database");

        remove_file_if_exists(&self.layout.wal_path()).await?;
        remove_dir_if_exists(&self.layout.shard_dir()).await?;
        remove_dir_if_exists(&self.layout.core_dir()).await?;
        for chunk in Chunk::ALL {
            remove_file_if_exists(&self.layout.chunk_path(chunk)).await?;
        }
        remove_file_if_exists(&self.layout.legacy_path()).await?;
        remove_file_if_exists(&self.layout.legacy_migrated_path()).await?;

        self.ensure_structure().await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Write `bytes` to `path` through a temp file, fsync, rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_types::account::Account;
    use ledger_types::transaction::TransactionKind;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> CanonicalStore {
        CanonicalStore::new(Layout::new(tmp.path()))
    }

    fn tx(id: &str, date: &str) -> Transaction {
        Transaction::new(id, date, TransactionKind::Income, 5.0, "COP").from_account("c1")
    }

    fn sample_state() -> LedgerData {
        let mut data = LedgerData::default();
        data.account_registry = Arc::new(vec![Account::new("c1", "Cash", "COP")]);
        data.transactions = Arc::new(vec![tx("a", "2024-02-01"), tx("b", "2024-01-10")]);
        data.trades = Arc::new(vec![serde_json::json!({"id": "tr1"})]);
        data.extra.insert("business".into(), serde_json::json!({"products": []}));
        data
    }

    #[tokio::test]
    async fn test_granular_split_and_merge() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.ensure_structure().await.unwrap();
        assert!(!store.has_granular().await);

        let data = sample_state();
        store.write_granular(&data).await.unwrap();
        assert!(store.has_granular().await);

        let registry: Value = store
            .read_json(&store.layout().chunk_path(Chunk::Registry))
            .await
            .unwrap()
            .unwrap();
        assert!(registry.get("accountRegistry").is_some());
        assert!(registry.get("transactions").is_none());

        let settings: Value = store
            .read_json(&store.layout().chunk_path(Chunk::Settings))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settings["business"], serde_json::json!({"products": []}));

        let merged = store.read_granular().await.unwrap().unwrap();
        let back: LedgerData = serde_json::from_value(merged).unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_tmp() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let path = tmp.path().join("nested").join("file.json");
        store.write_json_atomic(&path, &serde_json::json!({"a": 1})).await.unwrap();
        store.write_json_atomic(&path, &serde_json::json!({"a": 2})).await.unwrap();

        let value: Value = store.read_json(&path).await.unwrap().unwrap();
        assert_eq!(value["a"], 2);
        assert!(!tmp.path().join("nested").join("file.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_json_distinguishes_missing_and_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let path = tmp.path().join("x.json");
        assert!(store.read_json::<Value>(&path).await.unwrap().is_none());

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            store.read_json::<Value>(&path).await,
            Err(StoreError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_shards_merge_by_id_and_sort() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let first = vec![tx("a", "2024-01-05"), tx("b", "2024-01-20"), tx("c", "2024-02-01")];
        assert_eq!(store.write_shards(&first, &[]).await.unwrap(), 2);

        let mut edited = tx("a", "2024-01-06");
        edited.note = "edited".into();
        store.write_shards(&[edited], &[]).await.unwrap();

        let jan = store.load_shard("2024-01").await.unwrap();
        let ids: Vec<_> = jan.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(jan[1].note, "edited");

        assert_eq!(store.available_periods().await.unwrap(), vec!["2024-02", "2024-01"]);
        assert!(store.load_shard("1999-01").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tombstones_remove_from_shards() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store
            .write_shards(&[tx("a", "2024-01-05"), tx("b", "2024-03-01")], &[])
            .await
            .unwrap();

        let tombstones = vec![
            ShardTombstone { id: "a".into(), period: Some("2024-01".into()) },
            ShardTombstone { id: "b".into(), period: None },
        ];
        assert_eq!(store.write_shards(&[], &tombstones).await.unwrap(), 2);
        assert!(store.load_shard("2024-01").await.unwrap().is_empty());
        assert!(store.load_shard("2024-03").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retire_legacy_and_quarantine() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let legacy = store.layout().legacy_path();
        std::fs::write(&legacy, b"{}").unwrap();

        let copies = store.quarantine(&[legacy.clone()]).await.unwrap();
        assert_eq!(copies.len(), 1);
        assert!(legacy.exists());

        assert!(store.retire_legacy().await.unwrap());
        assert!(!legacy.exists());
        assert!(store.layout().legacy_migrated_path().exists());
        assert!(!store.retire_legacy().await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_removes_everything_but_backups() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.ensure_structure().await.unwrap();
        store.write_granular(&sample_state()).await.unwrap();
        store.write_shards(&sample_state().transactions, &[]).await.unwrap();
        store.write_summaries(&GlobalSummary::default()).await.unwrap();
        std::fs::write(store.layout().legacy_path(), b"{}").unwrap();
        std::fs::create_dir_all(tmp.path().join("backups")).unwrap();

        store.purge().await.unwrap();
        assert!(!store.has_granular().await);
        assert!(store.available_periods().await.unwrap().is_empty());
        assert!(store.read_summaries().await.is_none());
        assert!(!store.layout().legacy_path().exists());
        assert!(store.layout().shard_dir().exists());
        assert!(tmp.path().join("backups").exists());
    }
}
