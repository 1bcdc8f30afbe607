//! Service configuration
//!
//! All structs deserialize from JSON (camelCase) so a host can keep them in
//! its own settings file. Durations are expressed in milliseconds.

use crate::journal::FsyncPolicy;
use ledger_engine::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default quiet window before a scheduled save is written.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(3_000);

/// Default automatic backup interval (30 minutes).
pub const DEFAULT_AUTO_BACKUP_INTERVAL: Duration = Duration::from_secs(30 * 60);

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ── Persistence ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    /// Root directory; `.ledger-db/` and the legacy `data.json` live here.
    pub base_dir: PathBuf,
    /// Trailing-edge quiet window for scheduled saves.
    #[serde(with = "duration_ms", default = "default_debounce")]
    pub debounce: Duration,
    /// WAL durability policy.
    #[serde(default)]
    pub fsync: FsyncPolicy,
    /// Account names seeded into the registry by the v9→v10 migration.
    #[serde(default)]
    pub default_accounts: Vec<String>,
    /// Category names seeded into the registry by the v9→v10 migration.
    #[serde(default)]
    pub default_categories: Vec<String>,
}

fn default_debounce() -> Duration {
    DEFAULT_DEBOUNCE
}

impl PersistenceConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            debounce: DEFAULT_DEBOUNCE,
            fsync: FsyncPolicy::default(),
            default_accounts: Vec::new(),
            default_categories: Vec::new(),
        }
    }
}

// ── Backups ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Directory holding one file per backup.
    pub dir: PathBuf,
    /// Retained automatic backups (context `auto`).
    #[serde(default = "default_max_auto")]
    pub max_auto: usize,
    /// Retained manual and pre-operation backups.
    #[serde(default = "default_max_manual")]
    pub max_manual: usize,
    #[serde(with = "duration_ms", default = "default_auto_interval")]
    pub auto_interval: Duration,
    /// Write `.json.zst` artifacts instead of plain JSON.
    #[serde(default)]
    pub compress: bool,
}

fn default_max_auto() -> usize {
    5
}

fn default_max_manual() -> usize {
    10
}

fn default_auto_interval() -> Duration {
    DEFAULT_AUTO_BACKUP_INTERVAL
}

impl BackupConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_auto: default_max_auto(),
            max_manual: default_max_manual(),
            auto_interval: DEFAULT_AUTO_BACKUP_INTERVAL,
            compress: false,
        }
    }
}

// ── Service ─────────────────────────────────────────────────────────

/// Everything `LedgerService::open` needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub persistence: PersistenceConfig,
    pub backup: BackupConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl ServiceConfig {
    /// Defaults rooted at `base_dir`, with backups under `base_dir/backups`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref();
        Self {
            persistence: PersistenceConfig::new(base_dir),
            backup: BackupConfig::new(base_dir.join("backups")),
            store: StoreConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::new("/tmp/ledger");
        assert_eq!(config.persistence.debounce, Duration::from_secs(3));
        assert_eq!(config.persistence.fsync, FsyncPolicy::EveryWrite);
        assert_eq!(config.backup.max_auto, 5);
        assert_eq!(config.backup.max_manual, 10);
        assert_eq!(config.backup.dir, PathBuf::from("/tmp/ledger/backups"));
        assert_eq!(config.store.undo_capacity, 20);
    }

    #[test]
    fn test_load_from_json_with_millis() {
        let json = r#"{
            "persistence": { "baseDir": "/data", "debounce": 500 },
            "backup": { "dir": "/data/bk", "autoInterval": 60000, "compress": true }
        }"#;
        let config: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.persistence.debounce, Duration::from_millis(500));
        assert_eq!(config.backup.auto_interval, Duration::from_secs(60));
        assert!(config.backup.compress);
        assert_eq!(config.backup.max_manual, 10);
    }

    #[test]
    fn test_round_trip_serializes_millis() {
        let value = serde_json::to_value(PersistenceConfig::new("/x")).unwrap();
        assert_eq!(value["debounce"], 3000);
    }
}
