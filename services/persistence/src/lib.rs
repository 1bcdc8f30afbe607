//! Persistence service for the personal ledger
//!
//! Durability for the in-memory [`ledger_engine::TransactionStore`]:
//! - `journal` / `reader`: CRC-framed write-ahead log of transaction upserts and deletes
//! - `recovery`: WAL replay on start-up, tolerant of a torn tail
//! - `canonical`: the `.ledger-db/` layout (granular chunks, month shards, summaries)
//! - `migration`: schema upgrades from any supported version to the current one
//! - `engine`: load failover, safe mode, debounced consolidation and WAL compaction
//! - `backup`: checksummed, rotated, optionally compressed backup artifacts
//! - `service`: the `LedgerService` facade that ties the pieces together
//!
//! # Durability contract
//! Every transaction mutation is in the WAL before the call returns. The
//! canonical store catches up after a quiet window; on restart the WAL is
//! replayed on top of whatever the canonical store holds.

pub mod config;
pub mod journal;
pub mod reader;
pub mod recovery;
pub mod canonical;
pub mod migration;
pub mod engine;
pub mod backup;
pub mod service;

pub use backup::{BackupArtifact, BackupError, BackupManager, BackupMetadata};
pub use config::{BackupConfig, PersistenceConfig, ServiceConfig};
pub use engine::{EngineState, LoadOutcome, LoadSource, PersistenceEngine, PersistenceError};
pub use journal::WalRecord;
pub use migration::{MigrationPipeline, MigrationReport};
pub use service::{LedgerService, ServiceError, ServiceResult};
