//! WAL Writer: Append-only mutation log with checksums
//!
//! Every in-memory mutation is appended here before the debounced
//! consolidation folds it into the canonical store. The log survives a
//! crash independently of the debounce timer and is replayed on the next
//! start.
//!
//! # Binary Format (per entry)
//! ```text
//! [body_len:  u32]
//! [sequence:  u64]
//! [timestamp: i64]            // unix millis
//! [kind_len:  u16][kind: bytes]
//! [payload_len: u32][payload: JSON bytes]
//! [checksum: u32]             // CRC32C over sequence+timestamp+kind+payload
//! ```
//! All integers are little-endian.

use crc32c::crc32c;
use ledger_types::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::reader::{CorruptionKind, WalReader};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sequence error: expected {expected}, got {got}")]
    SequenceError { expected: u64, got: u64 },
}

// ── WAL Entry ───────────────────────────────────────────────────────

/// Smallest possible body: seq + ts + kind_len + payload_len + crc.
const MIN_BODY_LEN: usize = 8 + 8 + 2 + 4 + 4;

/// Bodies above this are treated as a corrupted length prefix.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// One framed WAL entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    /// Monotonic per-log sequence number
    pub sequence: u64,
    /// Unix millis at append time
    pub timestamp: i64,
    /// Record kind (`upsert` / `delete`)
    pub kind: String,
    /// JSON-encoded record body
    pub payload: Vec<u8>,
    /// CRC32C over (sequence ++ timestamp ++ kind ++ payload)
    pub checksum: u32,
}

impl WalEntry {
    /// Create a new entry, computing the CRC32C checksum automatically.
    pub fn new(sequence: u64, timestamp: i64, kind: String, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(sequence, timestamp, &kind, &payload);
        Self {
            sequence,
            timestamp,
            kind,
            payload,
            checksum,
        }
    }

    pub fn compute_checksum(sequence: u64, timestamp: i64, kind: &str, payload: &[u8]) -> u32 {
        let mut buf = Vec::with_capacity(16 + kind.len() + payload.len());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(kind.as_bytes());
        buf.extend_from_slice(payload);
        crc32c(&buf)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.timestamp, &self.kind, &self.payload)
    }

    /// Serialize to the binary frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let kind_bytes = self.kind.as_bytes();
        let body_len = (MIN_BODY_LEN + kind_bytes.len() + self.payload.len()) as u32;

        let mut buf = Vec::with_capacity(4 + body_len as usize);
        buf.extend_from_slice(&body_len.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&(kind_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(kind_bytes);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserialize one frame from the start of `data`.
    ///
    /// Returns `(entry, bytes_consumed)`. The checksum is parsed but not
    /// verified; callers decide what to do with a mismatch.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), JournalError> {
        let mut cursor = FrameCursor::new(data);
        let body_len = cursor.u32()? as usize;

        if body_len > MAX_BODY_LEN {
            return Err(JournalError::Serialization(format!(
                "Implausible body length: {} (likely corruption)",
                body_len
            )));
        }
        if body_len < MIN_BODY_LEN {
            return Err(JournalError::Serialization(format!(
                "Body too small: {} bytes, minimum is {}",
                body_len, MIN_BODY_LEN
            )));
        }
        let total = 4 + body_len;
        if data.len() < total {
            return Err(JournalError::Serialization(format!(
                "Incomplete entry: need {} bytes, have {}",
                total,
                data.len()
            )));
        }

        let mut body = FrameCursor::new(&data[4..total]);
        let sequence = body.u64()?;
        let timestamp = body.u64()? as i64;
        let kind_len = body.u16()? as usize;
        let kind = String::from_utf8(body.take(kind_len)?.to_vec())
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        let payload_len = body.u32()? as usize;
        let payload = body.take(payload_len)?.to_vec();
        let checksum = body.u32()?;

        Ok((
            Self {
                sequence,
                timestamp,
                kind,
                payload,
                checksum,
            },
            total,
        ))
    }
}

/// Bounds-checked little-endian reads over a frame.
struct FrameCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], JournalError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(JournalError::Serialization(format!(
                "Field of {} bytes exceeds remaining frame ({} bytes)",
                len,
                self.data.len() - self.pos
            ))),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], JournalError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, JournalError> {
        self.array::<2>().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, JournalError> {
        self.array::<4>().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, JournalError> {
        self.array::<8>().map(u64::from_le_bytes)
    }
}

// ── WAL Records ─────────────────────────────────────────────────────

pub const KIND_UPSERT: &str = "upsert";
pub const KIND_DELETE: &str = "delete";

/// A logged mutation of the transaction collection.
///
/// Upserts carry the full record, so replaying one is idempotent. Deletes
/// are tombstones by id; `period` names the month shard that still holds
/// the record, when known.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Upsert(Transaction),
    Delete { id: String, period: Option<String> },
}

#[derive(Serialize, Deserialize)]
struct Tombstone {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    period: Option<String>,
}

impl WalRecord {
    /// Tombstone for a transaction whose shard is unknown.
    pub fn delete(id: impl Into<String>) -> Self {
        WalRecord::Delete {
            id: id.into(),
            period: None,
        }
    }

    /// Tombstone for a removed transaction, remembering its month shard.
    pub fn deleted(tx: &Transaction) -> Self {
        WalRecord::Delete {
            id: tx.id.to_string(),
            period: tx.period().map(str::to_string),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WalRecord::Upsert(_) => KIND_UPSERT,
            WalRecord::Delete { .. } => KIND_DELETE,
        }
    }

    /// Id of the transaction this record touches.
    pub fn transaction_id(&self) -> &str {
        match self {
            WalRecord::Upsert(tx) => tx.id.as_str(),
            WalRecord::Delete { id, .. } => id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, JournalError> {
        let encoded = match self {
            WalRecord::Upsert(tx) => serde_json::to_vec(tx),
            WalRecord::Delete { id, period } => serde_json::to_vec(&Tombstone {
                id: id.clone(),
                period: period.clone(),
            }),
        };
        encoded.map_err(|e| JournalError::Serialization(e.to_string()))
    }

    pub fn decode(entry: &WalEntry) -> Result<Self, JournalError> {
        let decode_err = |e: serde_json::Error| JournalError::Serialization(e.to_string());
        match entry.kind.as_str() {
            KIND_UPSERT => serde_json::from_slice(&entry.payload)
                .map(WalRecord::Upsert)
                .map_err(decode_err),
            KIND_DELETE => serde_json::from_slice::<Tombstone>(&entry.payload)
                .map(|t| WalRecord::Delete {
                    id: t.id,
                    period: t.period,
                })
                .map_err(decode_err),
            other => Err(JournalError::Serialization(format!(
                "Unknown WAL record kind: {}",
                other
            ))),
        }
    }
}

// ── Fsync Policy ────────────────────────────────────────────────────

/// Controls when `fsync` (durable write) is called. Every append is always
/// flushed to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FsyncPolicy {
    /// Fsync after every write.
    #[default]
    EveryWrite,
    /// Fsync every N writes.
    EveryN(usize),
    /// Fsync only on explicit `sync()` and compaction.
    Manual,
}

// ── WAL Writer ──────────────────────────────────────────────────────

/// Append-only writer over a single WAL file.
pub struct WalWriter {
    path: PathBuf,
    file: File,
    fsync: FsyncPolicy,
    next_sequence: u64,
    writes_since_fsync: usize,
}

impl WalWriter {
    /// Open the log for appending, creating it and its directory if needed.
    ///
    /// The next sequence continues after the last valid entry already in
    /// the file. A torn tail is cut off so new frames follow a whole one.
    pub async fn open(path: impl Into<PathBuf>, fsync: FsyncPolicy) -> Result<Self, JournalError> {
        let path = path.into();
        let file = Self::open_append(&path).await?;

        let mut reader = WalReader::open(&path)
            .await
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        let (entries, corruption) = reader.recover_entries();
        let next_sequence = entries.last().map(|e| e.sequence + 1).unwrap_or(1);

        if let Some(torn) = corruption.iter().find(|c| c.kind == CorruptionKind::TruncatedEntry) {
            warn!(path = %path.display(), offset = torn.byte_offset, "truncating torn WAL tail");
            file.set_len(torn.byte_offset).await?;
            file.sync_all().await?;
        }

        Ok(Self {
            path,
            file,
            fsync,
            next_sequence,
            writes_since_fsync: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Sequence of the most recently appended entry (0 when none yet).
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence.saturating_sub(1)
    }

    /// Set the next expected sequence number (used after recovery).
    pub fn set_next_sequence(&mut self, seq: u64) {
        self.next_sequence = seq;
    }

    /// Append a pre-built entry. Validates sequence monotonicity.
    pub async fn append(&mut self, entry: &WalEntry) -> Result<(), JournalError> {
        if entry.sequence != self.next_sequence {
            return Err(JournalError::SequenceError {
                expected: self.next_sequence,
                got: entry.sequence,
            });
        }

        let bytes = entry.to_bytes();
        if let Err(first) = self.write_frame(&bytes).await {
            // The directory may have been removed underneath us; rebuild it
            // and retry once.
            warn!(path = %self.path.display(), error = %first, "WAL append failed, re-creating log");
            self.file = Self::open_append(&self.path).await?;
            self.write_frame(&bytes).await?;
        }

        self.next_sequence = entry.sequence + 1;
        self.writes_since_fsync += 1;
        self.apply_fsync_policy().await?;
        Ok(())
    }

    /// Encode a record and append it under the next sequence.
    pub async fn write_record(
        &mut self,
        record: &WalRecord,
        timestamp: i64,
    ) -> Result<WalEntry, JournalError> {
        let entry = WalEntry::new(
            self.next_sequence,
            timestamp,
            record.kind().to_string(),
            record.encode()?,
        );
        self.append(&entry).await?;
        debug!(seq = entry.sequence, kind = record.kind(), tx_id = record.transaction_id(), "WAL append");
        Ok(entry)
    }

    /// Force flush + fsync.
    pub async fn sync(&mut self) -> Result<(), JournalError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        self.writes_since_fsync = 0;
        Ok(())
    }

    /// Rewrite the log keeping only entries above `watermark`.
    ///
    /// Entries at or below the watermark are already part of the canonical
    /// store. The rewrite goes through a temp file and a rename, so a crash
    /// mid-compaction leaves either the old or the new log. Returns how many
    /// entries were kept.
    pub async fn compact(&mut self, watermark: u64) -> Result<usize, JournalError> {
        self.sync().await?;

        let mut reader = WalReader::open(&self.path)
            .await
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        let (entries, _) = reader.recover_entries();
        let kept: Vec<WalEntry> = entries.into_iter().filter(|e| e.sequence > watermark).collect();

        let mut bytes = Vec::new();
        for entry in &kept {
            bytes.extend_from_slice(&entry.to_bytes());
        }

        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = File::create(&tmp_path).await?;
            tmp.write_all(&bytes).await?;
            tmp.flush().await?;
            tmp.sync_all().await?;
        }
        fs::rename(&tmp_path, &self.path).await?;
        self.file = Self::open_append(&self.path).await?;

        debug!(watermark, kept = kept.len(), "WAL compacted");
        Ok(kept.len())
    }

    // ── Internal Helpers ────────────────────────────────────────────

    async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), JournalError> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        Ok(())
    }

    async fn apply_fsync_policy(&mut self) -> Result<(), JournalError> {
        let should_fsync = match self.fsync {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => self.writes_since_fsync >= n,
            FsyncPolicy::Manual => false,
        };
        if should_fsync {
            self.file.sync_all().await?;
            self.writes_since_fsync = 0;
        }
        Ok(())
    }

    async fn open_append(path: &Path) -> Result<File, JournalError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(file)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_types::transaction::TransactionKind;
    use tempfile::TempDir;

    fn sample_tx(id: &str) -> Transaction {
        Transaction::new(id, "2024-05-01", TransactionKind::Expense, 12.5, "COP").from_account("c1")
    }

    fn sample_entry(seq: u64) -> WalEntry {
        WalEntry::new(seq, 1_714_521_600_000 + seq as i64, KIND_DELETE.into(), br#"{"id":"x"}"#.to_vec())
    }

    #[test]
    fn test_entry_checksum_detects_tamper() {
        let mut entry = sample_entry(1);
        assert!(entry.verify_checksum());
        entry.payload = b"{}".to_vec();
        assert!(!entry.verify_checksum());
    }

    #[test]
    fn test_entry_frame_decodes() {
        let entry = sample_entry(42);
        let bytes = entry.to_bytes();
        let (decoded, consumed) = WalEntry::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_from_bytes_rejects_short_and_torn_frames() {
        assert!(WalEntry::from_bytes(&[1, 2]).is_err());
        let bytes = sample_entry(1).to_bytes();
        assert!(WalEntry::from_bytes(&bytes[..bytes.len() - 3]).is_err());

        let mut bogus = bytes.clone();
        bogus[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(WalEntry::from_bytes(&bogus).is_err());
    }

    #[test]
    fn test_record_encoding() {
        let upsert = WalRecord::Upsert(sample_tx("t1"));
        let entry = WalEntry::new(1, 0, upsert.kind().into(), upsert.encode().unwrap());
        assert_eq!(WalRecord::decode(&entry).unwrap(), upsert);

        let delete = WalRecord::Delete {
            id: "t1".into(),
            period: None,
        };
        let entry = WalEntry::new(2, 0, delete.kind().into(), delete.encode().unwrap());
        assert_eq!(entry.payload, br#"{"id":"t1"}"#);
        assert_eq!(WalRecord::decode(&entry).unwrap(), delete);

        let unknown = WalEntry::new(3, 0, "rename".into(), b"{}".to_vec());
        assert!(WalRecord::decode(&unknown).is_err());
    }

    #[tokio::test]
    async fn test_write_records_assigns_sequences() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wal").join("recovery.log");
        let mut writer = WalWriter::open(&path, FsyncPolicy::EveryWrite).await.unwrap();
        assert_eq!(writer.next_sequence(), 1);

        for i in 0..5 {
            let entry = writer
                .write_record(&WalRecord::Upsert(sample_tx(&format!("t{i}"))), 1_000)
                .await
                .unwrap();
            assert_eq!(entry.sequence, i + 1);
        }
        assert_eq!(writer.last_sequence(), 5);
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_sequence_error_on_gap() {
        let tmp = TempDir::new().unwrap();
        let mut writer = WalWriter::open(tmp.path().join("recovery.log"), FsyncPolicy::Manual)
            .await
            .unwrap();
        writer.append(&sample_entry(1)).await.unwrap();
        match writer.append(&sample_entry(5)).await {
            Err(JournalError::SequenceError { expected, got }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 5);
            }
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recovery.log");
        {
            let mut writer = WalWriter::open(&path, FsyncPolicy::EveryWrite).await.unwrap();
            for _ in 0..3 {
                writer
                    .write_record(&WalRecord::delete("a"), 0)
                    .await
                    .unwrap();
            }
        }
        let writer = WalWriter::open(&path, FsyncPolicy::EveryWrite).await.unwrap();
        assert_eq!(writer.next_sequence(), 4);
    }

    #[tokio::test]
    async fn test_reopen_cuts_torn_tail_before_appending() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recovery.log");
        let mut writer = WalWriter::open(&path, FsyncPolicy::EveryWrite).await.unwrap();
        writer.append(&sample_entry(1)).await.unwrap();
        writer.append(&sample_entry(2)).await.unwrap();
        drop(writer);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let mut writer = WalWriter::open(&path, FsyncPolicy::EveryWrite).await.unwrap();
        assert_eq!(writer.next_sequence(), 2);
        writer.append(&sample_entry(2)).await.unwrap();

        let mut reader = WalReader::open(&path).await.unwrap();
        let entries = reader.read_all().unwrap();
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert!(reader.corruption_log().is_empty());
    }

    #[tokio::test]
    async fn test_compact_keeps_entries_above_watermark() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("recovery.log");
        let mut writer = WalWriter::open(&path, FsyncPolicy::EveryN(2)).await.unwrap();
        for i in 0..6 {
            writer
                .write_record(&WalRecord::Upsert(sample_tx(&format!("t{i}"))), 0)
                .await
                .unwrap();
        }

        assert_eq!(writer.compact(4).await.unwrap(), 2);
        let mut reader = WalReader::open(&path).await.unwrap();
        let seqs: Vec<u64> = reader.read_all().unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![5, 6]);

        // Appends continue after compaction without reusing sequences.
        let entry = writer
            .write_record(&WalRecord::delete("t0"), 0)
            .await
            .unwrap();
        assert_eq!(entry.sequence, 7);

        assert_eq!(writer.compact(u64::MAX).await.unwrap(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_open_recreates_removed_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("wal");
        let path = dir.join("recovery.log");
        let mut writer = WalWriter::open(&path, FsyncPolicy::EveryWrite).await.unwrap();
        writer
            .write_record(&WalRecord::delete("a"), 0)
            .await
            .unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
        let mut writer = WalWriter::open(&path, FsyncPolicy::EveryWrite).await.unwrap();
        writer
            .write_record(&WalRecord::delete("b"), 0)
            .await
            .unwrap();
        assert!(path.exists());
    }
}
