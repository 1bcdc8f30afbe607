//! WAL Reader: Sequential reader with corruption detection
//!
//! Features:
//! - CRC32C validation on every frame
//! - Corruption records with byte offsets
//! - Partial recovery: frames with a bad checksum are skipped, a torn tail
//!   (partial frame left by a crash mid-append) ends the scan
//! - Monotonic sequence validation

use crate::journal::{JournalError, WalEntry};
use std::io;
use std::path::Path;
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Checksum mismatch at byte offset {offset}: entry seq={sequence}")]
    ChecksumMismatch { offset: u64, sequence: u64 },

    #[error("Sequence not monotonic: prev={prev}, current={current}")]
    NotMonotonic { prev: u64, current: u64 },
}

// ── Corruption Log Entry ────────────────────────────────────────────

/// Structured corruption log entry for diagnostics.
#[derive(Debug, Clone)]
pub struct CorruptionRecord {
    /// Byte offset in the file where corruption was detected.
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    TruncatedEntry,
}

// ── WAL Reader ──────────────────────────────────────────────────────

/// Sequential reader over the bytes of one WAL file.
pub struct WalReader {
    data: Vec<u8>,
    pos: usize,
    last_sequence: Option<u64>,
    corruption_log: Vec<CorruptionRecord>,
}

impl WalReader {
    /// Read the whole log. A missing file reads as empty.
    pub async fn open(path: &Path) -> Result<Self, ReaderError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::from_bytes(data))
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            last_sequence: None,
            corruption_log: Vec::new(),
        }
    }

    /// Read the next entry, validating its checksum.
    ///
    /// Returns `None` at end of data, including after a torn tail.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>, ReaderError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }

        let offset = self.pos as u64;
        match WalEntry::from_bytes(&self.data[self.pos..]) {
            Ok((entry, consumed)) => {
                self.pos += consumed;
                if !entry.verify_checksum() {
                    self.corruption_log.push(CorruptionRecord {
                        byte_offset: offset,
                        kind: CorruptionKind::ChecksumMismatch,
                        detail: format!(
                            "CRC32C mismatch for seq={}, stored={:#010x}",
                            entry.sequence, entry.checksum
                        ),
                    });
                    return Err(ReaderError::ChecksumMismatch {
                        offset,
                        sequence: entry.sequence,
                    });
                }
                self.last_sequence = Some(entry.sequence);
                Ok(Some(entry))
            }
            Err(e) => {
                let remaining = self.data.len() - self.pos;
                self.corruption_log.push(CorruptionRecord {
                    byte_offset: offset,
                    kind: CorruptionKind::TruncatedEntry,
                    detail: format!("Truncated entry: {} bytes remaining ({})", remaining, e),
                });
                self.pos = self.data.len();
                Ok(None)
            }
        }
    }

    /// Read all entries, failing on the first checksum mismatch.
    pub fn read_all(&mut self) -> Result<Vec<WalEntry>, ReaderError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Read as many valid entries as possible, skipping frames whose
    /// checksum does not match.
    pub fn recover_entries(&mut self) -> (Vec<WalEntry>, Vec<CorruptionRecord>) {
        let mut entries = Vec::new();
        loop {
            match self.next_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                // The frame length was intact, so the reader is already past it.
                Err(ReaderError::ChecksumMismatch { .. }) => continue,
                Err(_) => break,
            }
        }
        (entries, self.corruption_log.clone())
    }

    pub fn current_offset(&self) -> u64 {
        self.pos as u64
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn corruption_log(&self) -> &[CorruptionRecord] {
        &self.corruption_log
    }

    /// Check that sequences strictly increase. Gaps are expected after
    /// compaction and are not an error.
    pub fn validate_sequences(entries: &[WalEntry]) -> Result<(), ReaderError> {
        for window in entries.windows(2) {
            if window[1].sequence <= window[0].sequence {
                return Err(ReaderError::NotMonotonic {
                    prev: window[0].sequence,
                    current: window[1].sequence,
                });
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64) -> WalEntry {
        WalEntry::new(seq, 1_000 * seq as i64, "delete".into(), format!(r#"{{"id":"t{seq}"}}"#).into_bytes())
    }

    fn log_bytes(count: u64) -> Vec<u8> {
        (1..=count).flat_map(|s| entry(s).to_bytes()).collect()
    }

    #[test]
    fn test_sequential_read() {
        let mut reader = WalReader::from_bytes(log_bytes(50));
        let entries = reader.read_all().unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(reader.last_sequence(), Some(50));
        assert_eq!(reader.current_offset() as usize, log_bytes(50).len());
    }

    #[test]
    fn test_checksum_mismatch_is_reported() {
        let mut data = log_bytes(3);
        // Payload starts at byte 32 (4 + 8 + 8 + 2 + "delete" + 4).
        data[34] ^= 0xFF;
        let mut reader = WalReader::from_bytes(data);
        match reader.read_all() {
            Err(ReaderError::ChecksumMismatch { offset, sequence }) => {
                assert_eq!(offset, 0);
                assert_eq!(sequence, 1);
            }
            other => panic!("expected checksum mismatch, got {:?}", other.map(|e| e.len())),
        }
    }

    #[test]
    fn test_recovery_skips_bad_frame_and_keeps_rest() {
        let mut data = log_bytes(5);
        let frame_len = entry(1).to_bytes().len();
        // Corrupt the payload of the second frame.
        data[frame_len + 34] ^= 0xFF;

        let mut reader = WalReader::from_bytes(data);
        let (entries, corruption) = reader.recover_entries();
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 3, 4, 5]);
        assert_eq!(corruption.len(), 1);
        assert_eq!(corruption[0].kind, CorruptionKind::ChecksumMismatch);
        assert_eq!(corruption[0].byte_offset, frame_len as u64);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let mut data = log_bytes(4);
        let partial = entry(5).to_bytes();
        data.extend_from_slice(&partial[..partial.len() / 2]);

        let mut reader = WalReader::from_bytes(data);
        let (entries, corruption) = reader.recover_entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(corruption.len(), 1);
        assert_eq!(corruption[0].kind, CorruptionKind::TruncatedEntry);
    }

    #[test]
    fn test_empty_log() {
        let mut reader = WalReader::from_bytes(Vec::new());
        assert!(reader.read_all().unwrap().is_empty());
        assert!(reader.corruption_log().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut reader = WalReader::open(&tmp.path().join("absent.log")).await.unwrap();
        assert!(reader.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_validate_sequences_allows_gaps() {
        let entries = vec![entry(1), entry(4), entry(9)];
        assert!(WalReader::validate_sequences(&entries).is_ok());

        let entries = vec![entry(2), entry(2)];
        assert!(matches!(
            WalReader::validate_sequences(&entries),
            Err(ReaderError::NotMonotonic { prev: 2, current: 2 })
        ));
    }
}
