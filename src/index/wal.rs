//! Write-ahead log
//!
//! One record per line: a 16 hex digit checksum (first 8 bytes of the
//! BLAKE3 digest of the JSON), a space, and the JSON entry. Every append
//! is synced before it returns.
//!
//! On open, a torn or garbled final record is cut off the file. A bad
//! record followed by good ones means the log was damaged rather than
//! interrupted, and opening fails with `IndexCorrupt`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::manifest::{BackupRecord, BlockManifest};
use crate::domain::ports::{BackupId, PeerId};
use crate::error::{Error, Result};

const CHECKSUM_HEX_LEN: usize = 16;

/// One index mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WalRecord {
    #[serde(rename_all = "camelCase")]
    CreateBackup { record: BackupRecord },

    #[serde(rename_all = "camelCase")]
    RecordManifest {
        backup_id: BackupId,
        manifest: BlockManifest,
    },

    #[serde(rename_all = "camelCase")]
    MarkStored {
        backup_id: BackupId,
        block_number: u64,
        position: usize,
        peer_id: PeerId,
    },

    #[serde(rename_all = "camelCase")]
    MarkLost {
        backup_id: BackupId,
        block_number: u64,
        position: usize,
    },

    #[serde(rename_all = "camelCase")]
    FinishBackup {
        backup_id: BackupId,
        blocks: u64,
        bytes: u64,
        finished_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    ForgetBackup { backup_id: BackupId },
}

impl WalRecord {
    pub fn backup_id(&self) -> &BackupId {
        match self {
            WalRecord::CreateBackup { record } => &record.backup_id,
            WalRecord::RecordManifest { backup_id, .. }
            | WalRecord::MarkStored { backup_id, .. }
            | WalRecord::MarkLost { backup_id, .. }
            | WalRecord::FinishBackup { backup_id, .. }
            | WalRecord::ForgetBackup { backup_id } => backup_id,
        }
    }
}

/// A record with its position in the log's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub record: WalRecord,
}

fn checksum(json: &[u8]) -> String {
    hex::encode(&blake3::hash(json).as_bytes()[..CHECKSUM_HEX_LEN / 2])
}

/// Serialize an entry as one log line, newline included
pub fn encode_line(entry: &WalEntry) -> Result<String> {
    let json = serde_json::to_string(entry)?;
    Ok(format!("{} {}\n", checksum(json.as_bytes()), json))
}

/// Parse one line (without its newline); `None` if damaged
pub fn decode_line(line: &[u8]) -> Option<WalEntry> {
    if line.len() <= CHECKSUM_HEX_LEN + 1 || line[CHECKSUM_HEX_LEN] != b' ' {
        return None;
    }
    let (sum, json) = (&line[..CHECKSUM_HEX_LEN], &line[CHECKSUM_HEX_LEN + 1..]);
    if sum != checksum(json).as_bytes() {
        return None;
    }
    serde_json::from_slice(json).ok()
}

#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    records: usize,
    /// Length of the file up to the last complete record
    end: u64,
}

impl Wal {
    /// Open (creating if needed) and return the intact entries
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<WalEntry>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut entries = Vec::new();
        let mut valid_len = 0usize;
        let mut damaged_at: Option<usize> = None;
        let mut offset = 0usize;

        while offset < raw.len() {
            let Some(newline) = raw[offset..].iter().position(|&b| b == b'\n') else {
                // unterminated tail
                break;
            };
            let line = &raw[offset..offset + newline];
            match decode_line(line) {
                Some(entry) if damaged_at.is_none() => {
                    entries.push(entry);
                    valid_len = offset + newline + 1;
                }
                Some(_) => {
                    let at = damaged_at.unwrap_or(offset);
                    return Err(Error::IndexCorrupt(format!(
                        "{}: damaged record at byte {} followed by intact records",
                        path.display(),
                        at
                    )));
                }
                None => {
                    damaged_at.get_or_insert(offset);
                }
            }
            offset += newline + 1;
        }

        if valid_len < raw.len() {
            warn!(
                path = %path.display(),
                discarded = raw.len() - valid_len,
                "Discarding torn write-ahead log tail"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        debug!(path = %path.display(), records = entries.len(), "Write-ahead log opened");
        let records = entries.len();
        Ok((
            Self {
                path,
                file,
                records,
                end: valid_len as u64,
            },
            entries,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended since the last truncation
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Append and sync one entry. A failed append is cut back off the
    /// file so the next record starts on a clean line.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let line = encode_line(entry)?;
        // residue of an earlier append whose rollback also failed
        if self.file.metadata()?.len() != self.end {
            self.rollback()?;
        }
        let written = self
            .file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "Write-ahead log append failed");
            if let Err(rollback) = self.rollback() {
                warn!(path = %self.path.display(), error = %rollback, "Could not cut back the failed append");
            }
            return Err(e.into());
        }
        self.end += line.len() as u64;
        self.records += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.file.set_len(self.end)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Drop every record; called once a snapshot covers them
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.records = 0;
        self.end = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry(seq: u64) -> WalEntry {
        WalEntry {
            seq,
            record: WalRecord::MarkLost {
                backup_id: BackupId::from("F1"),
                block_number: seq,
                position: 2,
            },
        }
    }

    #[test]
    fn test_line_format() {
        let line = encode_line(&entry(1)).unwrap();
        assert!(line.ends_with('\n'));
        let (sum, json) = line.trim_end().split_once(' ').unwrap();
        assert_eq!(sum.len(), 16);
        assert!(json.contains("\"op\":\"markLost\""));
        assert_eq!(decode_line(line.trim_end().as_bytes()), Some(entry(1)));
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let line = encode_line(&entry(1)).unwrap();
        let tampered = line.trim_end().replace("\"position\":2", "\"position\":3");
        assert_eq!(decode_line(tampered.as_bytes()), None);
        assert_eq!(decode_line(b"garbage"), None);
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests.db-wal");
        {
            let (mut wal, entries) = Wal::open(&path).unwrap();
            assert!(entries.is_empty());
            wal.append(&entry(1)).unwrap();
            wal.append(&entry(2)).unwrap();
            assert_eq!(wal.len(), 2);
        }
        let (wal, entries) = Wal::open(&path).unwrap();
        assert_eq!(entries, vec![entry(1), entry(2)]);
        assert_eq!(wal.len(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests.db-wal");
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&entry(1)).unwrap();
        }
        let intact = std::fs::metadata(&path).unwrap().len();
        let partial = encode_line(&entry(2)).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial.as_bytes()[..partial.len() / 2]).unwrap();
        drop(file);

        let (mut wal, entries) = Wal::open(&path).unwrap();
        assert_eq!(entries, vec![entry(1)]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);

        wal.append(&entry(3)).unwrap();
        drop(wal);
        let (_, entries) = Wal::open(&path).unwrap();
        assert_eq!(entries, vec![entry(1), entry(3)]);
    }

    #[test]
    fn test_garbled_last_line_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests.db-wal");
        let mut raw = encode_line(&entry(1)).unwrap();
        raw.push_str("0123456789abcdef {\"seq\":2}\n");
        std::fs::write(&path, raw).unwrap();

        let (_, entries) = Wal::open(&path).unwrap();
        assert_eq!(entries, vec![entry(1)]);
    }

    #[test]
    fn test_damage_in_the_middle_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests.db-wal");
        let mut raw = encode_line(&entry(1)).unwrap();
        raw.push_str("not a record\n");
        raw.push_str(&encode_line(&entry(2)).unwrap());
        std::fs::write(&path, raw).unwrap();

        assert_matches!(Wal::open(&path), Err(Error::IndexCorrupt(_)));
    }

    #[test]
    fn test_partial_append_is_cut_before_the_next_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests.db-wal");
        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append(&entry(1)).unwrap();
        let intact = std::fs::metadata(&path).unwrap().len();

        // half a line left behind by a write that failed part way
        let partial = encode_line(&entry(2)).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial.as_bytes()[..partial.len() / 2]).unwrap();
        drop(file);

        wal.append(&entry(2)).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            intact + partial.len() as u64
        );
        drop(wal);

        let (_, entries) = Wal::open(&path).unwrap();
        assert_eq!(entries, vec![entry(1), entry(2)]);
    }

    #[test]
    fn test_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests.db-wal");
        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append(&entry(1)).unwrap();
        wal.truncate().unwrap();
        assert!(wal.is_empty());
        wal.append(&entry(2)).unwrap();
        drop(wal);
        let (_, entries) = Wal::open(&path).unwrap();
        assert_eq!(entries, vec![entry(2)]);
    }
}
