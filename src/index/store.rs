//! Directory index store
//!
//! In-memory view of every backup, persisted as a JSON snapshot
//! (`manifests.db`) plus the write-ahead log (`manifests.db-wal`). Every
//! mutation is validated, appended to the log, and only then applied.
//! Not thread-safe by itself: the index actor is its only owner.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::manifest::{BackupRecord, BlockManifest, FragmentState};
use super::wal::{Wal, WalEntry, WalRecord};
use super::IndexConfig;
use crate::domain::ports::{BackupId, PeerId};
use crate::error::{Error, Result};

pub const SNAPSHOT_FILE: &str = "manifests.db";
pub const WAL_FILE: &str = "manifests.db-wal";

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    version: u32,
    /// Sequence number of the last log entry folded into this snapshot
    last_seq: u64,
    backups: BTreeMap<BackupId, BackupRecord>,
}

/// Listing entry: a backup without its manifests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub backup_id: BackupId,
    pub path: String,
    pub ecc_map: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub blocks: u64,
    pub bytes: u64,
    pub stored: usize,
    pub pending: usize,
    pub lost: usize,
}

impl From<&BackupRecord> for BackupSummary {
    fn from(record: &BackupRecord) -> Self {
        Self {
            backup_id: record.backup_id.clone(),
            path: record.path.clone(),
            ecc_map: record.ecc_map.clone(),
            created_at: record.created_at,
            finished_at: record.finished_at,
            blocks: record.blocks,
            bytes: record.bytes,
            stored: record.count(FragmentState::Stored),
            pending: record.count(FragmentState::Pending),
            lost: record.count(FragmentState::Lost),
        }
    }
}

#[derive(Debug)]
pub struct DirectoryIndex {
    dir: PathBuf,
    wal: Wal,
    checkpoint_every: usize,
    last_seq: u64,
    backups: BTreeMap<BackupId, BackupRecord>,
    by_path: BTreeMap<String, Vec<BackupId>>,
}

impl DirectoryIndex {
    /// Load the snapshot and replay the log
    #[instrument(skip_all, fields(dir = %config.dir.display()))]
    pub fn open(config: &IndexConfig) -> Result<Self> {
        if config.checkpoint_every == 0 {
            return Err(Error::Config("index checkpoint interval must be positive".into()));
        }
        std::fs::create_dir_all(&config.dir)?;

        let snapshot = load_snapshot(&config.dir.join(SNAPSHOT_FILE))?;
        let (wal, entries) = Wal::open(config.dir.join(WAL_FILE))?;

        let mut index = Self {
            dir: config.dir.clone(),
            wal,
            checkpoint_every: config.checkpoint_every,
            last_seq: snapshot.last_seq,
            backups: snapshot.backups,
            by_path: BTreeMap::new(),
        };
        for record in index.backups.values() {
            index
                .by_path
                .entry(record.path.clone())
                .or_default()
                .push(record.backup_id.clone());
        }

        let mut replayed = 0usize;
        for entry in entries {
            if entry.seq <= index.last_seq {
                // already folded into the snapshot
                continue;
            }
            if entry.seq != index.last_seq + 1 {
                return Err(Error::IndexCorrupt(format!(
                    "write-ahead log jumps from entry {} to {}",
                    index.last_seq, entry.seq
                )));
            }
            index.check(&entry.record).map_err(|e| {
                Error::IndexCorrupt(format!("entry {} does not apply: {}", entry.seq, e))
            })?;
            index.apply(entry.record);
            index.last_seq = entry.seq;
            replayed += 1;
        }

        info!(
            backups = index.backups.len(),
            replayed,
            "Directory index loaded"
        );
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub fn create_backup(&mut self, record: BackupRecord) -> Result<()> {
        self.commit(WalRecord::CreateBackup { record })
    }

    pub fn record_manifest(&mut self, backup_id: &BackupId, manifest: BlockManifest) -> Result<()> {
        self.commit(WalRecord::RecordManifest {
            backup_id: backup_id.clone(),
            manifest,
        })
    }

    pub fn mark_stored(
        &mut self,
        backup_id: &BackupId,
        block_number: u64,
        position: usize,
        peer_id: PeerId,
    ) -> Result<()> {
        self.commit(WalRecord::MarkStored {
            backup_id: backup_id.clone(),
            block_number,
            position,
            peer_id,
        })
    }

    pub fn mark_lost(&mut self, backup_id: &BackupId, block_number: u64, position: usize) -> Result<()> {
        self.commit(WalRecord::MarkLost {
            backup_id: backup_id.clone(),
            block_number,
            position,
        })
    }

    pub fn finish_backup(&mut self, backup_id: &BackupId, blocks: u64, bytes: u64) -> Result<()> {
        self.commit(WalRecord::FinishBackup {
            backup_id: backup_id.clone(),
            blocks,
            bytes,
            finished_at: Utc::now(),
        })
    }

    /// Drop a backup and all its manifests
    pub fn forget_backup(&mut self, backup_id: &BackupId) -> Result<()> {
        self.commit(WalRecord::ForgetBackup {
            backup_id: backup_id.clone(),
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn backup(&self, backup_id: &BackupId) -> Option<&BackupRecord> {
        self.backups.get(backup_id)
    }

    pub fn list_backups(&self) -> Vec<BackupSummary> {
        let mut list: Vec<BackupSummary> = self.backups.values().map(BackupSummary::from).collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        list
    }

    /// Backups of one logical path, oldest first
    pub fn backups_for_path(&self, path: &str) -> Vec<BackupId> {
        self.by_path.get(path).cloned().unwrap_or_default()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Rewrite the snapshot and empty the log
    #[instrument(skip(self), fields(records = self.wal.len()))]
    pub fn checkpoint(&mut self) -> Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            last_seq: self.last_seq,
            backups: self.backups.clone(),
        };
        let path = self.dir.join(SNAPSHOT_FILE);
        let tmp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        {
            let mut file = std::fs::File::create(&tmp)?;
            serde_json::to_writer(&mut file, &snapshot)?;
            file.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        if let Ok(dir) = std::fs::File::open(&self.dir) {
            dir.sync_all()?;
        }
        self.wal.truncate()?;
        debug!(last_seq = self.last_seq, "Directory index checkpointed");
        Ok(())
    }

    /// Validate, log, apply
    fn commit(&mut self, record: WalRecord) -> Result<()> {
        if self.is_noop(&record) {
            return Ok(());
        }
        self.check(&record)?;
        let entry = WalEntry {
            seq: self.last_seq + 1,
            record,
        };
        self.wal.append(&entry)?;
        self.last_seq = entry.seq;
        self.apply(entry.record);

        // The entry is durable in the log either way; a failed checkpoint is
        // retried on the next commit.
        if self.wal.len() >= self.checkpoint_every {
            if let Err(e) = self.checkpoint() {
                warn!(error = %e, records = self.wal.len(), "Checkpoint failed");
            }
        }
        Ok(())
    }

    fn is_noop(&self, record: &WalRecord) -> bool {
        match record {
            WalRecord::MarkStored {
                backup_id,
                block_number,
                position,
                peer_id,
            } => self
                .fragment_state(backup_id, *block_number, *position)
                .is_some_and(|(state, peer)| state == FragmentState::Stored && peer == peer_id),
            WalRecord::MarkLost {
                backup_id,
                block_number,
                position,
            } => self
                .fragment_state(backup_id, *block_number, *position)
                .is_some_and(|(state, _)| state == FragmentState::Lost),
            _ => false,
        }
    }

    fn fragment_state(
        &self,
        backup_id: &BackupId,
        block_number: u64,
        position: usize,
    ) -> Option<(FragmentState, &PeerId)> {
        self.backups
            .get(backup_id)?
            .manifest(block_number)?
            .fragment(position)
            .map(|f| (f.state, &f.peer_id))
    }

    fn known(&self, backup_id: &BackupId) -> Result<&BackupRecord> {
        self.backups
            .get(backup_id)
            .ok_or_else(|| Error::UnknownBackup(backup_id.to_string()))
    }

    fn check(&self, record: &WalRecord) -> Result<()> {
        match record {
            WalRecord::CreateBackup { record } => {
                if !record.backup_id.is_valid() {
                    return Err(Error::Config(format!("invalid backup id {:?}", record.backup_id.as_str())));
                }
                if self.backups.contains_key(&record.backup_id) {
                    return Err(Error::Internal(format!("backup {} already exists", record.backup_id)));
                }
                if !record.manifests.is_empty() || record.is_complete() {
                    return Err(Error::Internal(format!(
                        "backup {} must start empty",
                        record.backup_id
                    )));
                }
                Ok(())
            }
            WalRecord::RecordManifest { backup_id, manifest } => {
                let backup = self.known(backup_id)?;
                if backup.is_complete() {
                    return Err(Error::Internal(format!("backup {} is finished", backup_id)));
                }
                if backup.manifests.contains_key(&manifest.block_number) {
                    return Err(Error::Internal(format!(
                        "manifest for block {} of backup {} already recorded",
                        manifest.block_number, backup_id
                    )));
                }
                let map = crate::ec::lookup(&backup.ecc_map)?;
                manifest.validate(&map)?;
                if manifest
                    .fragments
                    .iter()
                    .any(|f| f.state != FragmentState::Pending)
                {
                    return Err(Error::Internal(format!(
                        "manifest for block {} must start pending",
                        manifest.block_number
                    )));
                }
                Ok(())
            }
            WalRecord::MarkStored {
                backup_id,
                block_number,
                position,
                ..
            } => self.check_transition(backup_id, *block_number, *position, FragmentState::Stored),
            WalRecord::MarkLost {
                backup_id,
                block_number,
                position,
            } => self.check_transition(backup_id, *block_number, *position, FragmentState::Lost),
            WalRecord::FinishBackup {
                backup_id, blocks, ..
            } => {
                let backup = self.known(backup_id)?;
                if backup.is_complete() {
                    return Err(Error::Internal(format!("backup {} already finished", backup_id)));
                }
                let dense = backup
                    .manifests
                    .keys()
                    .copied()
                    .eq(0..*blocks);
                if !dense {
                    return Err(Error::BlockGap {
                        backup_id: backup_id.to_string(),
                        expected: *blocks,
                        found: format!("{} manifests recorded", backup.manifests.len()),
                    });
                }
                Ok(())
            }
            WalRecord::ForgetBackup { backup_id } => self.known(backup_id).map(|_| ()),
        }
    }

    fn check_transition(
        &self,
        backup_id: &BackupId,
        block_number: u64,
        position: usize,
        next: FragmentState,
    ) -> Result<()> {
        let manifest = self.known(backup_id)?.manifest(block_number).ok_or_else(|| {
            Error::Internal(format!(
                "no manifest for block {} of backup {}",
                block_number, backup_id
            ))
        })?;
        let fragment = manifest.fragment(position).ok_or_else(|| {
            Error::Internal(format!(
                "no position {} in block {} of backup {}",
                position, block_number, backup_id
            ))
        })?;
        if !fragment.state.can_become(next) {
            return Err(Error::Internal(format!(
                "fragment {} cannot go from {} to {}",
                fragment.name(backup_id, block_number),
                fragment.state,
                next
            )));
        }
        Ok(())
    }

    /// Only called on checked records
    fn apply(&mut self, record: WalRecord) {
        match record {
            WalRecord::CreateBackup { record } => {
                self.by_path
                    .entry(record.path.clone())
                    .or_default()
                    .push(record.backup_id.clone());
                self.backups.insert(record.backup_id.clone(), record);
            }
            WalRecord::RecordManifest { backup_id, manifest } => {
                if let Some(backup) = self.backups.get_mut(&backup_id) {
                    backup.manifests.insert(manifest.block_number, manifest);
                }
            }
            WalRecord::MarkStored {
                backup_id,
                block_number,
                position,
                peer_id,
            } => {
                if let Some(fragment) = self.fragment_mut(&backup_id, block_number, position) {
                    fragment.state = FragmentState::Stored;
                    fragment.peer_id = peer_id;
                }
            }
            WalRecord::MarkLost {
                backup_id,
                block_number,
                position,
            } => {
                if let Some(fragment) = self.fragment_mut(&backup_id, block_number, position) {
                    fragment.state = FragmentState::Lost;
                }
            }
            WalRecord::FinishBackup {
                backup_id,
                blocks,
                bytes,
                finished_at,
            } => {
                if let Some(backup) = self.backups.get_mut(&backup_id) {
                    backup.blocks = blocks;
                    backup.bytes = bytes;
                    backup.finished_at = Some(finished_at);
                }
            }
            WalRecord::ForgetBackup { backup_id } => {
                if let Some(record) = self.backups.remove(&backup_id) {
                    if let Some(ids) = self.by_path.get_mut(&record.path) {
                        ids.retain(|id| id != &backup_id);
                        if ids.is_empty() {
                            self.by_path.remove(&record.path);
                        }
                    }
                }
            }
        }
    }

    fn fragment_mut(
        &mut self,
        backup_id: &BackupId,
        block_number: u64,
        position: usize,
    ) -> Option<&mut super::manifest::FragmentRecord> {
        self.backups
            .get_mut(backup_id)?
            .manifests
            .get_mut(&block_number)?
            .fragment_mut(position)
    }
}

fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Snapshot {
                version: SNAPSHOT_VERSION,
                ..Snapshot::default()
            })
        }
        Err(e) => return Err(e.into()),
    };
    let snapshot: Snapshot = serde_json::from_slice(&raw)
        .map_err(|e| Error::IndexCorrupt(format!("{}: {}", path.display(), e)))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(Error::IndexCorrupt(format!(
            "{}: unsupported snapshot version {}",
            path.display(),
            snapshot.version
        )));
    }
    Ok(snapshot)
}
