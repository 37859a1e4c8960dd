//! Manifest records
//!
//! A backup record lists, per block, which peer holds each of the `D + P`
//! fragment positions and whether the fragment is known to be there.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ports::{BackupId, PeerId};
use crate::ec::EccMap;
use crate::error::{Error, Result};
use crate::pipeline::fragment::kind_at;
use crate::pipeline::{ContentHash, FragmentKind, FragmentName};

// =============================================================================
// Fragment State
// =============================================================================

/// Lifecycle of one placed fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentState {
    /// Sent or about to be sent, not yet acknowledged
    Pending,
    /// Acknowledged by the holder
    Stored,
    /// Known to be gone from the holder
    Lost,
}

impl FragmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentState::Pending => "Pending",
            FragmentState::Stored => "Stored",
            FragmentState::Lost => "Lost",
        }
    }

    /// Allowed transitions; `Lost -> Stored` happens on rebuild
    pub fn can_become(self, next: FragmentState) -> bool {
        use FragmentState::*;
        matches!(
            (self, next),
            (Pending, Stored) | (Pending, Lost) | (Stored, Lost) | (Lost, Stored) | (Stored, Stored)
        )
    }
}

impl std::fmt::Display for FragmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Fragment Record
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentRecord {
    pub position: usize,
    pub kind: FragmentKind,
    pub index: usize,
    pub peer_id: PeerId,
    pub content_hash: ContentHash,
    pub state: FragmentState,
}

impl FragmentRecord {
    pub fn pending(position: usize, data_fragments: usize, peer_id: PeerId, content_hash: ContentHash) -> Self {
        let (kind, index) = kind_at(position, data_fragments);
        Self {
            position,
            kind,
            index,
            peer_id,
            content_hash,
            state: FragmentState::Pending,
        }
    }

    pub fn name(&self, backup_id: &BackupId, block_number: u64) -> FragmentName {
        FragmentName::new(backup_id.clone(), block_number, self.kind, self.index)
    }
}

// =============================================================================
// Block Manifest
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockManifest {
    pub block_number: u64,
    /// Size of every wire fragment of this block
    pub fragment_size: usize,
    /// One record per position, ordered by position
    pub fragments: Vec<FragmentRecord>,
}

impl BlockManifest {
    pub fn fragment(&self, position: usize) -> Option<&FragmentRecord> {
        self.fragments.get(position).filter(|f| f.position == position)
    }

    pub(crate) fn fragment_mut(&mut self, position: usize) -> Option<&mut FragmentRecord> {
        self.fragments
            .get_mut(position)
            .filter(|f| f.position == position)
    }

    /// Positions whose fragment is acknowledged
    pub fn stored(&self) -> Vec<bool> {
        self.fragments
            .iter()
            .map(|f| f.state == FragmentState::Stored)
            .collect()
    }

    pub fn count(&self, state: FragmentState) -> usize {
        self.fragments.iter().filter(|f| f.state == state).count()
    }

    /// Whether the acknowledged fragments are enough to decode the block
    pub fn is_recoverable(&self, map: &EccMap) -> bool {
        let stored = self.stored();
        let d = map.data_fragments();
        stored.len() == map.total_fragments() && map.is_fixable(&stored[..d], &stored[d..])
    }

    /// Structural checks against the backup's scheme
    pub fn validate(&self, map: &EccMap) -> Result<()> {
        let invalid = |reason: String| {
            Error::Internal(format!(
                "manifest for block {}: {}",
                self.block_number, reason
            ))
        };
        if self.fragments.len() != map.total_fragments() {
            return Err(invalid(format!(
                "{} fragment records, scheme {} needs {}",
                self.fragments.len(),
                map.name(),
                map.total_fragments()
            )));
        }
        if self.fragment_size == 0 {
            return Err(invalid("fragment size must be positive".into()));
        }
        for (position, record) in self.fragments.iter().enumerate() {
            let expected = kind_at(position, map.data_fragments());
            if record.position != position || (record.kind, record.index) != expected {
                return Err(invalid(format!("record out of place at position {}", position)));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Backup Record
// =============================================================================

/// Everything the index knows about one backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub backup_id: BackupId,
    /// Logical path the backup was taken of
    pub path: String,
    pub ecc_map: String,
    /// Plaintext bytes per data fragment; with the map this fixes the block layout
    pub fragment_size: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub blocks: u64,
    pub bytes: u64,
    #[serde(default)]
    pub manifests: BTreeMap<u64, BlockManifest>,
}

impl BackupRecord {
    pub fn new(backup_id: BackupId, path: impl Into<String>, ecc_map: impl Into<String>, fragment_size: usize) -> Self {
        Self {
            backup_id,
            path: path.into(),
            ecc_map: ecc_map.into(),
            fragment_size,
            created_at: Utc::now(),
            finished_at: None,
            blocks: 0,
            bytes: 0,
            manifests: BTreeMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn manifest(&self, block_number: u64) -> Option<&BlockManifest> {
        self.manifests.get(&block_number)
    }

    pub fn count(&self, state: FragmentState) -> usize {
        self.manifests.values().map(|m| m.count(state)).sum()
    }

    /// Distinct peers holding any fragment of this backup
    pub fn holders(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .manifests
            .values()
            .flat_map(|m| m.fragments.iter().map(|f| f.peer_id.clone()))
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::lookup;

    fn manifest(map: &EccMap) -> BlockManifest {
        BlockManifest {
            block_number: 0,
            fragment_size: 16,
            fragments: (0..map.total_fragments())
                .map(|pos| {
                    FragmentRecord::pending(
                        pos,
                        map.data_fragments(),
                        PeerId::from(format!("peer-{}", pos)),
                        ContentHash::of(&[pos as u8]),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_state_transitions() {
        use FragmentState::*;
        assert!(Pending.can_become(Stored));
        assert!(Pending.can_become(Lost));
        assert!(Stored.can_become(Lost));
        assert!(Lost.can_become(Stored));
        assert!(!Stored.can_become(Pending));
        assert!(!Lost.can_become(Pending));
    }

    #[test]
    fn test_record_kinds_follow_position() {
        let map = lookup("ecc/4x4").unwrap();
        let m = manifest(&map);
        m.validate(&map).unwrap();
        assert_eq!(m.fragments[3].kind, FragmentKind::Data);
        assert_eq!(m.fragments[4].kind, FragmentKind::Parity);
        assert_eq!(m.fragments[4].index, 0);
        assert_eq!(
            m.fragments[5].name(&BackupId::from("F1"), 0).to_string(),
            "F1/0-1-Parity"
        );
    }

    #[test]
    fn test_validate_rejects_wrong_count() {
        let map = lookup("ecc/4x4").unwrap();
        let mut m = manifest(&map);
        m.fragments.pop();
        assert!(m.validate(&map).is_err());
    }

    #[test]
    fn test_recoverable_needs_covering_set() {
        let map = lookup("ecc/2x2").unwrap();
        let mut m = manifest(&map);
        assert!(!m.is_recoverable(&map));
        for record in m.fragments.iter_mut() {
            record.state = FragmentState::Stored;
        }
        assert!(m.is_recoverable(&map));
        m.fragments[0].state = FragmentState::Lost;
        assert!(m.is_recoverable(&map));
        // parity 1 is the only copy of data 0
        m.fragments[3].state = FragmentState::Lost;
        assert!(!m.is_recoverable(&map));
    }

    #[test]
    fn test_backup_record_json_is_camel_case() {
        let record = BackupRecord::new(BackupId::from("F1"), "/home/a", "ecc/4x4", 64);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"eccMap\":\"ecc/4x4\""));
        assert!(json.contains("\"finishedAt\":null"));
        let back: BackupRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
