//! Backup Directory Index
//!
//! Persisted mapping from logical path to backups, and from
//! `(backupID, blockNumber)` to the block's fragment manifest.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  IndexCommand  ┌──────────────────────────────────┐
//! │ IndexHandle  │ ─────────────▶ │ raidmesh-index thread            │
//! │ (any task)   │ ◀───────────── │  DirectoryIndex                  │
//! └──────────────┘    oneshot     │   ├── manifests.db      snapshot │
//!                                 │   └── manifests.db-wal  log      │
//!                                 └──────────────────────────────────┘
//! ```
//!
//! A mutation is durable once its reply arrives.

pub mod actor;
pub mod manifest;
pub mod store;
pub mod wal;

use std::path::PathBuf;

pub use actor::{IndexCommand, IndexHandle};
pub use manifest::{BackupRecord, BlockManifest, FragmentRecord, FragmentState};
pub use store::{BackupSummary, DirectoryIndex};

/// Where the index lives and how often the log is folded into the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub dir: PathBuf,
    /// Log records between checkpoints
    pub checkpoint_every: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".raidmesh/index"),
            checkpoint_every: 1024,
        }
    }
}
