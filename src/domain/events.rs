//! Domain Events
//!
//! Immutable records of things that happened to backups, blocks and
//! suppliers. Published through the `EventPublisher` port.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::SupplierReplaced {
//!     scope: "default".to_string(),
//!     position: 2,
//!     old_peer: "peer-2".to_string(),
//!     new_peer: "peer-9".to_string(),
//!     reason: "evicted".to_string(),
//!     timestamp: Utc::now(),
//! };
//!
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Backup Events
    // =========================================================================
    /// A backup started uploading.
    BackupStarted {
        backup_id: String,
        path: String,
        ecc_map: String,
        timestamp: DateTime<Utc>,
    },

    /// Every block of a backup is upload-complete.
    BackupCompleted {
        backup_id: String,
        blocks: u64,
        bytes: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A backup upload was abandoned.
    BackupFailed {
        backup_id: String,
        block_number: Option<u64>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A backup was restored to local storage.
    RestoreCompleted {
        backup_id: String,
        blocks: u64,
        bytes: u64,
        degraded_blocks: u64,
        timestamp: DateTime<Utc>,
    },

    /// A backup was removed from suppliers and the index.
    BackupForgotten {
        backup_id: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Block Events
    // =========================================================================
    /// Not enough fragments survive to rebuild a block.
    BlockUnrecoverable {
        backup_id: String,
        block_number: u64,
        missing: Vec<usize>,
        timestamp: DateTime<Utc>,
    },

    /// Missing fragments of a block were regenerated and re-placed.
    BlockRebuilt {
        backup_id: String,
        block_number: u64,
        positions: Vec<usize>,
        timestamp: DateTime<Utc>,
    },

    /// A stored fragment was found missing on its holder.
    FragmentLost {
        backup_id: String,
        block_number: u64,
        position: usize,
        peer: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Supplier Events
    // =========================================================================
    /// A supplier's health state changed.
    SupplierStateChanged {
        peer: String,
        position: usize,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },

    /// A family position got a new peer.
    SupplierReplaced {
        scope: String,
        position: usize,
        old_peer: String,
        new_peer: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A supplier published a rotated identifier.
    SupplierIdentityRotated {
        old_peer: String,
        new_peer: String,
        timestamp: DateTime<Utc>,
    },

    /// A family was re-hired under a different scheme.
    FamilyResized {
        scope: String,
        old_map: String,
        new_map: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Worker Events
    // =========================================================================
    /// A worker died while running a job.
    WorkerCrashed {
        task_id: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::BackupStarted { timestamp, .. }
            | DomainEvent::BackupCompleted { timestamp, .. }
            | DomainEvent::BackupFailed { timestamp, .. }
            | DomainEvent::RestoreCompleted { timestamp, .. }
            | DomainEvent::BackupForgotten { timestamp, .. }
            | DomainEvent::BlockUnrecoverable { timestamp, .. }
            | DomainEvent::BlockRebuilt { timestamp, .. }
            | DomainEvent::FragmentLost { timestamp, .. }
            | DomainEvent::SupplierStateChanged { timestamp, .. }
            | DomainEvent::SupplierReplaced { timestamp, .. }
            | DomainEvent::SupplierIdentityRotated { timestamp, .. }
            | DomainEvent::FamilyResized { timestamp, .. }
            | DomainEvent::WorkerCrashed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::BackupStarted { .. } => "BackupStarted",
            DomainEvent::BackupCompleted { .. } => "BackupCompleted",
            DomainEvent::BackupFailed { .. } => "BackupFailed",
            DomainEvent::RestoreCompleted { .. } => "RestoreCompleted",
            DomainEvent::BackupForgotten { .. } => "BackupForgotten",
            DomainEvent::BlockUnrecoverable { .. } => "BlockUnrecoverable",
            DomainEvent::BlockRebuilt { .. } => "BlockRebuilt",
            DomainEvent::FragmentLost { .. } => "FragmentLost",
            DomainEvent::SupplierStateChanged { .. } => "SupplierStateChanged",
            DomainEvent::SupplierReplaced { .. } => "SupplierReplaced",
            DomainEvent::SupplierIdentityRotated { .. } => "SupplierIdentityRotated",
            DomainEvent::FamilyResized { .. } => "FamilyResized",
            DomainEvent::WorkerCrashed { .. } => "WorkerCrashed",
        }
    }

    /// Get the backup ID if applicable.
    pub fn backup_id(&self) -> Option<&str> {
        match self {
            DomainEvent::BackupStarted { backup_id, .. }
            | DomainEvent::BackupCompleted { backup_id, .. }
            | DomainEvent::BackupFailed { backup_id, .. }
            | DomainEvent::RestoreCompleted { backup_id, .. }
            | DomainEvent::BackupForgotten { backup_id, .. }
            | DomainEvent::BlockUnrecoverable { backup_id, .. }
            | DomainEvent::BlockRebuilt { backup_id, .. }
            | DomainEvent::FragmentLost { backup_id, .. } => Some(backup_id),
            _ => None,
        }
    }
}
