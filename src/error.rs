//! Error types for raidmesh

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while backing up, restoring or maintaining suppliers
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// The operation was cancelled before it finished
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // ECC Map / Codec Errors
    // =========================================================================
    /// No scheme is registered under this name
    #[error("Unknown ECC map: {0}")]
    UnknownMap(String),

    /// A scheme definition violates its structural invariants
    #[error("Invalid ECC map {name}: {reason}")]
    InvalidEccMap { name: String, reason: String },

    /// Fragment sizes or slot counts disagree
    #[error("Fragment shape mismatch for {backup_id} block {block_number}: {reason}")]
    Shape {
        backup_id: String,
        block_number: u64,
        reason: String,
    },

    /// Not enough surviving fragments to rebuild the block
    #[error("Block {block_number} of backup {backup_id} is unrecoverable: missing data fragments {missing:?}")]
    Unrecoverable {
        backup_id: String,
        block_number: u64,
        missing: Vec<usize>,
    },

    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    /// Sealing a block failed
    #[error("Encryption failed for {backup_id} block {block_number}")]
    Encryption { backup_id: String, block_number: u64 },

    /// A block did not authenticate under the master key
    #[error("Decryption failed for {backup_id} block {block_number}")]
    Decryption { backup_id: String, block_number: u64 },

    /// Block numbering is not dense or the stream ended early
    #[error("Block sequence gap in {backup_id}: expected block {expected}, {found}")]
    BlockGap {
        backup_id: String,
        expected: u64,
        found: String,
    },

    // =========================================================================
    // Worker Pool Errors
    // =========================================================================
    /// A worker died while running the job
    #[error("Worker crashed while running task {task_id}: {reason}")]
    WorkerCrashed { task_id: u64, reason: String },

    // =========================================================================
    // Transfer / Placement Errors
    // =========================================================================
    /// Exhausted retries against a peer
    #[error("Peer {peer} unreachable after {attempts} attempts: {reason}")]
    PeerUnreachable {
        peer: String,
        attempts: u32,
        reason: String,
    },

    /// An exchange or block did not finish in time
    #[error("Timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// The remote holder does not have the fragment
    #[error("Fragment {0} not found on supplier")]
    FragmentNotFound(String),

    /// No replacement peer could be found
    #[error("No candidate supplier available: {0}")]
    NoCandidate(String),

    // =========================================================================
    // Directory Index Errors
    // =========================================================================
    /// The on-disk index cannot be trusted
    #[error("Directory index corrupt: {0}")]
    IndexCorrupt(String),

    /// Backup is not present in the index
    #[error("Unknown backup: {0}")]
    UnknownBackup(String),
}

impl Error {
    /// Process exit code for the operational command surface
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_)
            | Error::Yaml(_)
            | Error::DurationParse(_)
            | Error::UnknownMap(_)
            | Error::InvalidEccMap { .. } => 2,
            Error::Unrecoverable { .. }
            | Error::Shape { .. }
            | Error::Decryption { .. }
            | Error::BlockGap { .. } => 4,
            Error::Internal(_) | Error::WorkerCrashed { .. } | Error::IndexCorrupt(_) => 5,
            _ => 3,
        }
    }

    /// Whether retrying the same exchange later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PeerUnreachable { .. } | Error::Timeout { .. } | Error::Io(_)
        )
    }

    /// Build an unrecoverable-block error
    pub fn unrecoverable(backup_id: impl Into<String>, block_number: u64, missing: Vec<usize>) -> Self {
        Error::Unrecoverable {
            backup_id: backup_id.into(),
            block_number,
            missing,
        }
    }
}
