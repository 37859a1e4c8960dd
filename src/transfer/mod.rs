//! Transfer Scheduler
//!
//! Moves fragments between this node and its suppliers. Every exchange
//! runs under a per-peer and a global concurrency cap, is retried with
//! exponential backoff, and reports its outcome so Placement can track
//! supplier health.
//!
//! ```text
//!                 ┌──────────────┐  resolve(holder)   ┌───────────────┐
//! upload_block ──▶│  Scheduler   │───────────────────▶│ HolderResolver│
//! fetch_block  ──▶│  retry loop  │◀── report outcome ─│ (placement)   │
//!                 └──────┬───────┘                    └───────────────┘
//!                        │ per-peer + global permits
//!                        ▼
//!                    Transport
//! ```

pub mod scheduler;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::ports::PeerId;
use crate::error::{Error, Result};

pub use scheduler::{Ack, BlockFetch, BlockUploadReport, InboundFragment, OutboundFragment, TransferScheduler};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the transfer scheduler
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Concurrent exchanges with one peer
    pub per_peer_concurrency: usize,

    /// Concurrent exchanges overall
    pub total_concurrency: usize,

    /// First retry delay; doubles per failure
    pub initial_backoff: Duration,

    /// Retry delay cap
    pub max_backoff: Duration,

    /// Failed tries before a fragment is abandoned
    pub max_attempts: u32,

    /// Timeout of one transport call
    pub fragment_timeout: Duration,

    /// End-to-end timeout of one block
    pub block_timeout: Duration,

    /// Acknowledgements a block upload may miss and still complete
    pub upload_tolerance: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            per_peer_concurrency: 4,
            total_concurrency: 64,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300), // 5 minutes
            max_attempts: 6,
            fragment_timeout: Duration::from_secs(60),
            block_timeout: Duration::from_secs(600), // 10 minutes
            upload_tolerance: 0,
        }
    }
}

// =============================================================================
// Holders
// =============================================================================

/// Who a fragment is exchanged with
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Holder {
    /// Whoever holds this family position at the time of each attempt
    Slot { scope: String, position: usize },
    /// A peer recorded in a manifest
    Peer(PeerId),
}

/// Resolves holders to peers and receives exchange outcomes
#[async_trait]
pub trait HolderResolver: Send + Sync {
    /// Current peer for `holder`, with a token that is cancelled if the
    /// holder is reassigned while the exchange is in flight
    fn resolve(&self, holder: &Holder) -> Result<(PeerId, CancellationToken)>;

    async fn report_success(&self, holder: &Holder, peer: &PeerId);

    async fn report_failure(&self, holder: &Holder, peer: &PeerId, error: &Error);
}
