//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! The core depends on three external collaborators: a transport that
//! moves fragments between peers, a DHT used for supplier discovery and
//! identity rotation, and an event sink. Adapters implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │       Transport  │  Dht  │  EventPublisher           │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  InMemoryTransport │ DirectoryTransport │ StaticDht │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::events::DomainEvent;

// =============================================================================
// Value Objects
// =============================================================================

/// Stable identifier of a remote peer (value object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one backup, a sequence of blocks from one source stream.
///
/// Appears verbatim as the first component of every fragment name, so it
/// may not contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(pub String);

impl BackupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh identifier: UTC timestamp plus a short random suffix
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("F{}-{}", stamp, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains('/')
    }
}

impl std::fmt::Display for BackupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BackupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BackupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Transport Port
// =============================================================================

/// Authenticated, ordered delivery of fragments to a peer.
///
/// `send` resolves once the remote peer acknowledged the fragment.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Store `bytes` under `name` on `peer`, returning after the ack.
    async fn send(&self, peer: &PeerId, name: &str, bytes: Bytes) -> Result<()>;

    /// Retrieve a fragment previously stored on `peer`.
    ///
    /// Returns `Error::FragmentNotFound` if the peer does not hold it.
    async fn fetch(&self, peer: &PeerId, name: &str) -> Result<Bytes>;

    /// Reachability probe.
    async fn ping(&self, peer: &PeerId) -> Result<()>;

    /// Ask `peer` to drop a fragment.
    async fn delete(&self, peer: &PeerId, name: &str) -> Result<()>;
}

// =============================================================================
// DHT Port
// =============================================================================

/// DHT key listing peers that offer storage
pub const SUPPLIERS_KEY: &str = "suppliers/available";

/// Prefix of the keys peers publish their current identifier under
pub const IDENTITY_PREFIX: &str = "identity/";

/// Eventually consistent key→values store with TTLs.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Publish a value under a key for `ttl`.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// All live values under a key.
    async fn get(&self, key: &str) -> Result<Vec<String>>;

    /// Current peer identifier published under a logical identity.
    async fn observe(&self, nickname: &str) -> Result<Option<PeerId>>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}
