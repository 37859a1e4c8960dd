//! RaidMesh - Peer-to-Peer Erasure-Coded Backups
//!
//! Streams a file into fixed-size blocks, encrypts each block, splits it
//! into data and XOR parity fragments and places one fragment on each
//! member of a supplier family. Restores fetch just enough fragments to
//! decode every block, even with suppliers missing.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────── Engine ─────────────────────────┐
//!  backup ──────▶ │ pipeline ──▶ worker (ec codec) ──▶ transfer ──▶ peers   │
//!  restore ◀───── │ pipeline ◀── worker (ec codec) ◀── transfer ◀── peers   │
//!                 │                 │                      │                 │
//!                 │               index              placement             │
//!                 └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Transport, DHT and event publisher implementations
//! - [`config`] - YAML settings
//! - [`domain`] - Ports and domain events
//! - [`ec`] - ECC maps and the XOR fragment codec
//! - [`engine`] - Backup, restore, verify, rebuild, forget and migrate
//! - [`error`] - Error types and exit codes
//! - [`index`] - Persistent backup directory and fragment manifests
//! - [`metrics`] - Prometheus metrics
//! - [`pipeline`] - Block framing, encryption, fragment naming and spool
//! - [`placement`] - Supplier families, health and replacement
//! - [`transfer`] - Fragment exchange with retries and backoff
//! - [`worker`] - Thread pool running codec jobs

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ec;
pub mod engine;
pub mod error;
pub mod index;
pub mod metrics;
pub mod pipeline;
pub mod placement;
pub mod transfer;
pub mod worker;

// Re-export commonly used types
pub use config::Settings;
pub use domain::{BackupId, DomainEvent, PeerId};
pub use ec::{EccMap, EccRegistry, FragmentCodec};
pub use engine::{BackupOutcome, Engine, EngineConfig, RebuildReport, RestoreOutcome, VerifyReport};
pub use error::{Error, Result};
pub use pipeline::MasterKey;
