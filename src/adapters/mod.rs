//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │         Transport │ Dht │ EventPublisher                   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryTransport │ InMemoryDht │ DirectoryTransport       │ │
//! │  │ StaticDht │ LoggingEventPublisher │ InMemoryEventCollector │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use raidmesh::adapters::DirectoryTransport;
//! use raidmesh::domain::ports::Transport;
//!
//! let transport = DirectoryTransport::new("/var/lib/raidmesh");
//! transport.send(&peer, "F1/0-0-Data", bytes).await?;
//! ```

mod event_publisher;
mod local_fs;
mod memory;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use local_fs::{DirectoryTransport, StaticDht};
pub use memory::{InMemoryDht, InMemoryTransport};
