//! Domain Layer
//!
//! Value objects, ports and events shared by every component.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Transport, DHT and event publisher traits
//! - **Events** (`events.rs`) - Domain events for audit and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use raidmesh::domain::ports::{PeerId, Transport};
//!
//! async fn store<T: Transport>(transport: &T, peer: &PeerId, name: &str, bytes: Bytes) -> Result<()> {
//!     transport.send(peer, name, bytes).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{BackupId, Dht, EventPublisher, PeerId, Transport, IDENTITY_PREFIX, SUPPLIERS_KEY};
