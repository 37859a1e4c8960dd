//! Fragment Placement and Supplier Family
//!
//! Decides which peer holds which fragment slot. A family is an ordered
//! list of `D+P` suppliers; fragment `(kind, index)` of every block goes to
//! position `index` (Data) or `D + index` (Parity).
//!
//! - `supplier.rs`: supplier state machine and health thresholds
//! - `family.rs`: ordered supplier list for one scope
//! - `manager.rs`: hire, replace, switch, resize, identity rotation and
//!   persistence of `families.db`

pub mod family;
pub mod manager;
pub mod supplier;

pub use family::{SupplierFamily, DEFAULT_SCOPE};
pub use manager::{FamilyManager, PlacementConfig};
pub use supplier::{HealthPolicy, Supplier, SupplierState};
