//! Erasure Coding Module
//!
//! XOR erasure coding over declarative incidence maps.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Erasure Coding Module                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────┐         ┌───────────────────────────┐  │
//! │  │  ECC Map Registry │────────▶│      Fragment Codec       │  │
//! │  │  (parity ⇄ data)  │         │ (encode/decode/rebuild)   │  │
//! │  └───────────────────┘         └───────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **ECC Map Registry** (`eccmap.rs`): the built-in `ecc/NxN` schemes,
//!   validated at load, plus fixability analysis used by placement and
//!   restore to decide when enough fragments have arrived.
//!
//! - **Fragment Codec** (`codec.rs`): splits a sealed block into `D`
//!   data fragments, XORs the `P` parities, and iteratively recovers
//!   missing data (lowest eligible parity first).
//!
//! # Usage
//!
//! ```rust,ignore
//! use raidmesh::ec::{lookup, FragmentCodec};
//!
//! let codec = FragmentCodec::new(lookup("ecc/4x4")?);
//! let encoded = codec.encode(b"hello world\n", 4)?;
//!
//! let mut data: Vec<_> = encoded.data.iter().cloned().map(Some).collect();
//! let parity: Vec<_> = encoded.parity.iter().cloned().map(Some).collect();
//! data[0] = None;
//!
//! let recovered = codec.decode(data, parity)?;
//! assert_eq!(recovered, encoded.data);
//! ```

pub mod codec;
pub mod eccmap;

#[cfg(test)]
mod proptest;

pub use codec::{join, CodecError, EncodedBlock, FragmentCodec, RebuiltBlock};
pub use eccmap::{lookup, EccDescription, EccMap, EccRegistry, DEFAULT_MAP};
