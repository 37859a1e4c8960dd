//! Block Pipeline
//!
//! Turns a plaintext stream into sealed, numbered blocks and back.
//!
//! ```text
//! upload:   AsyncRead ─▶ BlockChunker ─▶ PlainBlock ─▶ seal ─▶ SealedBlock ─▶ codec
//! download: codec ─▶ SealedBlock ─▶ open ─▶ PlainBlock ─▶ BlockSequencer ─▶ AsyncWrite
//! ```
//!
//! - `block.rs`: layout arithmetic, trailer framing, chunker and sequencer
//! - `crypto.rs`: master key and XChaCha20-Poly1305 block sealing
//! - `fragment.rs`: fragment names, kinds, positions and content hashes
//! - `spool.rs`: local copies of fragments awaiting acknowledgement

pub mod block;
pub mod crypto;
pub mod fragment;
pub mod spool;

pub use block::{BlockChunker, BlockLayout, BlockSequencer, PlainBlock, SealedBlock, TRAILER_SIZE};
pub use crypto::{BlockCipher, MasterKey};
pub use fragment::{ContentHash, Fragment, FragmentKind, FragmentName};
pub use spool::FragmentSpool;
