//! Block encryption
//!
//! Each block is sealed with XChaCha20-Poly1305 under the owner's master
//! key. A fresh random 24-byte nonce is prepended; the associated data
//! binds the ciphertext to its backup and block number so blocks cannot
//! be swapped between positions.

use std::fmt;
use std::path::Path;

use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::{rngs::OsRng, RngCore};

use crate::error::{Error, Result};

/// Master key length in bytes
pub const KEY_SIZE: usize = 32;
/// XChaCha20 nonce length
pub const NONCE_SIZE: usize = 24;
/// Poly1305 tag length
pub const TAG_SIZE: usize = 16;
/// Bytes added by sealing
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

// =============================================================================
// Master Key
// =============================================================================

/// The owner's long-lived symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim())
            .map_err(|e| Error::Config(format!("master key is not hex: {}", e)))?;
        let bytes: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|_| Error::Config(format!("master key must be {} bytes", KEY_SIZE)))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Read a hex key file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read key file {}: {}", path.display(), e))
        })?;
        Self::from_hex(&raw)
    }

    /// Write the key as hex, refusing to overwrite an existing file
    pub fn store(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        writeln!(file, "{}", self.to_hex())?;
        file.sync_all()?;
        Ok(())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

// =============================================================================
// Block Cipher
// =============================================================================

/// Seals and opens blocks under one master key
#[derive(Clone)]
pub struct BlockCipher {
    cipher: XChaCha20Poly1305,
}

impl fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCipher").finish_non_exhaustive()
    }
}

/// Associated data: backup id bytes followed by the big-endian block number
fn build_aad(backup_id: &str, block_number: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(backup_id.len() + 8);
    aad.extend_from_slice(backup_id.as_bytes());
    aad.extend_from_slice(&block_number.to_be_bytes());
    aad
}

impl BlockCipher {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new((&key.0).into()),
        }
    }

    /// `nonce || ciphertext || tag`, exactly `plaintext.len() + SEAL_OVERHEAD` bytes
    pub fn seal(&self, backup_id: &str, block_number: u64, plaintext: &[u8]) -> Result<Bytes> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let aad = build_aad(backup_id, block_number);

        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Encryption {
                backup_id: backup_id.to_string(),
                block_number,
            })?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(Bytes::from(sealed))
    }

    /// Authenticate and decrypt a sealed block
    pub fn open(&self, backup_id: &str, block_number: u64, sealed: &[u8]) -> Result<Bytes> {
        let failed = || Error::Decryption {
            backup_id: backup_id.to_string(),
            block_number,
        };
        if sealed.len() < SEAL_OVERHEAD {
            return Err(failed());
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let aad = build_aad(backup_id, block_number);

        let plaintext = self
            .cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| failed())?;
        Ok(Bytes::from(plaintext))
    }
}
