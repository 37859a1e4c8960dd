//! Fragments and their wire names
//!
//! A fragment is named `<backupID>/<blockNumber>-<kindIndex>-<kindTag>` on
//! the wire and on disk; the name is bit-exact across peers.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::domain::ports::BackupId;
use crate::error::{Error, Result};

// =============================================================================
// Fragment Kind
// =============================================================================

/// Data or parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FragmentKind {
    Data,
    Parity,
}

impl FragmentKind {
    pub fn tag(&self) -> &'static str {
        match self {
            FragmentKind::Data => "Data",
            FragmentKind::Parity => "Parity",
        }
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for FragmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Data" => Ok(FragmentKind::Data),
            "Parity" => Ok(FragmentKind::Parity),
            other => Err(Error::Internal(format!("unknown fragment kind: {}", other))),
        }
    }
}

/// Family position of a fragment: data first, then parity
pub fn position(kind: FragmentKind, index: usize, data_fragments: usize) -> usize {
    match kind {
        FragmentKind::Data => index,
        FragmentKind::Parity => data_fragments + index,
    }
}

/// Inverse of [`position`]
pub fn kind_at(position: usize, data_fragments: usize) -> (FragmentKind, usize) {
    if position < data_fragments {
        (FragmentKind::Data, position)
    } else {
        (FragmentKind::Parity, position - data_fragments)
    }
}

// =============================================================================
// Fragment Name
// =============================================================================

/// Fully qualified fragment identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentName {
    pub backup_id: BackupId,
    pub block_number: u64,
    pub kind: FragmentKind,
    pub index: usize,
}

impl FragmentName {
    pub fn new(backup_id: BackupId, block_number: u64, kind: FragmentKind, index: usize) -> Self {
        Self {
            backup_id,
            block_number,
            kind,
            index,
        }
    }

    /// Name of the fragment occupying a family position
    pub fn at_position(
        backup_id: BackupId,
        block_number: u64,
        position: usize,
        data_fragments: usize,
    ) -> Self {
        let (kind, index) = kind_at(position, data_fragments);
        Self::new(backup_id, block_number, kind, index)
    }

    pub fn position(&self, data_fragments: usize) -> usize {
        position(self.kind, self.index, data_fragments)
    }

    /// The part after the backup directory: `<block>-<index>-<tag>`
    pub fn file_name(&self) -> String {
        format!("{}-{}-{}", self.block_number, self.index, self.kind)
    }
}

impl fmt::Display for FragmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}-{}-{}",
            self.backup_id, self.block_number, self.index, self.kind
        )
    }
}

impl FromStr for FragmentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::Internal(format!("malformed fragment name: {:?}", s));

        let (backup, rest) = s.rsplit_once('/').ok_or_else(malformed)?;
        let backup_id = BackupId::from(backup);
        if !backup_id.is_valid() {
            return Err(malformed());
        }

        let mut parts = rest.split('-');
        let (Some(block), Some(index), Some(tag), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        Ok(Self {
            backup_id,
            block_number: parse_decimal(block).ok_or_else(malformed)?,
            index: parse_decimal(index).ok_or_else(malformed)? as usize,
            kind: tag.parse().map_err(|_| malformed())?,
        })
    }
}

/// Canonical zero-based decimal: digits only, no leading zeros
fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

impl Serialize for FragmentName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FragmentName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Content Hash
// =============================================================================

/// BLAKE3 digest of a fragment's bytes, serialized as hex
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|e| Error::Internal(format!("bad hash hex: {}", e)))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| Error::Internal("content hash must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ContentHash::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Fragment
// =============================================================================

/// One of the `D + P` byte arrays produced from a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub name: FragmentName,
    pub bytes: Bytes,
    pub hash: ContentHash,
}

impl Fragment {
    pub fn new(name: FragmentName, bytes: Bytes) -> Self {
        let hash = ContentHash::of(&bytes);
        Self { name, bytes, hash }
    }

    /// Whether `bytes` still hash to the recorded digest
    pub fn verify(&self) -> bool {
        ContentHash::of(&self.bytes) == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // =========================================================================
    // Name Tests
    // =========================================================================

    #[test]
    fn test_name_format() {
        let name = FragmentName::new(BackupId::from("F2024-ab"), 17, FragmentKind::Parity, 3);
        assert_eq!(name.to_string(), "F2024-ab/17-3-Parity");
        assert_eq!(name.file_name(), "17-3-Parity");
    }

    #[test]
    fn test_name_parse() {
        let name: FragmentName = "F2024-ab/0-12-Data".parse().unwrap();
        assert_eq!(name.backup_id.as_str(), "F2024-ab");
        assert_eq!(name.block_number, 0);
        assert_eq!(name.index, 12);
        assert_eq!(name.kind, FragmentKind::Data);
        assert_eq!(name.to_string(), "F2024-ab/0-12-Data");
    }

    #[test]
    fn test_name_parse_rejects_noise() {
        for bad in [
            "nobackup",
            "b/1-2",
            "b/1-2-Data-x",
            "b/01-2-Data",
            "b/1-+2-Data",
            "b/1-2-data",
            "/1-2-Data",
            "b/-1-2-Data",
        ] {
            assert_matches!(bad.parse::<FragmentName>(), Err(_), "{}", bad);
        }
    }

    #[test]
    fn test_positions() {
        assert_eq!(position(FragmentKind::Data, 2, 4), 2);
        assert_eq!(position(FragmentKind::Parity, 2, 4), 6);
        assert_eq!(kind_at(6, 4), (FragmentKind::Parity, 2));
        assert_eq!(kind_at(3, 4), (FragmentKind::Data, 3));
        let name = FragmentName::at_position(BackupId::from("b"), 5, 5, 4);
        assert_eq!(name.to_string(), "b/5-1-Parity");
    }

    // =========================================================================
    // Hash Tests
    // =========================================================================

    #[test]
    fn test_content_hash_hex() {
        let hash = ContentHash::of(b"fragment");
        assert_eq!(ContentHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(ContentHash::from_hex("abcd").is_err());

        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
    }

    #[test]
    fn test_fragment_verify() {
        let name = FragmentName::new(BackupId::from("b"), 0, FragmentKind::Data, 0);
        let mut fragment = Fragment::new(name, Bytes::from_static(b"abc"));
        assert!(fragment.verify());
        fragment.bytes = Bytes::from_static(b"abd");
        assert!(!fragment.verify());
    }
}
