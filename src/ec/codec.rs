//! Fragment Codec
//!
//! Table-driven XOR encoder and iterative decoder over an [`EccMap`].

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use super::eccmap::EccMap;
use crate::error::Error;

// =============================================================================
// Codec Errors
// =============================================================================

/// Failures local to one block; lifted into [`Error`] with `at`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("unrecoverable, missing data fragments {missing:?}")]
    Unrecoverable { missing: Vec<usize> },
}

impl CodecError {
    /// Attach the block identity for user-visible reporting
    pub fn at(self, backup_id: &str, block_number: u64) -> Error {
        match self {
            CodecError::Shape(reason) => Error::Shape {
                backup_id: backup_id.to_string(),
                block_number,
                reason,
            },
            CodecError::Unrecoverable { missing } => {
                Error::unrecoverable(backup_id, block_number, missing)
            }
        }
    }
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

// =============================================================================
// Encoded / Rebuilt Blocks
// =============================================================================

/// All `D + P` fragments of one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlock {
    pub fragment_size: usize,
    pub data: Vec<Bytes>,
    pub parity: Vec<Bytes>,
}

/// Outcome of a rebuild: what is now present and what was regenerated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuiltBlock {
    pub data: Vec<Option<Bytes>>,
    pub parity: Vec<Option<Bytes>>,
    pub rebuilt_data: Vec<usize>,
    pub rebuilt_parity: Vec<usize>,
}

impl RebuiltBlock {
    /// Data indices still missing after the rebuild
    pub fn missing_data(&self) -> Vec<usize> {
        missing(&self.data)
    }

    /// Parity indices still missing after the rebuild
    pub fn missing_parity(&self) -> Vec<usize> {
        missing(&self.parity)
    }
}

fn missing(slots: &[Option<Bytes>]) -> Vec<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(i, _)| i)
        .collect()
}

// =============================================================================
// Fragment Codec
// =============================================================================

/// Encoder/decoder bound to one ECC map
#[derive(Debug, Clone)]
pub struct FragmentCodec {
    map: Arc<EccMap>,
}

impl FragmentCodec {
    pub fn new(map: Arc<EccMap>) -> Self {
        Self { map }
    }

    pub fn map(&self) -> &Arc<EccMap> {
        &self.map
    }

    /// Fragment size needed to carry `block_len` bytes in `D` fragments
    pub fn fragment_size_for(&self, block_len: usize) -> usize {
        block_len.div_ceil(self.map.data_fragments()).max(1)
    }

    /// Split a block into `D` data fragments and XOR the `P` parities
    ///
    /// The block is zero-padded up to `D * fragment_size`.
    #[instrument(skip(self, block), fields(map = %self.map.name(), block_len = block.len()))]
    pub fn encode(&self, block: &[u8], fragment_size: usize) -> CodecResult<EncodedBlock> {
        let d = self.map.data_fragments();
        if fragment_size == 0 {
            return Err(CodecError::Shape("fragment size must be positive".into()));
        }
        if block.len() > d * fragment_size {
            return Err(CodecError::Shape(format!(
                "block of {} bytes exceeds {} x {} bytes",
                block.len(),
                d,
                fragment_size
            )));
        }

        let data: Vec<Bytes> = (0..d)
            .map(|i| {
                let start = (i * fragment_size).min(block.len());
                let end = ((i + 1) * fragment_size).min(block.len());
                let mut fragment = Vec::with_capacity(fragment_size);
                fragment.extend_from_slice(&block[start..end]);
                fragment.resize(fragment_size, 0);
                Bytes::from(fragment)
            })
            .collect();

        let parity = (0..self.map.parity_fragments())
            .map(|j| self.xor_parity(j, &data, fragment_size))
            .collect();

        debug!(
            "Encoded block into {} data + {} parity fragments of {} bytes",
            d,
            self.map.parity_fragments(),
            fragment_size
        );

        Ok(EncodedBlock {
            fragment_size,
            data,
            parity,
        })
    }

    /// Recover all `D` data fragments from whatever subset is present
    ///
    /// When several parities could rebuild a missing fragment the lowest
    /// parity index is used.
    #[instrument(skip_all, fields(map = %self.map.name()))]
    pub fn decode(
        &self,
        data: Vec<Option<Bytes>>,
        parity: Vec<Option<Bytes>>,
    ) -> CodecResult<Vec<Bytes>> {
        let (data, _parity, _) = self.recover(data, parity)?;
        let missing = missing(&data);
        if !missing.is_empty() {
            return Err(CodecError::Unrecoverable { missing });
        }
        Ok(data.into_iter().flatten().collect())
    }

    /// Recover what is possible, then regenerate every parity whose
    /// contributors are all available
    #[instrument(skip_all, fields(map = %self.map.name()))]
    pub fn rebuild(
        &self,
        data: Vec<Option<Bytes>>,
        parity: Vec<Option<Bytes>>,
    ) -> CodecResult<RebuiltBlock> {
        let was_missing = missing(&data);
        let (data, mut parity, fragment_size) = self.recover(data, parity)?;
        let rebuilt_data = was_missing
            .into_iter()
            .filter(|&i| data[i].is_some())
            .collect();
        let mut rebuilt = RebuiltBlock {
            data,
            parity: Vec::new(),
            rebuilt_data,
            rebuilt_parity: Vec::new(),
        };

        for j in 0..self.map.parity_fragments() {
            if parity[j].is_some() {
                continue;
            }
            let contributors = self.map.parity_to_data(j);
            if contributors.iter().all(|&i| rebuilt.data[i].is_some()) {
                let mut acc = vec![0u8; fragment_size];
                for &i in contributors {
                    if let Some(fragment) = &rebuilt.data[i] {
                        xor_into(&mut acc, fragment);
                    }
                }
                parity[j] = Some(Bytes::from(acc));
                rebuilt.rebuilt_parity.push(j);
            }
        }
        rebuilt.parity = parity;
        Ok(rebuilt)
    }

    /// Iterative recovery shared by `decode` and `rebuild`
    fn recover(
        &self,
        mut data: Vec<Option<Bytes>>,
        parity: Vec<Option<Bytes>>,
    ) -> CodecResult<(Vec<Option<Bytes>>, Vec<Option<Bytes>>, usize)> {
        let d = self.map.data_fragments();
        let p = self.map.parity_fragments();
        if data.len() != d || parity.len() != p {
            return Err(CodecError::Shape(format!(
                "expected {} data and {} parity slots, got {} and {}",
                d,
                p,
                data.len(),
                parity.len()
            )));
        }

        let fragment_size = common_size(&data, &parity)?;
        let Some(fragment_size) = fragment_size else {
            return Err(CodecError::Unrecoverable {
                missing: (0..d).collect(),
            });
        };

        let parity_present: Vec<bool> = parity.iter().map(Option::is_some).collect();
        let mut data_present: Vec<bool> = data.iter().map(Option::is_some).collect();

        loop {
            let mut progressed = false;
            for i in 0..d {
                if data_present[i] {
                    continue;
                }
                let Some(j) = self.map.data_fix_path(i, &data_present, &parity_present) else {
                    continue;
                };
                let mut acc = match &parity[j] {
                    Some(fragment) => fragment.to_vec(),
                    None => continue,
                };
                for &other in self.map.parity_to_data(j) {
                    if other != i {
                        if let Some(fragment) = &data[other] {
                            xor_into(&mut acc, fragment);
                        }
                    }
                }
                debug!(data_index = i, parity_index = j, "Recovered data fragment");
                data[i] = Some(Bytes::from(acc));
                data_present[i] = true;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        Ok((data, parity, fragment_size))
    }

    fn xor_parity(&self, parity: usize, data: &[Bytes], fragment_size: usize) -> Bytes {
        let mut acc = vec![0u8; fragment_size];
        for &i in self.map.parity_to_data(parity) {
            xor_into(&mut acc, &data[i]);
        }
        Bytes::from(acc)
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// XOR `src` into `dst` in place
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Concatenate data fragments and cut to `len` bytes
pub fn join(data: &[Bytes], len: usize) -> Bytes {
    let mut out = Vec::with_capacity(data.iter().map(Bytes::len).sum());
    for fragment in data {
        out.extend_from_slice(fragment);
    }
    out.truncate(len);
    Bytes::from(out)
}

fn common_size(data: &[Option<Bytes>], parity: &[Option<Bytes>]) -> CodecResult<Option<usize>> {
    let mut size = None;
    for fragment in data.iter().chain(parity).flatten() {
        match size {
            None => size = Some(fragment.len()),
            Some(s) if s != fragment.len() => {
                return Err(CodecError::Shape(format!(
                    "fragment sizes disagree: {} vs {}",
                    s,
                    fragment.len()
                )))
            }
            Some(_) => {}
        }
    }
    Ok(size)
}

// =============================================================================
// Tests
// =============================================================================
