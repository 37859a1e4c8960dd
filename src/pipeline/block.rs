//! Block framing
//!
//! A backup is cut into fixed-size blocks. Each block frame is the
//! payload, zero padding up to `D * fragment_size`, and an 8-byte trailer:
//!
//! ```text
//! ┌──────────────────────────────┬─────────┬──────────────────────────────┐
//! │ payload (≤ capacity)         │ padding │ len u32 BE │ flags │ 3 × 0x00 │
//! └──────────────────────────────┴─────────┴──────────────────────────────┘
//! ```
//!
//! The whole frame is sealed, so the trailer is never visible to suppliers.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::crypto::{BlockCipher, SEAL_OVERHEAD};
use crate::domain::ports::BackupId;
use crate::error::{Error, Result};

/// Trailer bytes appended to every frame
pub const TRAILER_SIZE: usize = 8;

const FLAG_LAST: u8 = 0x01;

// =============================================================================
// Layout
// =============================================================================

/// Size arithmetic for one ECC scheme and fragment size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    data_fragments: usize,
    fragment_size: usize,
}

impl BlockLayout {
    pub fn new(data_fragments: usize, fragment_size: usize) -> Result<Self> {
        if data_fragments == 0 || fragment_size == 0 {
            return Err(Error::Config(
                "block layout needs positive fragment count and size".into(),
            ));
        }
        let capacity = data_fragments
            .checked_mul(fragment_size)
            .filter(|&c| c <= u32::MAX as usize)
            .ok_or_else(|| Error::Config("block capacity exceeds 4 GiB".into()))?;
        debug_assert!(capacity > 0);
        Ok(Self {
            data_fragments,
            fragment_size,
        })
    }

    pub fn data_fragments(&self) -> usize {
        self.data_fragments
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Plaintext bytes carried per block
    pub fn capacity(&self) -> usize {
        self.data_fragments * self.fragment_size
    }

    /// Padded payload plus trailer
    pub fn frame_len(&self) -> usize {
        self.capacity() + TRAILER_SIZE
    }

    /// Frame after sealing
    pub fn sealed_len(&self) -> usize {
        self.frame_len() + SEAL_OVERHEAD
    }

    /// Size of every fragment put on the wire
    pub fn wire_fragment_size(&self) -> usize {
        self.sealed_len().div_ceil(self.data_fragments)
    }
}

// =============================================================================
// Blocks
// =============================================================================

/// A plaintext block before sealing / after opening
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainBlock {
    pub backup_id: BackupId,
    pub block_number: u64,
    pub payload: Bytes,
    pub last: bool,
}

/// A sealed block, exactly `layout.sealed_len()` bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    pub backup_id: BackupId,
    pub block_number: u64,
    pub bytes: Bytes,
}

impl PlainBlock {
    /// Pad and append the trailer
    pub fn frame(&self, layout: &BlockLayout) -> Result<Vec<u8>> {
        if self.payload.len() > layout.capacity() {
            return Err(Error::Shape {
                backup_id: self.backup_id.to_string(),
                block_number: self.block_number,
                reason: format!(
                    "payload of {} bytes exceeds block capacity {}",
                    self.payload.len(),
                    layout.capacity()
                ),
            });
        }
        let mut frame = Vec::with_capacity(layout.frame_len());
        frame.extend_from_slice(&self.payload);
        frame.resize(layout.capacity(), 0);
        frame.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        frame.push(if self.last { FLAG_LAST } else { 0 });
        frame.extend_from_slice(&[0u8; 3]);
        Ok(frame)
    }

    /// Strip padding using the trailer
    pub fn unframe(
        backup_id: BackupId,
        block_number: u64,
        layout: &BlockLayout,
        frame: &[u8],
    ) -> Result<Self> {
        let bad = |reason: String| Error::Shape {
            backup_id: backup_id.to_string(),
            block_number,
            reason,
        };
        if frame.len() != layout.frame_len() {
            return Err(bad(format!(
                "frame is {} bytes, expected {}",
                frame.len(),
                layout.frame_len()
            )));
        }
        let (body, trailer) = frame.split_at(layout.capacity());
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&trailer[..4]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        let flags = trailer[4];
        if payload_len > layout.capacity() || flags & !FLAG_LAST != 0 || trailer[5..] != [0u8; 3] {
            return Err(bad("invalid block trailer".into()));
        }
        Ok(Self {
            payload: Bytes::copy_from_slice(&body[..payload_len]),
            last: flags & FLAG_LAST != 0,
            backup_id,
            block_number,
        })
    }

    /// Frame and encrypt
    pub fn seal(&self, layout: &BlockLayout, cipher: &BlockCipher) -> Result<SealedBlock> {
        let frame = self.frame(layout)?;
        let bytes = cipher.seal(self.backup_id.as_str(), self.block_number, &frame)?;
        Ok(SealedBlock {
            backup_id: self.backup_id.clone(),
            block_number: self.block_number,
            bytes,
        })
    }
}

impl SealedBlock {
    /// Decrypt and unframe; `bytes` may carry codec padding past `sealed_len`
    pub fn open(&self, layout: &BlockLayout, cipher: &BlockCipher) -> Result<PlainBlock> {
        let sealed_len = layout.sealed_len();
        if self.bytes.len() < sealed_len {
            return Err(Error::Shape {
                backup_id: self.backup_id.to_string(),
                block_number: self.block_number,
                reason: format!(
                    "sealed block is {} bytes, expected {}",
                    self.bytes.len(),
                    sealed_len
                ),
            });
        }
        let frame = cipher.open(
            self.backup_id.as_str(),
            self.block_number,
            &self.bytes[..sealed_len],
        )?;
        PlainBlock::unframe(self.backup_id.clone(), self.block_number, layout, &frame)
    }
}

// =============================================================================
// Chunker (upload side)
// =============================================================================

/// Cuts a byte stream into numbered blocks, flagging the last one
///
/// Reads one chunk ahead so the final block is known when it is emitted.
/// An empty stream yields a single empty final block.
pub struct BlockChunker<R> {
    reader: R,
    layout: BlockLayout,
    backup_id: BackupId,
    next_block: u64,
    lookahead: Option<Vec<u8>>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> BlockChunker<R> {
    pub fn new(reader: R, layout: BlockLayout, backup_id: BackupId) -> Self {
        Self {
            reader,
            layout,
            backup_id,
            next_block: 0,
            lookahead: None,
            finished: false,
        }
    }

    pub async fn next_block(&mut self) -> Result<Option<PlainBlock>> {
        if self.finished {
            return Ok(None);
        }

        let current = match self.lookahead.take() {
            Some(chunk) => chunk,
            None => self.read_chunk().await?,
        };
        let next = if current.len() < self.layout.capacity() {
            Vec::new()
        } else {
            self.read_chunk().await?
        };

        let last = next.is_empty();
        if last {
            self.finished = true;
        } else {
            self.lookahead = Some(next);
        }

        let block = PlainBlock {
            backup_id: self.backup_id.clone(),
            block_number: self.next_block,
            payload: Bytes::from(current),
            last,
        };
        self.next_block += 1;
        Ok(Some(block))
    }

    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let capacity = self.layout.capacity();
        let mut buf = vec![0u8; capacity];
        let mut filled = 0;
        while filled < capacity {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

// =============================================================================
// Sequencer (download side)
// =============================================================================

/// Enforces dense, in-order block numbering ending in a final block
#[derive(Debug)]
pub struct BlockSequencer {
    backup_id: BackupId,
    expected: u64,
    finished: bool,
}

impl BlockSequencer {
    pub fn new(backup_id: BackupId) -> Self {
        Self {
            backup_id,
            expected: 0,
            finished: false,
        }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn accept(&mut self, block: &PlainBlock) -> Result<()> {
        if self.finished {
            return Err(self.gap(format!("block {} after the final block", block.block_number)));
        }
        if block.block_number != self.expected {
            return Err(self.gap(format!("found block {}", block.block_number)));
        }
        self.expected += 1;
        self.finished = block.last;
        Ok(())
    }

    /// Number of blocks seen; fails if the final block never arrived
    pub fn finish(self) -> Result<u64> {
        if !self.finished {
            return Err(self.gap("stream ended without a final block".into()));
        }
        Ok(self.expected)
    }

    fn gap(&self, found: String) -> Error {
        Error::BlockGap {
            backup_id: self.backup_id.to_string(),
            expected: self.expected,
            found,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::crypto::MasterKey;
    use assert_matches::assert_matches;

    fn layout() -> BlockLayout {
        BlockLayout::new(4, 4).unwrap()
    }

    fn block(n: u64, payload: &'static [u8], last: bool) -> PlainBlock {
        PlainBlock {
            backup_id: BackupId::from("F1"),
            block_number: n,
            payload: Bytes::from_static(payload),
            last,
        }
    }

    // =========================================================================
    // Layout Tests
    // =========================================================================

    #[test]
    fn test_layout_sizes() {
        let layout = layout();
        assert_eq!(layout.capacity(), 16);
        assert_eq!(layout.frame_len(), 24);
        assert_eq!(layout.sealed_len(), 64);
        assert_eq!(layout.wire_fragment_size(), 16);

        let odd = BlockLayout::new(7, 10).unwrap();
        assert_eq!(odd.sealed_len(), 70 + 8 + 40);
        assert_eq!(odd.wire_fragment_size(), 17);
    }

    #[test]
    fn test_layout_rejects_zero() {
        assert!(BlockLayout::new(0, 4).is_err());
        assert!(BlockLayout::new(4, 0).is_err());
    }

    // =========================================================================
    // Framing Tests
    // =========================================================================

    #[test]
    fn test_frame_unframe() {
        let layout = layout();
        let original = block(0, b"hello world\n", true);
        let frame = original.frame(&layout).unwrap();
        assert_eq!(frame.len(), 24);
        assert_eq!(&frame[16..20], &12u32.to_be_bytes());
        assert_eq!(frame[20], 1);

        let back = PlainBlock::unframe(BackupId::from("F1"), 0, &layout, &frame).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_frame_rejects_oversized_payload() {
        let layout = layout();
        let err = block(0, b"seventeen bytes!!", true).frame(&layout).unwrap_err();
        assert_matches!(err, Error::Shape { .. });
    }

    #[test]
    fn test_unframe_rejects_bad_trailer() {
        let layout = layout();
        let mut frame = block(0, b"abc", false).frame(&layout).unwrap();
        frame[16..20].copy_from_slice(&100u32.to_be_bytes());
        assert!(PlainBlock::unframe(BackupId::from("F1"), 0, &layout, &frame).is_err());
    }

    #[test]
    fn test_seal_open_with_codec_padding() {
        let layout = BlockLayout::new(7, 10).unwrap();
        let cipher = BlockCipher::new(&MasterKey::generate());
        let original = block(4, b"padded by the codec", false);
        let sealed = original.seal(&layout, &cipher).unwrap();
        assert_eq!(sealed.bytes.len(), layout.sealed_len());

        let mut padded = sealed.bytes.to_vec();
        padded.resize(layout.wire_fragment_size() * 7, 0);
        let reopened = SealedBlock {
            bytes: Bytes::from(padded),
            ..sealed
        }
        .open(&layout, &cipher)
        .unwrap();
        assert_eq!(reopened, original);
    }

    // =========================================================================
    // Chunker Tests
    // =========================================================================

    async fn chunk_all(input: &[u8]) -> Vec<PlainBlock> {
        let mut chunker = BlockChunker::new(input, layout(), BackupId::from("F1"));
        let mut blocks = Vec::new();
        while let Some(block) = chunker.next_block().await.unwrap() {
            blocks.push(block);
        }
        blocks
    }

    #[tokio::test]
    async fn test_chunker_small_input() {
        let blocks = chunk_all(b"hello world\n").await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].payload.as_ref(), b"hello world\n");
        assert!(blocks[0].last);
    }

    #[tokio::test]
    async fn test_chunker_empty_input() {
        let blocks = chunk_all(b"").await;
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].payload.is_empty());
        assert!(blocks[0].last);
    }

    #[tokio::test]
    async fn test_chunker_exact_multiple() {
        let input = [7u8; 32];
        let blocks = chunk_all(&input).await;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].block_number, 0);
        assert!(!blocks[0].last);
        assert_eq!(blocks[1].block_number, 1);
        assert_eq!(blocks[1].payload.len(), 16);
        assert!(blocks[1].last);
    }

    #[tokio::test]
    async fn test_chunker_remainder() {
        let input: Vec<u8> = (0..40u8).collect();
        let blocks = chunk_all(&input).await;
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].payload.len(), 8);
        assert!(blocks[2].last);
        let joined: Vec<u8> = blocks.iter().flat_map(|b| b.payload.to_vec()).collect();
        assert_eq!(joined, input);
    }

    // =========================================================================
    // Sequencer Tests
    // =========================================================================

    #[test]
    fn test_sequencer_accepts_dense_run() {
        let mut seq = BlockSequencer::new(BackupId::from("F1"));
        seq.accept(&block(0, b"", false)).unwrap();
        seq.accept(&block(1, b"", true)).unwrap();
        assert_eq!(seq.finish().unwrap(), 2);
    }

    #[test]
    fn test_sequencer_detects_gap() {
        let mut seq = BlockSequencer::new(BackupId::from("F1"));
        seq.accept(&block(0, b"", false)).unwrap();
        assert_matches!(
            seq.accept(&block(2, b"", true)),
            Err(Error::BlockGap { expected: 1, .. })
        );
    }

    #[test]
    fn test_sequencer_detects_truncation() {
        let mut seq = BlockSequencer::new(BackupId::from("F1"));
        seq.accept(&block(0, b"", false)).unwrap();
        assert_matches!(seq.finish(), Err(Error::BlockGap { .. }));
    }
}
