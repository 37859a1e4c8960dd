//! Download path

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Engine, RestoreOutcome, BLOCKS_PREFETCHED};
use crate::domain::events::DomainEvent;
use crate::domain::ports::BackupId;
use crate::ec::EccMap;
use crate::error::{Error, Result};
use crate::index::{BlockManifest, FragmentState};
use crate::metrics::METRICS;
use crate::pipeline::{BlockLayout, BlockSequencer, PlainBlock, SealedBlock};
use crate::transfer::{Holder, InboundFragment};
use crate::worker::{Job, JobOutput};

impl Engine {
    /// Write the plaintext of a backup to `writer`, in block order
    #[instrument(skip(self, writer, cancel), fields(backup_id = %backup_id))]
    pub async fn restore<W>(
        &self,
        backup_id: &BackupId,
        mut writer: W,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let record = self.index.require(backup_id).await?;
        let (map, layout) = self.layout_of(&record)?;

        let blocks = stream::iter(record.manifests.values())
            .map(|manifest| self.load_block(backup_id, &map, &layout, manifest, cancel))
            .buffered(BLOCKS_PREFETCHED);
        futures::pin_mut!(blocks);

        let mut sequencer = BlockSequencer::new(backup_id.clone());
        let mut bytes = 0u64;
        let mut degraded_blocks = 0u64;
        while let Some(loaded) = blocks.next().await {
            let (block, degraded) = loaded?;
            sequencer.accept(&block)?;
            writer.write_all(&block.payload).await?;
            bytes += block.payload.len() as u64;
            METRICS.blocks_decoded.inc();
            if degraded {
                degraded_blocks += 1;
                METRICS.degraded_blocks.inc();
            }
        }
        let blocks = sequencer.finish()?;
        writer.shutdown().await?;

        info!(blocks, bytes, degraded_blocks, "Restore completed");
        self.emit(DomainEvent::RestoreCompleted {
            backup_id: backup_id.to_string(),
            blocks,
            bytes,
            degraded_blocks,
            timestamp: Utc::now(),
        })
        .await;

        Ok(RestoreOutcome {
            blocks,
            bytes,
            degraded_blocks,
        })
    }

    /// Fetch, decode and open one block; the flag is set when parity was
    /// needed
    #[instrument(skip_all, fields(block_number = manifest.block_number))]
    async fn load_block(
        &self,
        backup_id: &BackupId,
        map: &Arc<EccMap>,
        layout: &BlockLayout,
        manifest: &BlockManifest,
        cancel: &CancellationToken,
    ) -> Result<(PlainBlock, bool)> {
        let block_number = manifest.block_number;
        if manifest.fragment_size != layout.wire_fragment_size() {
            return Err(Error::Shape {
                backup_id: backup_id.to_string(),
                block_number,
                reason: format!(
                    "manifest fragment size {} does not match layout {}",
                    manifest.fragment_size,
                    layout.wire_fragment_size()
                ),
            });
        }

        let d = map.data_fragments();
        let mut fragments = self.fetch_for_decode(backup_id, map, manifest, cancel).await?;
        let present: Vec<bool> = fragments.iter().map(Option::is_some).collect();
        let (data_present, parity_present) = present.split_at(d);
        if !map.is_fixable(data_present, parity_present) {
            let missing = map.unrecoverable_data(data_present, parity_present);
            warn!(missing = ?missing, "Block cannot be decoded");
            self.emit(DomainEvent::BlockUnrecoverable {
                backup_id: backup_id.to_string(),
                block_number,
                missing: missing.clone(),
                timestamp: Utc::now(),
            })
            .await;
            return Err(Error::unrecoverable(backup_id.as_str(), block_number, missing));
        }

        let parity = fragments.split_off(d);
        let output = self
            .run_job(Job::Read {
                backup_id: backup_id.clone(),
                block_number,
                map: map.clone(),
                data: fragments,
                parity,
                sealed_len: layout.sealed_len(),
            })
            .await?;
        let JobOutput::Read { sealed, degraded } = output else {
            return Err(Error::Internal("read job returned a different output".into()));
        };

        let block = SealedBlock {
            backup_id: backup_id.clone(),
            block_number,
            bytes: sealed,
        }
        .open(layout, &self.cipher)?;
        if degraded {
            debug!("Block decoded from parity");
        }
        Ok((block, degraded))
    }

    /// Stored fragments of a block whose holders still serve reads
    pub(super) fn read_sources(
        &self,
        backup_id: &BackupId,
        manifest: &BlockManifest,
    ) -> Vec<InboundFragment> {
        manifest
            .fragments
            .iter()
            .filter(|f| f.state == FragmentState::Stored && self.families.serves_reads(&f.peer_id))
            .map(|f| InboundFragment {
                name: f.name(backup_id, manifest.block_number),
                position: f.position,
                holder: Holder::Peer(f.peer_id.clone()),
                hash: f.content_hash,
            })
            .collect()
    }

    /// Data fragments first; parity is only fetched if some data is missing,
    /// and only until the block decodes
    async fn fetch_for_decode(
        &self,
        backup_id: &BackupId,
        map: &EccMap,
        manifest: &BlockManifest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Bytes>>> {
        let d = map.data_fragments();
        let slots = map.total_fragments();
        let (data, parity): (Vec<_>, Vec<_>) = self
            .read_sources(backup_id, manifest)
            .into_iter()
            .partition(|src| src.position < d);

        let first = self
            .scheduler
            .fetch_block(data, slots, &*self.families, cancel, |present| {
                present[..d].iter().all(|p| *p)
            })
            .await?;
        if first.ready || parity.is_empty() {
            return Ok(first.fragments);
        }

        let have = first.present();
        let second = self
            .scheduler
            .fetch_block(parity, slots, &*self.families, cancel, |present| {
                let merged: Vec<bool> = present.iter().zip(&have).map(|(a, b)| *a || *b).collect();
                map.is_fixable(&merged[..d], &merged[d..])
            })
            .await?;

        let mut fragments = first.fragments;
        for (slot, fetched) in fragments.iter_mut().zip(second.fragments) {
            if slot.is_none() {
                *slot = fetched;
            }
        }
        Ok(fragments)
    }
}
