//! Upload path

use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, TryStreamExt};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{BackupOutcome, Engine, BLOCKS_IN_FLIGHT};
use crate::domain::events::DomainEvent;
use crate::domain::ports::BackupId;
use crate::error::{Error, Result};
use crate::index::{BackupRecord, BlockManifest, FragmentRecord};
use crate::metrics::METRICS;
use crate::pipeline::{BlockChunker, BlockLayout, Fragment, FragmentName, PlainBlock};
use crate::transfer::{Ack, Holder, OutboundFragment};
use crate::worker::{Job, JobOutput};

impl Engine {
    /// Back up everything `reader` yields under the logical `path`
    pub async fn backup<R>(
        &self,
        reader: R,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.backup_as(BackupId::generate(), reader, path, cancel)
            .await
    }

    #[instrument(skip(self, reader, cancel), fields(backup_id = %backup_id))]
    pub(super) async fn backup_as<R>(
        &self,
        backup_id: BackupId,
        reader: R,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let layout = BlockLayout::new(self.map.data_fragments(), self.fragment_size)?;
        self.ensure_family().await?;

        self.index
            .create_backup(BackupRecord::new(
                backup_id.clone(),
                path,
                self.map.name(),
                self.fragment_size,
            ))
            .await?;
        info!(path, map = %self.map.name(), "Backup started");
        self.emit(DomainEvent::BackupStarted {
            backup_id: backup_id.to_string(),
            path: path.to_string(),
            ecc_map: self.map.name().to_string(),
            timestamp: Utc::now(),
        })
        .await;

        let chunker = BlockChunker::new(reader, layout, backup_id.clone());
        let blocks = stream::try_unfold(chunker, |mut chunker| async move {
            match chunker.next_block().await {
                Ok(next) => Ok(next.map(|block| (block, chunker))),
                Err(e) => Err((None::<u64>, e)),
            }
        });

        let uploaded = blocks
            .map_ok(|block| {
                let block_number = block.block_number;
                async move {
                    self.store_block(&layout, block, cancel)
                        .await
                        .map_err(|e| (Some(block_number), e))
                }
            })
            .try_buffer_unordered(BLOCKS_IN_FLIGHT)
            .try_fold((0u64, 0u64), |(blocks, bytes), stored| async move {
                Ok((blocks + 1, bytes + stored))
            })
            .await;

        let (blocks, bytes) = match uploaded {
            Ok(totals) => totals,
            Err((block_number, error)) => {
                warn!(block_number, error = %error, "Backup failed");
                self.emit(DomainEvent::BackupFailed {
                    backup_id: backup_id.to_string(),
                    block_number,
                    reason: error.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
                self.discard_backup(&backup_id).await;
                return Err(error);
            }
        };

        self.index.finish_backup(&backup_id, blocks, bytes).await?;
        if let Err(e) = self.spool.remove_backup(&backup_id).await {
            warn!(error = %e, "Failed to clean the fragment spool");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(blocks, bytes, duration_ms, "Backup completed");
        self.emit(DomainEvent::BackupCompleted {
            backup_id: backup_id.to_string(),
            blocks,
            bytes,
            duration_ms,
            timestamp: Utc::now(),
        })
        .await;

        Ok(BackupOutcome {
            backup_id,
            blocks,
            bytes,
        })
    }

    /// Drop a failed backup: fragments already sent, the spool and the
    /// index entry
    async fn discard_backup(&self, backup_id: &BackupId) {
        match self.forget_backup(backup_id).await {
            Ok(deleted) => debug!(deleted, "Discarded failed backup"),
            Err(e) => warn!(error = %e, "Failed to discard failed backup"),
        }
    }

    /// Seal, encode, record, spool and upload one block; returns its payload
    /// length
    #[instrument(skip_all, fields(block_number = block.block_number))]
    async fn store_block(
        &self,
        layout: &BlockLayout,
        block: PlainBlock,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let started = Instant::now();
        let backup_id = block.backup_id.clone();
        let block_number = block.block_number;
        let payload_len = block.payload.len() as u64;
        let d = self.map.data_fragments();

        let sealed = block.seal(layout, &self.cipher)?;
        let output = self
            .run_job(Job::Make {
                backup_id: backup_id.clone(),
                block_number,
                map: self.map.clone(),
                sealed: sealed.bytes,
                fragment_size: layout.wire_fragment_size(),
            })
            .await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("{}/{}", backup_id, block_number)));
        }
        let JobOutput::Made(encoded) = output else {
            return Err(Error::Internal("make job returned a different output".into()));
        };
        METRICS.blocks_encoded.inc();

        let fragments: Vec<Fragment> = encoded
            .data
            .into_iter()
            .chain(encoded.parity)
            .enumerate()
            .map(|(position, bytes)| {
                Fragment::new(
                    FragmentName::at_position(backup_id.clone(), block_number, position, d),
                    bytes,
                )
            })
            .collect();

        let family = self
            .families
            .family(&self.scope)
            .ok_or_else(|| Error::Internal(format!("no supplier family for {}", self.scope)))?;
        let records = fragments
            .iter()
            .enumerate()
            .map(|(position, fragment)| {
                let peer = family.peer_at(position).cloned().ok_or_else(|| {
                    Error::Internal(format!("family has no position {}", position))
                })?;
                Ok(FragmentRecord::pending(position, d, peer, fragment.hash))
            })
            .collect::<Result<Vec<_>>>()?;
        self.index
            .record_manifest(
                &backup_id,
                BlockManifest {
                    block_number,
                    fragment_size: encoded.fragment_size,
                    fragments: records,
                },
            )
            .await?;

        futures::future::try_join_all(fragments.iter().map(|f| self.spool.write(f))).await?;

        let outbound: Vec<OutboundFragment> = fragments
            .into_iter()
            .enumerate()
            .map(|(position, fragment)| OutboundFragment {
                fragment,
                position,
                holder: Holder::Slot {
                    scope: self.scope.clone(),
                    position,
                },
            })
            .collect();

        let index = &self.index;
        let spool = &self.spool;
        let report = self
            .scheduler
            .upload_block(outbound, &*self.families, cancel, |ack: Ack| async move {
                index
                    .mark_stored(
                        &ack.name.backup_id,
                        ack.name.block_number,
                        ack.position,
                        ack.peer,
                    )
                    .await?;
                spool.remove(&ack.name).await
            })
            .await?;

        METRICS
            .block_upload_latency_s
            .observe(started.elapsed().as_secs_f64());
        debug!(acked = report.acked.len(), "Block stored");
        Ok(payload_len)
    }
}
