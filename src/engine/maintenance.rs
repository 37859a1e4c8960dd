//! Verify, rebuild, forget and migrate

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Engine, RebuildReport, VerifyReport, BLOCKS_PREFETCHED};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{BackupId, PeerId};
use crate::ec::EccMap;
use crate::error::{Error, Result};
use crate::index::{BlockManifest, FragmentState};
use crate::pipeline::{ContentHash, Fragment, FragmentName};
use crate::transfer::{Ack, Holder, OutboundFragment};
use crate::worker::{Job, JobOutput};

/// Bytes buffered between the restore and backup halves of a migration
const MIGRATION_PIPE: usize = 256 * 1024;

/// What a survey of one block found on its holders
#[derive(Debug)]
struct Survey {
    fragments: Vec<Option<Bytes>>,
    lost: Vec<usize>,
}

impl Survey {
    fn present(&self) -> Vec<bool> {
        self.fragments.iter().map(Option::is_some).collect()
    }
}

/// How a block fared in a survey
enum Health {
    Healthy,
    Degraded,
    Unrecoverable,
}

impl Engine {
    // =========================================================================
    // Verify
    // =========================================================================

    /// Fetch every acknowledged fragment of a backup and mark the ones that
    /// are gone, or on holders that no longer serve reads, as `Lost`
    #[instrument(skip(self, cancel), fields(backup_id = %backup_id))]
    pub async fn verify_backup(
        &self,
        backup_id: &BackupId,
        cancel: &CancellationToken,
    ) -> Result<VerifyReport> {
        let record = self.index.require(backup_id).await?;
        let (map, _) = self.layout_of(&record)?;
        let map = map.as_ref();

        let surveys = stream::iter(record.manifests.values())
            .map(|manifest| async move {
                manifest.validate(map)?;
                let survey = self.survey_block(backup_id, map, manifest, cancel).await?;
                Ok::<_, Error>((manifest.block_number, survey))
            })
            .buffered(BLOCKS_PREFETCHED);
        futures::pin_mut!(surveys);

        let mut report = VerifyReport::default();
        while let Some((block_number, survey)) = surveys.try_next().await? {
            report.blocks += 1;
            report.lost_fragments += survey.lost.len();
            match self.classify(backup_id, map, block_number, &survey.present()).await {
                Health::Healthy => report.healthy += 1,
                Health::Degraded => report.degraded += 1,
                Health::Unrecoverable => report.unrecoverable.push(block_number),
            }
        }

        info!(
            blocks = report.blocks,
            healthy = report.healthy,
            degraded = report.degraded,
            unrecoverable = report.unrecoverable.len(),
            lost = report.lost_fragments,
            "Verify completed"
        );
        Ok(report)
    }

    /// Fetch all `Stored` fragments of a block without stopping early
    async fn survey_block(
        &self,
        backup_id: &BackupId,
        map: &EccMap,
        manifest: &BlockManifest,
        cancel: &CancellationToken,
    ) -> Result<Survey> {
        let block_number = manifest.block_number;
        let sources = self.read_sources(backup_id, manifest);
        let fetch = self
            .scheduler
            .fetch_block(sources, map.total_fragments(), &*self.families, cancel, |_| false)
            .await?;

        let present = fetch.present();
        let lost: Vec<(usize, PeerId)> = manifest
            .fragments
            .iter()
            .filter(|f| f.state == FragmentState::Stored && !present[f.position])
            .map(|f| (f.position, f.peer_id.clone()))
            .collect();
        for (position, peer) in &lost {
            warn!(block_number, position, peer = %peer, "Fragment lost");
            self.index.mark_lost(backup_id, block_number, *position).await?;
            self.emit(DomainEvent::FragmentLost {
                backup_id: backup_id.to_string(),
                block_number,
                position: *position,
                peer: peer.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        }

        Ok(Survey {
            fragments: fetch.fragments,
            lost: lost.into_iter().map(|(position, _)| position).collect(),
        })
    }

    async fn classify(
        &self,
        backup_id: &BackupId,
        map: &EccMap,
        block_number: u64,
        present: &[bool],
    ) -> Health {
        let d = map.data_fragments();
        let (data, parity) = present.split_at(d);
        if present.iter().all(|p| *p) {
            return Health::Healthy;
        }
        if map.is_fixable(data, parity) {
            return Health::Degraded;
        }
        let missing = map.unrecoverable_data(data, parity);
        warn!(block_number, missing = ?missing, "Block is unrecoverable");
        self.emit(DomainEvent::BlockUnrecoverable {
            backup_id: backup_id.to_string(),
            block_number,
            missing,
            timestamp: Utc::now(),
        })
        .await;
        Health::Unrecoverable
    }

    // =========================================================================
    // Rebuild
    // =========================================================================

    /// Regenerate missing fragments, and fragments whose position moved to
    /// another peer, and send them to the current family
    #[instrument(skip(self, cancel), fields(backup_id = %backup_id))]
    pub async fn rebuild_backup(
        &self,
        backup_id: &BackupId,
        cancel: &CancellationToken,
    ) -> Result<RebuildReport> {
        let record = self.index.require(backup_id).await?;
        let (map, _) = self.layout_of(&record)?;
        let family = self
            .families
            .family(&self.scope)
            .ok_or_else(|| Error::Config(format!("no supplier family for {}", self.scope)))?;
        if family.ecc_map != record.ecc_map {
            return Err(Error::Config(format!(
                "backup {} uses {} but the family uses {}; migrate it first",
                backup_id, record.ecc_map, family.ecc_map
            )));
        }

        let mut report = RebuildReport::default();
        for manifest in record.manifests.values() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("rebuild of {}", backup_id)));
            }
            report.blocks += 1;
            manifest.validate(&map)?;
            let survey = self.survey_block(backup_id, &map, manifest, cancel).await?;
            let present = survey.present();

            let targets: Vec<usize> = manifest
                .fragments
                .iter()
                .filter(|f| {
                    let current = family.peer_at(f.position);
                    !present[f.position]
                        || current != Some(&self.families.resolve_peer(&f.peer_id))
                })
                .map(|f| f.position)
                .collect();
            if targets.is_empty() {
                continue;
            }

            let block_number = manifest.block_number;
            if let Health::Unrecoverable = self
                .classify(backup_id, &map, block_number, &present)
                .await
            {
                report.unrecoverable.push(block_number);
                continue;
            }

            let sent = self
                .rebuild_block(backup_id, &map, manifest, survey, &targets, cancel)
                .await?;
            report.rebuilt_blocks += 1;
            report.fragments_sent += sent;
            info!(block_number, positions = ?targets, "Block rebuilt");
            self.emit(DomainEvent::BlockRebuilt {
                backup_id: backup_id.to_string(),
                block_number,
                positions: targets,
                timestamp: Utc::now(),
            })
            .await;
        }
        Ok(report)
    }

    async fn rebuild_block(
        &self,
        backup_id: &BackupId,
        map: &Arc<EccMap>,
        manifest: &BlockManifest,
        survey: Survey,
        targets: &[usize],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let block_number = manifest.block_number;
        let d = map.data_fragments();
        let mut data = survey.fragments;
        let parity = data.split_off(d);

        let output = self
            .run_job(Job::Rebuild {
                backup_id: backup_id.clone(),
                block_number,
                map: map.clone(),
                data,
                parity,
            })
            .await?;
        let JobOutput::Rebuilt(rebuilt) = output else {
            return Err(Error::Internal("rebuild job returned a different output".into()));
        };
        let all: Vec<Option<Bytes>> = rebuilt.data.into_iter().chain(rebuilt.parity).collect();

        let mut outbound = Vec::with_capacity(targets.len());
        for &position in targets {
            let name = FragmentName::at_position(backup_id.clone(), block_number, position, d);
            let bytes = all.get(position).cloned().flatten().ok_or_else(|| {
                Error::Internal(format!("{} was not regenerated", name))
            })?;
            let expected = manifest.fragments[position].content_hash;
            if ContentHash::of(&bytes) != expected {
                return Err(Error::Internal(format!(
                    "regenerated {} does not match its recorded hash",
                    name
                )));
            }
            outbound.push(OutboundFragment {
                fragment: Fragment::new(name, bytes),
                position,
                holder: Holder::Slot {
                    scope: self.scope.clone(),
                    position,
                },
            });
        }

        let index = &self.index;
        let report = self
            .scheduler
            .upload_block(outbound, &*self.families, cancel, |ack: Ack| async move {
                index
                    .mark_stored(&ack.name.backup_id, ack.name.block_number, ack.position, ack.peer)
                    .await
            })
            .await?;
        Ok(report.acked.len())
    }

    // =========================================================================
    // Forget
    // =========================================================================

    /// Delete a backup's fragments from its holders, best effort, and drop it
    /// from the index. Returns the number of fragments deleted.
    #[instrument(skip(self), fields(backup_id = %backup_id))]
    pub async fn forget_backup(&self, backup_id: &BackupId) -> Result<usize> {
        let record = self.index.require(backup_id).await?;
        let targets: Vec<(PeerId, FragmentName)> = record
            .manifests
            .values()
            .flat_map(|manifest| {
                manifest
                    .fragments
                    .iter()
                    .filter(|f| f.state != FragmentState::Lost)
                    .map(|f| (f.peer_id.clone(), f.name(backup_id, manifest.block_number)))
            })
            .collect();

        let transport = &self.transport;
        let deleted = stream::iter(targets)
            .map(|(peer, name)| async move {
                let peer = self.families.resolve_peer(&peer);
                match transport.delete(&peer, &name.to_string()).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(fragment = %name, peer = %peer, error = %e, "Delete failed");
                        false
                    }
                }
            })
            .buffer_unordered(self.scheduler.config().total_concurrency)
            .filter(|deleted| future::ready(*deleted))
            .count()
            .await;

        if let Err(e) = self.spool.remove_backup(backup_id).await {
            warn!(error = %e, "Failed to clean the fragment spool");
        }
        self.index.forget_backup(backup_id).await?;
        info!(deleted, "Backup forgotten");
        self.emit(DomainEvent::BackupForgotten {
            backup_id: backup_id.to_string(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(deleted)
    }

    // =========================================================================
    // Migrate
    // =========================================================================

    /// Re-encode a backup under the current scheme and family, then forget
    /// the old copy. Backups already on the current scheme are left alone.
    #[instrument(skip(self, cancel), fields(backup_id = %backup_id))]
    pub async fn migrate_backup(
        &self,
        backup_id: &BackupId,
        cancel: &CancellationToken,
    ) -> Result<BackupId> {
        let record = self.index.require(backup_id).await?;
        if record.ecc_map == self.map.name() {
            debug!("Backup already uses the current scheme");
            return Ok(backup_id.clone());
        }

        let new_id = BackupId::generate();
        let (writer, reader) = tokio::io::duplex(MIGRATION_PIPE);
        let migrated = tokio::try_join!(
            self.restore(backup_id, writer, cancel),
            self.backup_as(new_id.clone(), reader, &record.path, cancel),
        );

        match migrated {
            Ok((restored, stored)) => {
                info!(
                    from = %record.ecc_map,
                    to = %self.map.name(),
                    new_backup_id = %new_id,
                    blocks = stored.blocks,
                    bytes = restored.bytes,
                    "Backup migrated"
                );
                self.forget_backup(backup_id).await?;
                Ok(new_id)
            }
            Err(e) => {
                if let Err(cleanup) = self.forget_backup(&new_id).await {
                    debug!(error = %cleanup, "Nothing to clean up after failed migration");
                }
                Err(e)
            }
        }
    }
}
