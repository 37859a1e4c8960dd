//! Backup Engine
//!
//! The context object every operation runs through. It owns the worker
//! pool, the index handle, the family manager and the transfer scheduler,
//! and wires them into the upload and download paths.
//!
//! # Architecture
//!
//! ```text
//!  AsyncRead ──▶ BlockChunker ──▶ seal ──▶ WorkerPool(Make) ──▶ spool
//!                                                               │
//!        IndexHandle ◀── mark_stored ◀── ack ◀── TransferScheduler
//!                                                               │
//!  AsyncWrite ◀── BlockSequencer ◀── open ◀── WorkerPool(Read) ◀┘ fetch
//! ```

mod backup;
mod maintenance;
mod restore;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{BackupId, Dht, EventPublisher, Transport};
use crate::ec::{EccMap, EccRegistry};
use crate::error::{Error, Result};
use crate::index::{BackupRecord, BackupSummary, IndexConfig, IndexHandle};
use crate::pipeline::{BlockCipher, BlockLayout, FragmentSpool, MasterKey};
use crate::placement::{FamilyManager, PlacementConfig, SupplierFamily, DEFAULT_SCOPE};
use crate::transfer::{TransferConfig, TransferScheduler};
use crate::worker::{Job, JobOutput, PoolConfig, WorkerPool};

/// Blocks uploaded concurrently by one backup
const BLOCKS_IN_FLIGHT: usize = 4;

/// Blocks fetched ahead of the one being written by a restore
const BLOCKS_PREFETCHED: usize = 4;

const FAMILIES_FILE: &str = "families.db";

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root: PathBuf,
    /// Family scope new backups are placed with
    pub scope: String,
    pub ecc_map: String,
    /// Plaintext bytes per data fragment
    pub fragment_size: usize,
    pub pool: PoolConfig,
    pub transfer: TransferConfig,
    pub placement: PlacementConfig,
    pub index: IndexConfig,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            root: settings.root.clone(),
            scope: DEFAULT_SCOPE.to_string(),
            ecc_map: settings.ecc_map.clone(),
            fragment_size: settings.fragment_size_bytes()?,
            pool: settings.pool_config()?,
            transfer: settings.transfer_config()?,
            placement: settings.placement_config()?,
            index: settings.index_config(),
        })
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    pub backup_id: BackupId,
    pub blocks: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub blocks: u64,
    pub bytes: u64,
    /// Blocks that needed parity to decode
    pub degraded_blocks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub blocks: u64,
    /// Every acknowledged fragment was fetched intact
    pub healthy: u64,
    /// Decodable, but some fragments are missing
    pub degraded: u64,
    pub unrecoverable: Vec<u64>,
    pub lost_fragments: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub blocks: u64,
    pub rebuilt_blocks: u64,
    pub fragments_sent: usize,
    pub unrecoverable: Vec<u64>,
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    root: PathBuf,
    scope: String,
    map: Arc<EccMap>,
    fragment_size: usize,
    cipher: BlockCipher,
    pool: WorkerPool,
    index: IndexHandle,
    families: Arc<FamilyManager>,
    scheduler: TransferScheduler,
    spool: FragmentSpool,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventPublisher>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("scope", &self.scope)
            .field("map", &self.map.name())
            .field("fragment_size", &self.fragment_size)
            .field("pool", &self.pool)
            .finish()
    }
}

impl Engine {
    /// Start the pool and the index actor and load the supplier families
    pub async fn open(
        config: EngineConfig,
        key: &MasterKey,
        transport: Arc<dyn Transport>,
        dht: Arc<dyn Dht>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        let map = EccRegistry::builtin().lookup(&config.ecc_map)?;
        BlockLayout::new(map.data_fragments(), config.fragment_size)?;

        let families_path = config.index.dir.join(FAMILIES_FILE);
        let pool = WorkerPool::new(config.pool)?;
        let index = IndexHandle::open(config.index).await?;
        let families = FamilyManager::open(
            families_path,
            config.placement,
            transport.clone(),
            dht,
            events.clone(),
        )
        .await?;

        info!(
            root = %config.root.display(),
            map = %map.name(),
            fragment_size = config.fragment_size,
            workers = pool.workers(),
            "Engine ready"
        );
        Ok(Self {
            spool: FragmentSpool::new(&config.root),
            root: config.root,
            scope: config.scope,
            map,
            fragment_size: config.fragment_size,
            cipher: BlockCipher::new(key),
            pool,
            index,
            families: Arc::new(families),
            scheduler: TransferScheduler::new(transport.clone(), config.transfer),
            transport,
            events,
        })
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    pub fn families(&self) -> &Arc<FamilyManager> {
        &self.families
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn ecc_map(&self) -> &Arc<EccMap> {
        &self.map
    }

    pub async fn list_backups(&self, path: Option<&str>) -> Result<Vec<BackupSummary>> {
        let all = self.index.list_backups().await?;
        Ok(match path {
            Some(path) => all.into_iter().filter(|b| b.path == path).collect(),
            None => all,
        })
    }

    /// Checkpoint the index and stop its actor
    pub async fn close(&self) -> Result<()> {
        self.index.close().await
    }

    /// The scope's family under the configured scheme, hiring or resizing
    /// as needed
    pub async fn ensure_family(&self) -> Result<SupplierFamily> {
        match self.families.family(&self.scope) {
            Some(family) if family.ecc_map == self.map.name() => Ok(family),
            Some(_) => self.families.resize(&self.scope, &self.map).await,
            None => self.families.hire(&self.scope, &self.map).await,
        }
    }

    /// Run a codec job, retrying once on another worker if the first one
    /// crashed
    async fn run_job(&self, job: Job) -> Result<JobOutput> {
        match self.pool.run(job.clone()).await {
            Err(Error::WorkerCrashed { task_id, reason }) => {
                warn!(
                    task_id,
                    backup_id = %job.backup_id(),
                    block_number = job.block_number(),
                    reason = %reason,
                    "Worker crashed, retrying job"
                );
                self.emit(DomainEvent::WorkerCrashed {
                    task_id,
                    reason,
                    timestamp: Utc::now(),
                })
                .await;
                self.pool.run(job).await
            }
            other => other,
        }
    }

    fn layout_of(&self, record: &BackupRecord) -> Result<(Arc<EccMap>, BlockLayout)> {
        let map = EccRegistry::builtin().lookup(&record.ecc_map)?;
        let layout = BlockLayout::new(map.data_fragments(), record.fragment_size)?;
        Ok((map, layout))
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryDht, InMemoryEventCollector, InMemoryTransport};
    use crate::domain::ports::PeerId;
    use crate::index::FragmentState;
    use crate::placement::HealthPolicy;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        dir: tempfile::TempDir,
        key: MasterKey,
        transport: Arc<InMemoryTransport>,
        events: Arc<InMemoryEventCollector>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                key: MasterKey::generate(),
                transport: Arc::new(InMemoryTransport::new()),
                events: Arc::new(InMemoryEventCollector::new()),
            }
        }

        fn config(&self, ecc_map: &str, fragment_size: usize) -> EngineConfig {
            let root = self.dir.path().to_path_buf();
            EngineConfig {
                index: IndexConfig {
                    dir: root.join("index"),
                    checkpoint_every: 32,
                },
                root,
                scope: DEFAULT_SCOPE.to_string(),
                ecc_map: ecc_map.to_string(),
                fragment_size,
                pool: PoolConfig {
                    workers: 2,
                    queue_capacity: 4,
                    fault_injector: None,
                },
                transfer: TransferConfig {
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(5),
                    max_attempts: 3,
                    fragment_timeout: Duration::from_secs(5),
                    block_timeout: Duration::from_secs(30),
                    ..Default::default()
                },
                placement: PlacementConfig {
                    candidates: (0..16).map(|i| PeerId::from(format!("peer-{i}"))).collect(),
                    probe_timeout: Duration::from_millis(200),
                    max_pending_replacements: None,
                    health: HealthPolicy::default(),
                },
            }
        }

        async fn open(&self, config: EngineConfig) -> Engine {
            Engine::open(
                config,
                &self.key,
                self.transport.clone(),
                Arc::new(InMemoryDht::new()),
                self.events.clone(),
            )
            .await
            .unwrap()
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn restore_to_vec(engine: &Engine, id: &BackupId) -> Result<(Vec<u8>, RestoreOutcome)> {
        let mut out = Vec::new();
        let outcome = engine
            .restore(id, &mut out, &CancellationToken::new())
            .await?;
        Ok((out, outcome))
    }

    // =========================================================================
    // Backup / Restore
    // =========================================================================

    #[tokio::test]
    async fn test_small_file_round_trip() {
        let h = Harness::new();
        let engine = h.open(h.config("ecc/4x4", 4)).await;
        let input = b"hello world!".to_vec();

        let outcome = engine
            .backup(&input[..], "/notes.txt", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.blocks, 1);
        assert_eq!(outcome.bytes, 12);

        let record = engine.index().require(&outcome.backup_id).await.unwrap();
        assert!(record.is_complete());
        let manifest = record.manifest(0).unwrap();
        assert_eq!(manifest.fragment_size, 16);
        assert_eq!(manifest.count(FragmentState::Stored), 8);

        let (restored, summary) = restore_to_vec(&engine, &outcome.backup_id).await.unwrap();
        assert_eq!(restored, input);
        assert_eq!(summary.degraded_blocks, 0);
        assert_eq!(h.events.events_of_type("BackupCompleted").len(), 1);
        assert_eq!(h.events.events_of_type("RestoreCompleted").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_round_trip() {
        let h = Harness::new();
        let engine = h.open(h.config("ecc/2x2", 8)).await;

        let outcome = engine
            .backup(&b""[..], "/empty", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.blocks, 1);
        assert_eq!(outcome.bytes, 0);

        let (restored, summary) = restore_to_vec(&engine, &outcome.backup_id).await.unwrap();
        assert!(restored.is_empty());
        assert_eq!(summary.blocks, 1);
    }

    #[tokio::test]
    async fn test_multi_block_round_trip_and_spool_cleanup() {
        let h = Harness::new();
        let engine = h.open(h.config("ecc/4x4", 32)).await;
        let input = sample(128 * 9 + 17);

        let outcome = engine
            .backup(&input[..], "/data.bin", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.blocks, 10);

        let spool = FragmentSpool::new(h.dir.path());
        assert!(spool.pending(&outcome.backup_id).await.unwrap().is_empty());

        let (restored, _) = restore_to_vec(&engine, &outcome.backup_id).await.unwrap();
        assert_eq!(restored, input);
    }

    /// Reader that fails on every read
    struct Vanished;

    impl tokio::io::AsyncRead for Vanished {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "source vanished",
            )))
        }
    }

    #[tokio::test]
    async fn test_failed_backup_is_discarded() {
        use tokio::io::AsyncReadExt;

        let h = Harness::new();
        let engine = h.open(h.config("ecc/2x2", 8)).await;
        let input = sample(200);

        let result = engine
            .backup((&input[..]).chain(Vanished), "/broken", &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::Io(_)));

        assert!(engine.index().list_backups().await.unwrap().is_empty());
        assert!(engine.index().backups_for_path("/broken").await.unwrap().is_empty());
        for i in 0..4 {
            assert!(h.transport.fragments_on(&PeerId::from(format!("peer-{i}"))).is_empty());
        }
        let failed = h.events.events_of_type("BackupFailed");
        assert_eq!(failed.len(), 1);
        let backup_id = match &failed[0] {
            DomainEvent::BackupFailed { backup_id, .. } => BackupId::from(backup_id.as_str()),
            other => panic!("unexpected event {other:?}"),
        };
        assert!(!FragmentSpool::new(h.dir.path()).backup_dir(&backup_id).exists());
        assert_eq!(h.events.events_of_type("BackupForgotten").len(), 1);
    }

    #[tokio::test]
    async fn test_restore_unknown_backup() {
        let h = Harness::new();
        let engine = h.open(h.config("ecc/2x2", 8)).await;
        assert_matches!(
            restore_to_vec(&engine, &BackupId::from("nope")).await,
            Err(Error::UnknownBackup(_))
        );
    }

    #[tokio::test]
    async fn test_worker_crash_is_retried() {
        let h = Harness::new();
        let crashed = Arc::new(AtomicBool::new(false));
        let flag = crashed.clone();
        let mut config = h.config("ecc/2x2", 16);
        config.pool.fault_injector = Some(Arc::new(move |job: &Job| {
            job.kind() == "make" && !flag.swap(true, Ordering::SeqCst)
        }));
        let engine = h.open(config).await;

        let input = sample(200);
        let outcome = engine
            .backup(&input[..], "/crash", &CancellationToken::new())
            .await
            .unwrap();
        assert!(crashed.load(Ordering::SeqCst));
        assert_eq!(engine.pool().crashes(), 1);
        assert_eq!(h.events.events_of_type("WorkerCrashed").len(), 1);

        let (restored, _) = restore_to_vec(&engine, &outcome.backup_id).await.unwrap();
        assert_eq!(restored, input);
    }

    #[tokio::test]
    async fn test_list_backups_by_path() {
        let h = Harness::new();
        let engine = h.open(h.config("ecc/2x2", 8)).await;
        let cancel = CancellationToken::new();
        engine.backup(&b"a"[..], "/a", &cancel).await.unwrap();
        engine.backup(&b"b"[..], "/b", &cancel).await.unwrap();
        engine.backup(&b"aa"[..], "/a", &cancel).await.unwrap();

        assert_eq!(engine.list_backups(None).await.unwrap().len(), 3);
        let only_a = engine.list_backups(Some("/a")).await.unwrap();
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|b| b.path == "/a"));
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let h = Harness::new();
        let input = sample(300);
        let id = {
            let engine = h.open(h.config("ecc/2x2", 16)).await;
            let outcome = engine
                .backup(&input[..], "/persist", &CancellationToken::new())
                .await
                .unwrap();
            engine.close().await.unwrap();
            outcome.backup_id
        };

        let engine = h.open(h.config("ecc/2x2", 16)).await;
        let family = engine.families().family(DEFAULT_SCOPE).unwrap();
        assert_eq!(family.ecc_map, "ecc/2x2");
        let (restored, _) = restore_to_vec(&engine, &id).await.unwrap();
        assert_eq!(restored, input);
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    #[tokio::test]
    async fn test_verify_marks_lost_and_rebuild_restores_health() {
        let h = Harness::new();
        let engine = h.open(h.config("ecc/4x4", 16)).await;
        let cancel = CancellationToken::new();
        let input = sample(64 * 3);
        let outcome = engine.backup(&input[..], "/v", &cancel).await.unwrap();
        let id = outcome.backup_id;

        let name = format!("{}/1-0-Parity", id);
        assert!(h.transport.drop_fragment(&PeerId::from("peer-4"), &name));

        let report = engine.verify_backup(&id, &cancel).await.unwrap();
        assert_eq!(report.blocks, 3);
        assert_eq!(report.healthy, 2);
        assert_eq!(report.degraded, 1);
        assert_eq!(report.lost_fragments, 1);
        let record = engine.index().require(&id).await.unwrap();
        assert_eq!(record.manifest(1).unwrap().fragments[4].state, FragmentState::Lost);
        assert_eq!(h.events.events_of_type("FragmentLost").len(), 1);

        let rebuilt = engine.rebuild_backup(&id, &cancel).await.unwrap();
        assert_eq!(rebuilt.rebuilt_blocks, 1);
        assert_eq!(rebuilt.fragments_sent, 1);
        assert!(h.transport.holds(&PeerId::from("peer-4"), &name));

        let report = engine.verify_backup(&id, &cancel).await.unwrap();
        assert_eq!(report.healthy, 3);
        assert_eq!(report.lost_fragments, 0);
    }

    #[tokio::test]
    async fn test_forget_deletes_fragments() {
        let h = Harness::new();
        let engine = h.open(h.config("ecc/2x2", 8)).await;
        let cancel = CancellationToken::new();
        let outcome = engine.backup(&sample(40)[..], "/f", &cancel).await.unwrap();

        let deleted = engine.forget_backup(&outcome.backup_id).await.unwrap();
        assert_eq!(deleted as u64, outcome.blocks * 4);
        for i in 0..4 {
            assert!(h.transport.fragments_on(&PeerId::from(format!("peer-{i}"))).is_empty());
        }
        assert!(engine.index().backup(&outcome.backup_id).await.unwrap().is_none());
        assert_eq!(h.events.events_of_type("BackupForgotten").len(), 1);
    }

    #[tokio::test]
    async fn test_migrate_to_new_scheme() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        let input = sample(500);
        let old_id = {
            let engine = h.open(h.config("ecc/2x2", 16)).await;
            let outcome = engine.backup(&input[..], "/m", &cancel).await.unwrap();
            engine.close().await.unwrap();
            outcome.backup_id
        };

        let engine = h.open(h.config("ecc/4x4", 16)).await;
        let new_id = engine.migrate_backup(&old_id, &cancel).await.unwrap();
        assert_ne!(new_id, old_id);
        assert!(engine.index().backup(&old_id).await.unwrap().is_none());

        let record = engine.index().require(&new_id).await.unwrap();
        assert_eq!(record.ecc_map, "ecc/4x4");
        assert_eq!(record.path, "/m");
        let (restored, _) = restore_to_vec(&engine, &new_id).await.unwrap();
        assert_eq!(restored, input);

        assert_eq!(engine.migrate_backup(&new_id, &cancel).await.unwrap(), new_id);
    }

    #[tokio::test]
    async fn test_rebuild_refuses_scheme_mismatch() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        let id = {
            let engine = h.open(h.config("ecc/2x2", 16)).await;
            let outcome = engine.backup(&sample(10)[..], "/r", &cancel).await.unwrap();
            engine.close().await.unwrap();
            outcome.backup_id
        };
        let engine = h.open(h.config("ecc/4x4", 16)).await;
        engine.ensure_family().await.unwrap();
        assert_matches!(
            engine.rebuild_backup(&id, &cancel).await,
            Err(Error::Config(_))
        );
    }
}
