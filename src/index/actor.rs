//! Index actor
//!
//! The [`DirectoryIndex`] lives on one dedicated thread. Everyone else
//! holds a cloneable [`IndexHandle`] and talks to it with commands that
//! carry a oneshot reply channel; the single writer is structural.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::manifest::{BackupRecord, BlockManifest};
use super::store::{BackupSummary, DirectoryIndex};
use super::IndexConfig;
use crate::domain::ports::{BackupId, PeerId};
use crate::error::{Error, Result};

const COMMAND_QUEUE: usize = 256;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests understood by the index actor
#[derive(Debug)]
pub enum IndexCommand {
    CreateBackup {
        record: BackupRecord,
        reply: Reply<()>,
    },
    RecordManifest {
        backup_id: BackupId,
        manifest: BlockManifest,
        reply: Reply<()>,
    },
    MarkStored {
        backup_id: BackupId,
        block_number: u64,
        position: usize,
        peer_id: PeerId,
        reply: Reply<()>,
    },
    MarkLost {
        backup_id: BackupId,
        block_number: u64,
        position: usize,
        reply: Reply<()>,
    },
    FinishBackup {
        backup_id: BackupId,
        blocks: u64,
        bytes: u64,
        reply: Reply<()>,
    },
    ForgetBackup {
        backup_id: BackupId,
        reply: Reply<()>,
    },
    Backup {
        backup_id: BackupId,
        reply: Reply<Option<BackupRecord>>,
    },
    ListBackups {
        reply: Reply<Vec<BackupSummary>>,
    },
    BackupsForPath {
        path: String,
        reply: Reply<Vec<BackupId>>,
    },
    Checkpoint {
        reply: Reply<()>,
    },
    /// Checkpoint and stop the actor
    Close {
        reply: Reply<()>,
    },
}

/// Client side of the index actor
#[derive(Debug, Clone)]
pub struct IndexHandle {
    tx: mpsc::Sender<IndexCommand>,
}

impl IndexHandle {
    /// Open the index on its own thread; fails if loading fails
    pub async fn open(config: IndexConfig) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<IndexCommand>(COMMAND_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("raidmesh-index".to_string())
            .spawn(move || {
                let mut index = match DirectoryIndex::open(&config) {
                    Ok(index) => {
                        let _ = ready_tx.send(Ok(()));
                        index
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while let Some(command) = rx.blocking_recv() {
                    if !handle(&mut index, command) {
                        break;
                    }
                }
                debug!("Index actor stopped");
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Internal("index actor exited during startup".into()))??;
        Ok(Self { tx })
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> IndexCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| Error::Internal("index actor is gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("index actor dropped the request".into()))?
    }

    pub async fn create_backup(&self, record: BackupRecord) -> Result<()> {
        self.call(|reply| IndexCommand::CreateBackup { record, reply })
            .await
    }

    /// Append the manifest of a new block, all fragments `Pending`
    pub async fn record_manifest(&self, backup_id: &BackupId, manifest: BlockManifest) -> Result<()> {
        let backup_id = backup_id.clone();
        self.call(|reply| IndexCommand::RecordManifest {
            backup_id,
            manifest,
            reply,
        })
        .await
    }

    /// Record an acknowledged fragment; durable when this returns
    pub async fn mark_stored(
        &self,
        backup_id: &BackupId,
        block_number: u64,
        position: usize,
        peer_id: PeerId,
    ) -> Result<()> {
        let backup_id = backup_id.clone();
        self.call(|reply| IndexCommand::MarkStored {
            backup_id,
            block_number,
            position,
            peer_id,
            reply,
        })
        .await
    }

    pub async fn mark_lost(&self, backup_id: &BackupId, block_number: u64, position: usize) -> Result<()> {
        let backup_id = backup_id.clone();
        self.call(|reply| IndexCommand::MarkLost {
            backup_id,
            block_number,
            position,
            reply,
        })
        .await
    }

    pub async fn finish_backup(&self, backup_id: &BackupId, blocks: u64, bytes: u64) -> Result<()> {
        let backup_id = backup_id.clone();
        self.call(|reply| IndexCommand::FinishBackup {
            backup_id,
            blocks,
            bytes,
            reply,
        })
        .await
    }

    pub async fn forget_backup(&self, backup_id: &BackupId) -> Result<()> {
        let backup_id = backup_id.clone();
        self.call(|reply| IndexCommand::ForgetBackup { backup_id, reply })
            .await
    }

    pub async fn backup(&self, backup_id: &BackupId) -> Result<Option<BackupRecord>> {
        let backup_id = backup_id.clone();
        self.call(|reply| IndexCommand::Backup { backup_id, reply })
            .await
    }

    /// Like [`backup`](Self::backup) but unknown ids are an error
    pub async fn require(&self, backup_id: &BackupId) -> Result<BackupRecord> {
        self.backup(backup_id)
            .await?
            .ok_or_else(|| Error::UnknownBackup(backup_id.to_string()))
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupSummary>> {
        self.call(|reply| IndexCommand::ListBackups { reply }).await
    }

    pub async fn backups_for_path(&self, path: &str) -> Result<Vec<BackupId>> {
        let path = path.to_string();
        self.call(|reply| IndexCommand::BackupsForPath { path, reply })
            .await
    }

    pub async fn checkpoint(&self) -> Result<()> {
        self.call(|reply| IndexCommand::Checkpoint { reply }).await
    }

    /// Checkpoint and stop the actor; other handles start failing
    pub async fn close(&self) -> Result<()> {
        self.call(|reply| IndexCommand::Close { reply }).await
    }
}

/// Run one command; returns false when the actor should stop
fn handle(index: &mut DirectoryIndex, command: IndexCommand) -> bool {
    fn send<T>(reply: Reply<T>, result: Result<T>) {
        if let Err(Err(e)) = reply.send(result) {
            error!(error = %e, "Index request abandoned before its error was delivered");
        }
    }

    match command {
        IndexCommand::CreateBackup { record, reply } => send(reply, index.create_backup(record)),
        IndexCommand::RecordManifest {
            backup_id,
            manifest,
            reply,
        } => send(reply, index.record_manifest(&backup_id, manifest)),
        IndexCommand::MarkStored {
            backup_id,
            block_number,
            position,
            peer_id,
            reply,
        } => send(
            reply,
            index.mark_stored(&backup_id, block_number, position, peer_id),
        ),
        IndexCommand::MarkLost {
            backup_id,
            block_number,
            position,
            reply,
        } => send(reply, index.mark_lost(&backup_id, block_number, position)),
        IndexCommand::FinishBackup {
            backup_id,
            blocks,
            bytes,
            reply,
        } => send(reply, index.finish_backup(&backup_id, blocks, bytes)),
        IndexCommand::ForgetBackup { backup_id, reply } => {
            send(reply, index.forget_backup(&backup_id))
        }
        IndexCommand::Backup { backup_id, reply } => {
            send(reply, Ok(index.backup(&backup_id).cloned()))
        }
        IndexCommand::ListBackups { reply } => send(reply, Ok(index.list_backups())),
        IndexCommand::BackupsForPath { path, reply } => {
            send(reply, Ok(index.backups_for_path(&path)))
        }
        IndexCommand::Checkpoint { reply } => send(reply, index.checkpoint()),
        IndexCommand::Close { reply } => {
            send(reply, index.checkpoint());
            return false;
        }
    }
    true
}
