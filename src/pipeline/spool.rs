//! Local fragment spool
//!
//! Outgoing fragments are written to `<root>/backups/<backupID>/` before
//! they are sent and removed once the manifest records them as stored.
//! Whatever remains after a crash is exactly the set of unacknowledged
//! fragments.

use std::io::ErrorKind;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::fragment::{Fragment, FragmentName};
use crate::domain::ports::BackupId;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct FragmentSpool {
    dir: PathBuf,
}

impl FragmentSpool {
    /// `root` is the service root; the spool lives in `root/backups`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            dir: root.into().join("backups"),
        }
    }

    pub fn backup_dir(&self, backup_id: &BackupId) -> PathBuf {
        self.dir.join(backup_id.as_str())
    }

    pub fn path_for(&self, name: &FragmentName) -> PathBuf {
        self.backup_dir(&name.backup_id).join(name.file_name())
    }

    /// Persist a fragment before it goes out
    pub async fn write(&self, fragment: &Fragment) -> Result<PathBuf> {
        let path = self.path_for(&fragment.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&fragment.bytes).await?;
        file.sync_all().await?;
        Ok(path)
    }

    pub async fn read(&self, name: &FragmentName) -> Result<Bytes> {
        Ok(Bytes::from(tokio::fs::read(self.path_for(name)).await?))
    }

    /// Drop a spooled fragment; missing files are fine
    pub async fn remove(&self, name: &FragmentName) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => {
                debug!(fragment = %name, "Removed spooled fragment");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the backup's spool directory once it is empty
    pub async fn remove_backup(&self, backup_id: &BackupId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.backup_dir(backup_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fragments still waiting for an acknowledgement
    pub async fn pending(&self, backup_id: &BackupId) -> Result<Vec<FragmentName>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.backup_dir(backup_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let full = format!("{}/{}", backup_id, file_name.to_string_lossy());
            if let Ok(name) = full.parse::<FragmentName>() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
