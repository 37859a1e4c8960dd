//! Codec jobs
//!
//! Jobs are plain data: a closed set of variants carrying the bytes and
//! the ECC map they operate on. Nothing executable crosses the queue.

use std::sync::Arc;

use bytes::Bytes;

use crate::domain::ports::BackupId;
use crate::ec::{join, EccMap, EncodedBlock, FragmentCodec, RebuiltBlock};
use crate::error::Result;

/// Work item for the pool
#[derive(Debug, Clone)]
pub enum Job {
    /// Split a sealed block into data and parity fragments
    Make {
        backup_id: BackupId,
        block_number: u64,
        map: Arc<EccMap>,
        sealed: Bytes,
        fragment_size: usize,
    },

    /// Recover the sealed block from a partial fragment set
    Read {
        backup_id: BackupId,
        block_number: u64,
        map: Arc<EccMap>,
        data: Vec<Option<Bytes>>,
        parity: Vec<Option<Bytes>>,
        sealed_len: usize,
    },

    /// Regenerate missing data and parity fragments
    Rebuild {
        backup_id: BackupId,
        block_number: u64,
        map: Arc<EccMap>,
        data: Vec<Option<Bytes>>,
        parity: Vec<Option<Bytes>>,
    },
}

/// Typed result of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    Made(EncodedBlock),
    Read { sealed: Bytes, degraded: bool },
    Rebuilt(RebuiltBlock),
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Make { .. } => "make",
            Job::Read { .. } => "read",
            Job::Rebuild { .. } => "rebuild",
        }
    }

    pub fn backup_id(&self) -> &BackupId {
        match self {
            Job::Make { backup_id, .. }
            | Job::Read { backup_id, .. }
            | Job::Rebuild { backup_id, .. } => backup_id,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            Job::Make { block_number, .. }
            | Job::Read { block_number, .. }
            | Job::Rebuild { block_number, .. } => *block_number,
        }
    }

    /// Run on the calling thread
    pub fn run(self) -> Result<JobOutput> {
        match self {
            Job::Make {
                backup_id,
                block_number,
                map,
                sealed,
                fragment_size,
            } => FragmentCodec::new(map)
                .encode(&sealed, fragment_size)
                .map(JobOutput::Made)
                .map_err(|e| e.at(backup_id.as_str(), block_number)),

            Job::Read {
                backup_id,
                block_number,
                map,
                data,
                parity,
                sealed_len,
            } => {
                let degraded = data.iter().any(Option::is_none);
                let recovered = FragmentCodec::new(map)
                    .decode(data, parity)
                    .map_err(|e| e.at(backup_id.as_str(), block_number))?;
                Ok(JobOutput::Read {
                    sealed: join(&recovered, sealed_len),
                    degraded,
                })
            }

            Job::Rebuild {
                backup_id,
                block_number,
                map,
                data,
                parity,
            } => FragmentCodec::new(map)
                .rebuild(data, parity)
                .map(JobOutput::Rebuilt)
                .map_err(|e| e.at(backup_id.as_str(), block_number)),
        }
    }
}
