//! Configuration
//!
//! YAML settings file, every field optional. Durations are written as
//! `"2s"`, `"10m"`, `"1h30m"` or `"250ms"`; sizes as `"64KB"` or plain bytes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ports::PeerId;
use crate::ec::eccmap::{EccRegistry, DEFAULT_MAP};
use crate::error::{Error, Result};
use crate::index::IndexConfig;
use crate::placement::{HealthPolicy, PlacementConfig};
use crate::transfer::TransferConfig;
use crate::worker::PoolConfig;

// =============================================================================
// Settings
// =============================================================================

/// Top-level settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Local state directory (index, spool, key)
    pub root: PathBuf,

    /// ECC scheme for new families
    pub ecc_map: String,

    /// Data fragment payload per block; the block carries `D` of them
    pub fragment_size: String,

    /// Master key file, defaults to `<root>/master.key`
    pub key_file: Option<PathBuf>,

    pub workers: WorkerSettings,
    pub transfer: TransferSettings,
    pub health: HealthSettings,
    pub placement: PlacementSettings,
    pub index: IndexSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".raidmesh"),
            ecc_map: DEFAULT_MAP.to_string(),
            fragment_size: "64KB".to_string(),
            key_file: None,
            workers: WorkerSettings::default(),
            transfer: TransferSettings::default(),
            health: HealthSettings::default(),
            placement: PlacementSettings::default(),
            index: IndexSettings::default(),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    /// Worker threads; 0 means one per available CPU
    pub threads: usize,
    /// Bounded queue length; 0 means twice the thread count
    pub queue_capacity: usize,
}

/// Transfer scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferSettings {
    pub per_peer_concurrency: usize,
    pub total_concurrency: usize,
    pub initial_backoff: String,
    pub max_backoff: String,
    pub max_attempts: u32,
    pub fragment_timeout: String,
    pub block_timeout: String,
    pub upload_tolerance: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            per_peer_concurrency: 4,
            total_concurrency: 64,
            initial_backoff: "2s".to_string(),
            max_backoff: "5m".to_string(),
            max_attempts: 6,
            fragment_timeout: "60s".to_string(),
            block_timeout: "10m".to_string(),
            upload_tolerance: 0,
        }
    }
}

/// Supplier health thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSettings {
    pub suspect_after: u32,
    pub window: String,
    pub evict_after: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            suspect_after: 3,
            window: "10m".to_string(),
            evict_after: 2,
        }
    }
}

/// Supplier selection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlacementSettings {
    /// Preferred replacement peers, tried in order
    pub candidates: Vec<String>,
    /// Known peers advertised through the static DHT
    pub known_peers: Vec<String>,
    pub probe_timeout: String,
    /// Automatic replacements allowed at once; defaults to the scheme's limit
    pub max_pending_replacements: Option<usize>,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            known_peers: Vec::new(),
            probe_timeout: "10s".to_string(),
            max_pending_replacements: None,
        }
    }
}

/// Directory index settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexSettings {
    /// WAL records between snapshot checkpoints
    pub checkpoint_every: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            checkpoint_every: 1024,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check every field that can be checked without touching the network
    pub fn validate(&self) -> Result<()> {
        let registry = EccRegistry::builtin();
        if registry.lookup(&self.ecc_map).is_err() {
            return Err(Error::UnknownMap(format!(
                "{} (known: {})",
                self.ecc_map,
                registry.names().join(", ")
            )));
        }
        if self.fragment_size_bytes()? == 0 {
            return Err(Error::Config("fragmentSize must be positive".into()));
        }
        self.pool_config()?;
        self.transfer_config()?;
        self.health_policy()?;
        self.placement_config()?;
        if self.index.checkpoint_every == 0 {
            return Err(Error::Config("index.checkpointEvery must be positive".into()));
        }
        Ok(())
    }

    pub fn fragment_size_bytes(&self) -> Result<usize> {
        parse_size(&self.fragment_size)
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.root.join("master.key"))
    }

    pub fn pool_config(&self) -> Result<PoolConfig> {
        let mut config = PoolConfig::default();
        if self.workers.threads > 0 {
            config.workers = self.workers.threads;
        }
        config.queue_capacity = if self.workers.queue_capacity > 0 {
            self.workers.queue_capacity
        } else {
            config.workers * 2
        };
        if config.queue_capacity < config.workers {
            return Err(Error::Config(format!(
                "workers.queueCapacity ({}) must be at least the thread count ({})",
                config.queue_capacity, config.workers
            )));
        }
        Ok(config)
    }

    pub fn transfer_config(&self) -> Result<TransferConfig> {
        let t = &self.transfer;
        if t.per_peer_concurrency == 0 || t.total_concurrency == 0 {
            return Err(Error::Config("transfer concurrency caps must be positive".into()));
        }
        if t.max_attempts == 0 {
            return Err(Error::Config("transfer.maxAttempts must be positive".into()));
        }
        Ok(TransferConfig {
            per_peer_concurrency: t.per_peer_concurrency,
            total_concurrency: t.total_concurrency,
            initial_backoff: parse_duration(&t.initial_backoff)?,
            max_backoff: parse_duration(&t.max_backoff)?,
            max_attempts: t.max_attempts,
            fragment_timeout: parse_duration(&t.fragment_timeout)?,
            block_timeout: parse_duration(&t.block_timeout)?,
            upload_tolerance: t.upload_tolerance,
        })
    }

    pub fn health_policy(&self) -> Result<HealthPolicy> {
        Ok(HealthPolicy {
            suspect_after: self.health.suspect_after.max(1),
            window: parse_duration(&self.health.window)?,
            evict_after: self.health.evict_after.max(1),
        })
    }

    pub fn placement_config(&self) -> Result<PlacementConfig> {
        Ok(PlacementConfig {
            candidates: self
                .placement
                .candidates
                .iter()
                .map(|c| PeerId::from(c.as_str()))
                .collect(),
            probe_timeout: parse_duration(&self.placement.probe_timeout)?,
            max_pending_replacements: self.placement.max_pending_replacements,
            health: self.health_policy()?,
        })
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            dir: self.root.join("index"),
            checkpoint_every: self.index.checkpoint_every,
        }
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Parse a duration string like "1h30m", "2s", "250ms" or "7d"
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut num_buf = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            num_buf.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c.to_ascii_lowercase());
            chars.next();
        }
        if num_buf.is_empty() {
            return Err(Error::DurationParse(format!(
                "invalid number in duration: {}",
                s
            )));
        }
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;

        total += match unit.as_str() {
            "ms" => Duration::from_millis(num),
            "" | "s" => Duration::from_secs(num),
            "m" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 3600),
            "d" => Duration::from_secs(num * 86400),
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };
    }

    Ok(total)
}

/// Parse a size such as "64KB", "1 MB", "512" (bytes)
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let num: usize = num
        .parse()
        .map_err(|_| Error::Config(format!("invalid size: {:?}", s)))?;
    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        other => return Err(Error::Config(format!("unknown size unit: {}", other))),
    };
    Ok(num * multiplier)
}

// =============================================================================
// Tests
// =============================================================================
