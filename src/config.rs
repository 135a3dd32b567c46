use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

const KIB: u32 = 1024;
const MIB: u32 = 1024 * KIB;

/// Top-level configuration of the backup pipeline.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub chunker: ChunkerConfig,
    /// zstd level used for blob payloads.
    pub compression_level: i32,
    pub full_backup: FullBackupConfig,
    pub restore: RestoreConfig,
    pub snapshot_retry: RetryConfig,
    /// Where the persistent blob cache lives. Without it, only snapshots
    /// on the backend seed the dedup cache.
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            compression_level: 3,
            full_backup: FullBackupConfig::default(),
            restore: RestoreConfig::default(),
            snapshot_retry: RetryConfig::default(),
            cache_dir: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunker.validate()?;
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::Config(format!(
                "compression_level must be within 1..=22, got {}",
                self.compression_level
            )));
        }
        if self.full_backup.read_buffer_size == 0 {
            return Err(Error::Config("full_backup.read_buffer_size must not be 0".into()));
        }
        if self.restore.max_segment_length == 0 {
            return Err(Error::Config("restore.max_segment_length must not be 0".into()));
        }
        if self.snapshot_retry.max_attempts == 0 {
            return Err(Error::Config("snapshot_retry.max_attempts must not be 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkerConfig {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 1536 * KIB,
            avg_size: 3 * MIB,
            max_size: 7680 * KIB,
        }
    }
}

impl ChunkerConfig {
    pub const MINIMUM_MIN: u32 = 64;

    pub fn validate(&self) -> Result<()> {
        if self.min_size < Self::MINIMUM_MIN {
            return Err(Error::Config(format!(
                "chunker.min_size must be at least {}",
                Self::MINIMUM_MIN
            )));
        }
        if self.min_size >= self.avg_size || self.avg_size >= self.max_size {
            return Err(Error::Config(format!(
                "chunker sizes must satisfy min < avg < max, got {}/{}/{}",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FullBackupConfig {
    pub quota: u64,
    pub unlimited: bool,
    pub read_buffer_size: usize,
}

/// Default quota for one app's full backup.
pub const DEFAULT_QUOTA_FULL_BACKUP: u64 = 2 * (25 * MIB as u64);

impl Default for FullBackupConfig {
    fn default() -> Self {
        Self {
            quota: DEFAULT_QUOTA_FULL_BACKUP,
            unlimited: false,
            read_buffer_size: 64 * KIB as usize,
        }
    }
}

impl FullBackupConfig {
    pub fn effective_quota(&self) -> u64 {
        if self.unlimited {
            u64::MAX
        } else {
            self.quota
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestoreConfig {
    pub max_segment_length: usize,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            max_segment_length: 64 * KIB as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}
