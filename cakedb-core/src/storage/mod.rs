//! Storage engine - coordinates all storage components

mod engine;

pub use engine::Engine;

use crate::compaction::CompactionConfig;
use crate::shard::ShardOptions;
use crate::{CakeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data directory
    pub data_dir: PathBuf,
    /// Shard bucket width in nanoseconds
    pub shard_duration: i64,
    /// Buffered bytes that trigger a flush
    pub flush_threshold: usize,
    /// Points the ingest queue holds before writers block
    pub ingest_queue_capacity: usize,
    /// Capacity of shard worker and merge queues
    pub pipeline_queue_capacity: usize,
    /// Idle time after which a shard worker finalizes its segment
    pub shard_idle_timeout: Duration,
    /// LZ4-compress flushed segments
    pub compress_flushes: bool,
    /// Threads reading segments for one query
    pub read_parallelism: usize,
    /// Compaction configuration
    pub compaction: CompactionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            shard_duration: crate::config::SHARD_DURATION_NANOS,
            flush_threshold: crate::config::FLUSH_THRESHOLD,
            ingest_queue_capacity: crate::config::INGEST_QUEUE_CAPACITY,
            pipeline_queue_capacity: crate::config::PIPELINE_QUEUE_CAPACITY,
            shard_idle_timeout: crate::config::SHARD_IDLE_TIMEOUT,
            compress_flushes: false,
            read_parallelism: crate::config::READ_PARALLELISM,
            compaction: CompactionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `data_dir`, everything else default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| CakeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_duration <= 0 {
            return Err(CakeError::Config("shard_duration must be positive".to_string()));
        }
        if self.flush_threshold == 0 {
            return Err(CakeError::Config("flush_threshold must be positive".to_string()));
        }
        if self.ingest_queue_capacity == 0
            || self.pipeline_queue_capacity == 0
            || self.compaction.pipeline_capacity == 0
        {
            return Err(CakeError::Config("queue capacities must be positive".to_string()));
        }
        if self.read_parallelism == 0 {
            return Err(CakeError::Config("read_parallelism must be positive".to_string()));
        }
        if self.compaction.enabled && self.compaction.interval.is_zero() {
            return Err(CakeError::Config("compaction interval must be positive".to_string()));
        }
        Ok(())
    }

    /// Device keys
    pub fn key_dir(&self) -> PathBuf {
        self.data_dir.join("key")
    }

    /// Segments
    pub fn value_dir(&self) -> PathBuf {
        self.data_dir.join("value")
    }

    /// Staging area for files before import
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.data_dir.join("quarantine")
    }

    pub(crate) fn shard_options(&self) -> ShardOptions {
        ShardOptions {
            shard_duration: self.shard_duration,
            compress: self.compress_flushes,
            queue_capacity: self.pipeline_queue_capacity,
            idle_timeout: self.shard_idle_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.shard_duration, 604_800_000_000_000);
        assert_eq!(config.flush_threshold, 100_000_000);
        assert_eq!(config.compaction.min_segments, 5);
        assert!(config.validate().is_ok());
        assert_eq!(config.value_dir(), PathBuf::from("data/value"));
    }

    #[test]
    fn test_from_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cakedb.json");
        std::fs::write(
            &path,
            r#"{"data_dir": "/var/lib/cakedb", "compress_flushes": true, "compaction": {"min_segments": 8}}"#,
        )
        .unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/cakedb"));
        assert!(config.compress_flushes);
        assert_eq!(config.compaction.min_segments, 8);
        assert_eq!(config.compaction.max_segment_size, 1_000_000_000);
        assert_eq!(config.flush_threshold, crate::config::FLUSH_THRESHOLD);
    }

    #[test]
    fn test_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, r#"{"shard_duration": 0}"#).unwrap();
        assert!(matches!(EngineConfig::from_json_file(&path), Err(CakeError::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(EngineConfig::from_json_file(&path), Err(CakeError::Config(_))));

        let config = EngineConfig {
            ingest_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            read_parallelism: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
