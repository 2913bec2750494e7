//! Transfer configuration.
//!
//! Read from a JSON file; every field is optional and falls back to the
//! defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stowage_hashing::HashCheck;
use tracing::debug;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Resumable chunk sizes must be a multiple of this.
pub const CHUNK_GRANULARITY: usize = 256 * 1024;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Where tracker files live; `None` uses the per-user state directory.
    pub tracker_dir: Option<PathBuf>,

    /// Objects at least this large transfer resumably.
    pub resumable_threshold: u64,

    /// Bytes sent per resumable upload request.
    pub resumable_chunk_size: usize,

    /// Files at least this large upload as parallel components; 0 disables.
    pub parallel_composite_upload_threshold: u64,

    /// Target size of one parallel upload component.
    pub parallel_composite_component_size: u64,

    /// Files below this size are never split, whatever the threshold says.
    pub parallel_composite_min_size: u64,

    /// Most sources a single compose request accepts.
    pub max_compose_arity: usize,

    /// Consecutive failed attempts without new bytes before giving up.
    pub max_progressless_retries: u32,

    /// Upper bound on the wait between retries, in seconds.
    pub max_retry_delay_secs: f64,

    /// Concurrent component uploads.
    pub worker_count: usize,

    pub hash_check: HashCheck,

    /// Bytes a daisy-chained copy may hold in memory.
    pub daisy_chain_buffer_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            tracker_dir: None,
            resumable_threshold: 8 * MIB,
            resumable_chunk_size: 4 * MIB as usize,
            parallel_composite_upload_threshold: 150 * MIB,
            parallel_composite_component_size: 50 * MIB,
            parallel_composite_min_size: 8 * MIB,
            max_compose_arity: 32,
            max_progressless_retries: 23,
            max_retry_delay_secs: 32.0,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            hash_check: HashCheck::IfAvailable,
            daisy_chain_buffer_size: MIB as usize,
        }
    }
}

impl TransferConfig {
    /// Loads and validates `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no transfer config, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        debug!(path = %path.display(), "loaded transfer config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resumable_chunk_size == 0 || self.resumable_chunk_size % CHUNK_GRANULARITY != 0 {
            return Err(ConfigError::Invalid {
                field: "resumable_chunk_size",
                reason: format!("must be a positive multiple of {CHUNK_GRANULARITY}"),
            });
        }
        if self.parallel_composite_component_size == 0 {
            return Err(ConfigError::Invalid {
                field: "parallel_composite_component_size",
                reason: "must be positive".into(),
            });
        }
        if self.max_compose_arity < 2 {
            return Err(ConfigError::Invalid {
                field: "max_compose_arity",
                reason: "must be at least 2".into(),
            });
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_count",
                reason: "must be at least 1".into(),
            });
        }
        if !self.max_retry_delay_secs.is_finite() || self.max_retry_delay_secs < 0.0 {
            return Err(ConfigError::Invalid {
                field: "max_retry_delay_secs",
                reason: "must be a non-negative number".into(),
            });
        }
        if self.daisy_chain_buffer_size < 2 * crate::TRANSFER_BUFFER_SIZE {
            return Err(ConfigError::Invalid {
                field: "daisy_chain_buffer_size",
                reason: format!("must hold at least two {}-byte chunks", crate::TRANSFER_BUFFER_SIZE),
            });
        }
        Ok(())
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_retry_delay_secs)
    }

    /// Whether a file of `size` bytes should be split into components.
    pub fn wants_parallel_upload(&self, size: u64, threshold: Option<u64>) -> bool {
        let threshold = threshold.unwrap_or(self.parallel_composite_upload_threshold);
        threshold > 0 && size >= threshold && size >= self.parallel_composite_min_size
    }
}
