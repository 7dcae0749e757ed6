//! Replicator settings for Olivine
//!
//! The hosting process hands the log pipeline one [`ReplicatorSettings`]
//! value at startup. Sources, in precedence order:
//! 1. Explicit overrides from the host
//! 2. `olivine.toml` (when the host points the loader at one)
//! 3. Built-in defaults
//!
//! Sizes are expressed in megabytes at the boundary (operators think in
//! MB); the pipeline consumes the derived byte quantities through the
//! accessor methods.

use serde::{Deserialize, Serialize};

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::load_from_path;

const MB: u64 = 1024 * 1024;

/// Tuning knobs for the log pipeline.
///
/// The checkpoint/truncation policy engine reads these thresholds on every
/// flush-progress notification; they are plain data, not live-reloadable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReplicatorSettings {
    /// New log data (MB) that triggers a checkpoint.
    pub checkpoint_threshold_mb: u64,

    /// Floor on the retained log (MB) after a head truncation.
    pub min_log_size_mb: u64,

    /// Multiplier of `min_log_size_mb` at which head truncation becomes
    /// eligible.
    pub truncation_threshold_factor: u64,

    /// Multiplier of `min_log_size_mb` at which producers are throttled.
    /// Must exceed `truncation_threshold_factor`.
    pub throttling_threshold_factor: u64,

    /// Absolute cap on the log stream (MB).
    pub max_stream_size_mb: u64,

    /// Progress vector length above which trimming kicks in. Zero disables
    /// trimming.
    pub progress_vector_max_entries: usize,

    /// Budget (KB) for diagnostic renderings of the progress vector.
    pub progress_vector_max_string_kb: u64,

    /// Chunk size of the in-memory log, in bytes.
    pub chunk_size_bytes: u64,
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            checkpoint_threshold_mb: 50,
            min_log_size_mb: 2,
            truncation_threshold_factor: 2,
            throttling_threshold_factor: 4,
            max_stream_size_mb: 1024,
            progress_vector_max_entries: 1000,
            progress_vector_max_string_kb: 64,
            chunk_size_bytes: 64 * 1024,
        }
    }
}

impl ReplicatorSettings {
    pub fn checkpoint_threshold_bytes(&self) -> u64 {
        self.checkpoint_threshold_mb * MB
    }

    pub fn min_log_size_bytes(&self) -> u64 {
        self.min_log_size_mb * MB
    }

    /// Log size beyond which a head truncation is worth proposing.
    pub fn truncation_threshold_bytes(&self) -> u64 {
        self.min_log_size_mb * self.truncation_threshold_factor * MB
    }

    /// Log size beyond which producers are told to back off.
    pub fn throttle_threshold_bytes(&self) -> u64 {
        self.min_log_size_mb * self.throttling_threshold_factor * MB
    }

    pub fn max_stream_size_bytes(&self) -> u64 {
        self.max_stream_size_mb * MB
    }

    /// Rejects settings whose derived thresholds are contradictory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size_bytes == 0 {
            return Err(ConfigError::Validation(
                "chunk_size_bytes must be non-zero".to_string(),
            ));
        }
        if self.min_log_size_mb == 0 {
            return Err(ConfigError::Validation(
                "min_log_size_mb must be non-zero".to_string(),
            ));
        }
        if self.truncation_threshold_factor < 1 {
            return Err(ConfigError::Validation(
                "truncation_threshold_factor must be at least 1".to_string(),
            ));
        }
        if self.throttling_threshold_factor <= self.truncation_threshold_factor {
            return Err(ConfigError::Validation(format!(
                "throttling_threshold_factor ({}) must exceed truncation_threshold_factor ({})",
                self.throttling_threshold_factor, self.truncation_threshold_factor
            )));
        }
        if self.max_stream_size_mb < self.checkpoint_threshold_mb {
            return Err(ConfigError::Validation(format!(
                "max_stream_size_mb ({}) must be at least checkpoint_threshold_mb ({})",
                self.max_stream_size_mb, self.checkpoint_threshold_mb
            )));
        }
        Ok(())
    }
}
