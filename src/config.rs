//! Reconciliation configuration.
//!
//! Defaults cover a full-corpus run. A JSON file may override any subset of
//! fields; command-line flags override the file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Largest accepted chunk size. A queued job binds one SQL parameter per
/// feature id, and SQLite caps bound parameters at 32766.
pub const MAX_CHUNK_SIZE: usize = 10_000;

/// Policy for picking one parent when a container intersects several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// First match in ascending-id order.
    #[default]
    SmallestId,
    /// Parent sharing the largest intersection area; equal areas fall back
    /// to the smallest id.
    LargestOverlap,
}

/// Configuration for the engine, dispatcher and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Features loaded per primary-key-ordered chunk, at most
    /// [`MAX_CHUNK_SIZE`].
    /// Default: 200
    pub chunk_size: usize,

    /// Maximum ids listed in a dry-run preview.
    /// Default: 20
    pub preview_limit: usize,

    /// Parent selection policy for container linking.
    /// Default: smallest id
    pub tie_break: TieBreak,

    /// Status value treated as validated and excluded from scans unless
    /// targeted by id. `None` scans every status.
    /// Default: Some(4)
    pub stable_status: Option<u8>,

    /// Parsed container geometries kept in memory.
    /// Default: 256
    pub geometry_cache_size: usize,

    /// Maximum hut-to-route distance for an association.
    /// Default: 1000.0 meters
    pub hut_distance_meters: f64,

    /// Maximum POI-to-route distance for an association.
    /// Default: 1000.0 meters
    pub poi_distance_meters: f64,

    /// Attempts before a queued job with a transient failure is abandoned.
    /// Default: 3
    pub max_attempts: u32,

    /// Queue used when none is given.
    /// Default: "geometric-computations"
    pub default_queue: String,

    /// How long a connection waits on a locked database.
    /// Default: 5000 ms
    pub busy_timeout_ms: u64,

    /// How long a claimed job may stay running before another worker may
    /// claim it again (its worker is presumed dead).
    /// Default: 600 s
    pub job_lease_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            preview_limit: 20,
            tie_break: TieBreak::SmallestId,
            stable_status: Some(4),
            geometry_cache_size: 256,
            hut_distance_meters: 1000.0,
            poi_distance_meters: 1000.0,
            max_attempts: 3,
            default_queue: "geometric-computations".to_string(),
            busy_timeout_ms: 5000,
            job_lease_secs: 600,
        }
    }
}

impl ReconcileConfig {
    /// Load a configuration from a JSON file; missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            ReconcileError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        check_chunk_size(self.chunk_size)?;
        if self.geometry_cache_size == 0 {
            return Err(ReconcileError::Config(
                "geometry_cache_size must be positive".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ReconcileError::Config("max_attempts must be positive".into()));
        }
        for (name, value) in [
            ("hut_distance_meters", self.hut_distance_meters),
            ("poi_distance_meters", self.poi_distance_meters),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ReconcileError::Config(format!(
                    "{} must be a non-negative distance",
                    name
                )));
            }
        }
        if self.default_queue.trim().is_empty() {
            return Err(ReconcileError::Config("default_queue must not be empty".into()));
        }
        if self.job_lease_secs == 0 {
            return Err(ReconcileError::Config("job_lease_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Chunk sizes must lie in `1..=MAX_CHUNK_SIZE`.
pub(crate) fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(ReconcileError::Config(format!(
            "chunk size must be between 1 and {} (got {})",
            MAX_CHUNK_SIZE, chunk_size
        )));
    }
    Ok(())
}
