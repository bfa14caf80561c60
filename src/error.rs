//! Unified error handling for the territory reconciler.
//!
//! Per-feature failures (bad geometry, a store error while writing one
//! feature) are caught by the engine and aggregated into reports. Only
//! configuration errors abort an operation before any work starts.

use thiserror::Error;

use crate::{ContainerLevel, FeatureKind};

/// Unified error type for reconciliation operations.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Geometry is null, empty, malformed or fails validity checks.
    #[error("Invalid geometry for {feature}: {reason}")]
    InvalidGeometry { feature: String, reason: String },

    /// A feature, container or job referenced by id does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: i64 },

    /// Storage failure (busy database, I/O, constraint other than the pair key).
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Invalid arguments or configuration; raised before any work starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job payload could not be encoded or decoded.
    #[error("Queue error: {0}")]
    Queue(String),
}

impl ReconcileError {
    /// Build an invalid-geometry error for a feature.
    pub fn invalid_feature_geometry(kind: FeatureKind, id: i64, reason: impl Into<String>) -> Self {
        ReconcileError::InvalidGeometry {
            feature: format!("{} {}", kind.as_str(), id),
            reason: reason.into(),
        }
    }

    /// Build an invalid-geometry error for a container.
    pub fn invalid_container_geometry(
        level: ContainerLevel,
        id: i64,
        reason: impl Into<String>,
    ) -> Self {
        ReconcileError::InvalidGeometry {
            feature: format!("{} {}", level.singular(), id),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same unit of work may succeed.
    ///
    /// Only store failures qualify; invalid geometry and missing records
    /// fail the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Store(_))
    }
}

impl From<rmp_serde::encode::Error> for ReconcileError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ReconcileError::Queue(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ReconcileError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ReconcileError::Queue(e.to_string())
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Extension trait for converting Option to ReconcileError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a not-found error.
    fn ok_or_not_found(self, entity: &str, id: i64) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, entity: &str, id: i64) -> Result<T> {
        self.ok_or_else(|| ReconcileError::NotFound {
            entity: entity.to_string(),
            id,
        })
    }
}
