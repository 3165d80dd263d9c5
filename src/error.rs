//! Error taxonomy for the governance engine.

use thiserror::Error;

/// Errors surfaced by the governance engine.
///
/// Batch passes (decay, consolidation, calibration) apply partial-failure
/// semantics and only return an error when the pass as a whole cannot run;
/// single malformed records are logged and skipped. Autonomy writes are
/// all-or-nothing and surface the taxonomy below directly.
#[derive(Debug, Error)]
pub enum WardenError {
    /// Malformed input: out-of-range level, bad confidence, missing field.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A pending transition already exists for the key, or a consolidation
    /// claim is already held.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A calibration window had fewer samples than the configured minimum.
    #[error("insufficient data: {observed} of {required} required samples")]
    InsufficientData { observed: u64, required: u64 },

    /// Unknown procedure, pattern, or transition id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WardenError {
    /// Shorthand for a [`WardenError::NotFound`] with the given kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
