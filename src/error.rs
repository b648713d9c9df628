use thiserror::Error;

use crate::db::models::LaneKey;

/// Failures of the ingestion and detection core.
///
/// `DuplicateSnapshot` and `CycleInProgress` are expected outcomes that
/// callers swallow or report; `DetectionInvariantViolation` halts a lane.
#[derive(Debug, Error)]
pub enum LineError {
    #[error("duplicate snapshot for {lane} at {observed_at}")]
    DuplicateSnapshot {
        lane: LaneKey,
        observed_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("provider '{provider}' failed for event {event_id}: {message}")]
    ProviderFetch {
        provider: String,
        event_id: String,
        message: String,
    },

    #[error("an ingestion cycle is already in progress")]
    CycleInProgress,

    #[error("detection invariant violated on {lane}: {reason}")]
    DetectionInvariantViolation { lane: LaneKey, reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LineError>;

impl LineError {
    /// Short machine-readable label used in cycle reports
    pub fn kind(&self) -> &'static str {
        match self {
            LineError::DuplicateSnapshot { .. } => "duplicate_snapshot",
            LineError::NotFound(_) => "not_found",
            LineError::MalformedSnapshot(_) => "malformed_snapshot",
            LineError::ProviderFetch { .. } => "provider_fetch",
            LineError::CycleInProgress => "cycle_in_progress",
            LineError::DetectionInvariantViolation { .. } => "detection",
            LineError::Database(_) | LineError::Json(_) => "storage",
        }
    }
}
