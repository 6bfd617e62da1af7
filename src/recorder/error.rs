//! Recorder error types.

use super::records::RecordId;
use thiserror::Error;

/// Errors that can occur while recording exchanges.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Update for an id the recorder never issued.
    #[error("Unknown record id {0}")]
    UnknownRecord(RecordId),

    /// Failed to serialize a record to JSON.
    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend storage failure.
    #[error("Recorder storage error: {0}")]
    Storage(String),
}
