//! Recording of completed exchanges and WebSocket messages.
//!
//! The proxy reports every exchange to a [`Recorder`]: an `append_record`
//! when the request arrives, an `update_record` once the response is known,
//! and one `update_ws_message` per relayed WebSocket frame.
//!
//! # Failure Model
//!
//! Recording never affects traffic. [`RecorderHandle`] swallows recorder
//! errors (logging them) and maps them to [`SKIP_RECORD`]; a negative id
//! suppresses all later updates for that exchange.
//!
//! # Implementations
//!
//! - [`MemoryRecorder`]: keeps everything in memory, for tests and embedding
//! - [`TracingRecorder`]: JSON lines on the `eden_proxy::records` target

mod error;
mod memory;
mod records;
mod tracing_log;

pub use error::RecorderError;
pub use memory::MemoryRecorder;
pub use records::{
    BIG_STREAM_MARKER, RecordId, RecordedBody, ResourceInfo, SKIP_RECORD, WsMessage, WsPayload,
    headers_to_map,
};
pub use tracing_log::{RECORDS_TARGET, TracingRecorder};

use std::sync::Arc;
use tracing::error;

/// Sink for recorded exchanges.
pub trait Recorder: Send + Sync {
    /// Store a new exchange and return its id.
    fn append_record(&self, info: &ResourceInfo) -> Result<RecordId, RecorderError>;

    /// Replace a stored exchange.
    fn update_record(&self, id: RecordId, info: &ResourceInfo) -> Result<(), RecorderError>;

    /// Attach a WebSocket message to a stored exchange.
    fn update_ws_message(&self, id: RecordId, message: &WsMessage) -> Result<(), RecorderError>;
}

/// Shared, failure-tolerant recorder handle.
#[derive(Clone, Default)]
pub struct RecorderHandle {
    inner: Option<Arc<dyn Recorder>>,
}

impl RecorderHandle {
    /// Record into `recorder`.
    pub fn new(recorder: Arc<dyn Recorder>) -> Self {
        Self {
            inner: Some(recorder),
        }
    }

    /// A handle that records nothing.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Whether a recorder is attached.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Append a record; returns [`SKIP_RECORD`] when disabled or on failure.
    pub fn append(&self, info: &ResourceInfo) -> RecordId {
        let Some(recorder) = &self.inner else {
            return SKIP_RECORD;
        };
        match recorder.append_record(info) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to append record for {}: {}", info.url, e);
                SKIP_RECORD
            }
        }
    }

    /// Update a record unless `id` is negative.
    pub fn update(&self, id: RecordId, info: &ResourceInfo) {
        if id < 0 {
            return;
        }
        if let Some(recorder) = &self.inner
            && let Err(e) = recorder.update_record(id, info)
        {
            error!("Failed to update record {}: {}", id, e);
        }
    }

    /// Attach a WebSocket message unless `id` is negative.
    pub fn ws_message(&self, id: RecordId, message: &WsMessage) {
        if id < 0 {
            return;
        }
        if let Some(recorder) = &self.inner
            && let Err(e) = recorder.update_ws_message(id, message)
        {
            error!("Failed to record WebSocket message for {}: {}", id, e);
        }
    }
}

impl std::fmt::Debug for RecorderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderHandle")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
