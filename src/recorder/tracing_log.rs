//! Recorder that emits every record as a JSON log line.
//!
//! Lines go to the `eden_proxy::records` tracing target at INFO level, so they
//! can be routed or filtered independently of the diagnostic logs:
//!
//! ```text
//! RUST_LOG=warn,eden_proxy::records=info eden-proxy -p 8001
//! ```
//!
//! Each line carries an ISO8601 timestamp and the record id:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"append","id":7,"record":{"host":"example.test",...}}
//! ```

use super::Recorder;
use super::error::RecorderError;
use super::records::{RecordId, ResourceInfo, WsMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;

/// Tracing target records are emitted on.
pub const RECORDS_TARGET: &str = "eden_proxy::records";

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RecordEvent<'a> {
    Append { id: RecordId, record: &'a ResourceInfo },
    Update { id: RecordId, record: &'a ResourceInfo },
    WsMessage { id: RecordId, message: &'a WsMessage },
}

#[derive(Serialize)]
struct TimestampedEvent<'a> {
    #[serde(rename = "ts")]
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: RecordEvent<'a>,
}

/// Recorder backed by the tracing pipeline.
#[derive(Debug, Default)]
pub struct TracingRecorder {
    next_id: AtomicI64,
}

impl TracingRecorder {
    /// Create a recorder; ids start at 1.
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: RecordEvent<'_>) -> Result<(), RecorderError> {
        let json = Self::render(event)?;
        info!(target: RECORDS_TARGET, "{}", json);
        Ok(())
    }

    fn render(event: RecordEvent<'_>) -> Result<String, RecorderError> {
        let timestamped = TimestampedEvent {
            timestamp: Utc::now(),
            event,
        };
        Ok(serde_json::to_string(&timestamped)?)
    }
}

impl Recorder for TracingRecorder {
    fn append_record(&self, info: &ResourceInfo) -> Result<RecordId, RecorderError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(RecordEvent::Append { id, record: info })?;
        Ok(id)
    }

    fn update_record(&self, id: RecordId, info: &ResourceInfo) -> Result<(), RecorderError> {
        self.emit(RecordEvent::Update { id, record: info })
    }

    fn update_ws_message(&self, id: RecordId, message: &WsMessage) -> Result<(), RecorderError> {
        self.emit(RecordEvent::WsMessage { id, message })
    }
}
