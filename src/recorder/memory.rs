//! In-memory recorder.

use super::Recorder;
use super::error::RecorderError;
use super::records::{RecordId, ResourceInfo, WsMessage};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

/// Keeps every record and WebSocket message in process memory.
///
/// Nothing is ever evicted; intended for tests and short debugging sessions.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    next_id: AtomicI64,
    records: Mutex<HashMap<RecordId, ResourceInfo>>,
    ws_messages: Mutex<HashMap<RecordId, Vec<WsMessage>>>,
}

impl MemoryRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of a record.
    pub fn get(&self, id: RecordId) -> Option<ResourceInfo> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    /// All records ordered by id.
    pub fn records(&self) -> Vec<(RecordId, ResourceInfo)> {
        let mut all: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// WebSocket messages recorded for an exchange, in relay order.
    pub fn ws_messages(&self, id: RecordId) -> Vec<WsMessage> {
        self.ws_messages
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

impl Recorder for MemoryRecorder {
    fn append_record(&self, info: &ResourceInfo) -> Result<RecordId, RecorderError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.records.lock().unwrap().insert(id, info.clone());
        Ok(id)
    }

    fn update_record(&self, id: RecordId, info: &ResourceInfo) -> Result<(), RecorderError> {
        let mut records = self.records.lock().unwrap();
        let slot = records.get_mut(&id).ok_or(RecorderError::UnknownRecord(id))?;
        *slot = info.clone();
        Ok(())
    }

    fn update_ws_message(&self, id: RecordId, message: &WsMessage) -> Result<(), RecorderError> {
        if !self.records.lock().unwrap().contains_key(&id) {
            return Err(RecorderError::UnknownRecord(id));
        }
        self.ws_messages
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::hooks::Protocol;
    use hyper::HeaderMap;

    fn sample() -> ResourceInfo {
        ResourceInfo::started(
            Protocol::Https,
            "GET",
            "example.test",
            "/",
            "https://example.test/",
            &HeaderMap::new(),
        )
    }

    #[test]
    fn test_ids_are_positive_and_increasing() {
        let recorder = MemoryRecorder::new();
        let first = recorder.append_record(&sample()).unwrap();
        let second = recorder.append_record(&sample()).unwrap();

        assert!(first > 0);
        assert!(second > first);
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_update_record() {
        let recorder = MemoryRecorder::new();
        let id = recorder.append_record(&sample()).unwrap();

        let mut info = sample();
        info.status_code = Some(204);
        recorder.update_record(id, &info).unwrap();

        assert_eq!(recorder.get(id).unwrap().status_code, Some(204));
    }

    #[test]
    fn test_update_unknown_record() {
        let recorder = MemoryRecorder::new();
        let result = recorder.update_record(42, &sample());
        assert!(matches!(result, Err(RecorderError::UnknownRecord(42))));
    }

    #[test]
    fn test_ws_messages_keep_order() {
        let recorder = MemoryRecorder::new();
        let id = recorder.append_record(&sample()).unwrap();

        recorder.update_ws_message(id, &WsMessage::text(true, "ping")).unwrap();
        recorder.update_ws_message(id, &WsMessage::text(false, "pong")).unwrap();

        let messages = recorder.ws_messages(id);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_to_server);
        assert!(!messages[1].is_to_server);
    }
}
