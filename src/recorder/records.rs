//! Record types handed to recorders.
//!
//! Records serialize to JSON with snake_case keys so a recorder can persist
//! them as-is.

use crate::proxy::hooks::Protocol;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::HeaderMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Identifier assigned by a recorder to an exchange.
pub type RecordId = i64;

/// Id meaning "this exchange is not recorded". Any negative id has this meaning.
pub const SKIP_RECORD: RecordId = -1;

/// Marker rendered in place of a body too large to buffer.
pub const BIG_STREAM_MARKER: &str = "(big stream)";

/// Response body as far as the recorder is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RecordedBody {
    /// No body (yet).
    #[default]
    Empty,
    /// The complete body.
    Buffered(Bytes),
    /// The body crossed the chunk threshold and was streamed.
    BigStream,
}

impl Serialize for RecordedBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RecordedBody::Empty => serializer.serialize_str(""),
            RecordedBody::Buffered(bytes) => {
                serializer.serialize_str(&String::from_utf8_lossy(bytes))
            }
            RecordedBody::BigStream => serializer.serialize_str(BIG_STREAM_MARKER),
        }
    }
}

/// A recorded exchange: an HTTP request/response, a tunnel, or a WebSocket session.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceInfo {
    /// Target host.
    pub host: String,
    /// Request method.
    pub method: String,
    /// Path including query.
    pub path: String,
    /// Protocol of the exchange.
    pub protocol: Protocol,
    /// Full URL.
    pub url: String,
    /// Request headers.
    pub req_header: BTreeMap<String, String>,
    /// When the request arrived.
    pub start_time: DateTime<Utc>,
    /// When the response finished.
    pub end_time: Option<DateTime<Utc>>,
    /// Response status.
    pub status_code: Option<u16>,
    /// Response headers.
    pub res_header: Option<BTreeMap<String, String>>,
    /// Response body.
    pub res_body: RecordedBody,
    /// Response body length in bytes, when known.
    pub length: Option<usize>,
}

impl ResourceInfo {
    /// Start a record for an exchange that has just arrived.
    pub fn started(
        protocol: Protocol,
        method: &str,
        host: &str,
        path: &str,
        url: &str,
        headers: &HeaderMap,
    ) -> Self {
        Self {
            host: host.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            protocol,
            url: url.to_string(),
            req_header: headers_to_map(headers),
            start_time: Utc::now(),
            end_time: None,
            status_code: None,
            res_header: None,
            res_body: RecordedBody::Empty,
            length: None,
        }
    }

    /// Fill in the response half of the record.
    pub fn finish(&mut self, status_code: u16, headers: &HeaderMap, body: RecordedBody) {
        self.length = match &body {
            RecordedBody::Empty => Some(0),
            RecordedBody::Buffered(bytes) => Some(bytes.len()),
            RecordedBody::BigStream => None,
        };
        self.end_time = Some(Utc::now());
        self.status_code = Some(status_code);
        self.res_header = Some(headers_to_map(headers));
        self.res_body = body;
    }
}

/// Payload of a relayed WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsPayload {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl Serialize for WsPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WsPayload::Text(text) => serializer.serialize_str(text),
            WsPayload::Binary(bytes) => {
                serializer.serialize_str(&format!("(binary {} bytes)", bytes.len()))
            }
        }
    }
}

/// A recorded WebSocket frame.
#[derive(Debug, Clone, Serialize)]
pub struct WsMessage {
    /// When the frame was relayed.
    pub time: DateTime<Utc>,
    /// True for client to origin.
    pub is_to_server: bool,
    /// WebSocket opcode (1 text, 2 binary).
    pub opcode: u8,
    /// Frame payload.
    pub payload: WsPayload,
}

impl WsMessage {
    /// Record a text frame relayed now.
    pub fn text(is_to_server: bool, text: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            is_to_server,
            opcode: 1,
            payload: WsPayload::Text(text.into()),
        }
    }

    /// Record a binary frame relayed now.
    pub fn binary(is_to_server: bool, data: Bytes) -> Self {
        Self {
            time: Utc::now(),
            is_to_server,
            opcode: 2,
            payload: WsPayload::Binary(data),
        }
    }
}

/// Flatten headers to a sorted map. Repeated names are joined with ", ".
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}
