//! Payload chunks
//!
//! A chunk is one piece of application data attached to a connection. Raw chunks come
//! straight from the proxy or capture layer; the decoders turn them into HTTP units and
//! WebSocket messages carrying parsed decorations.

use serde::{Deserialize, Serialize};

/// Data direction relative to the local application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Sent by the local application
    Sent,
    /// Received from the remote peer
    Received,
}

impl Direction {
    pub fn is_sent(self) -> bool {
        self == Direction::Sent
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

/// HTTP decorations of a reassembled unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMeta {
    /// Request method (requests only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Request path without the query string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Query string including the leading `?`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Host from the `Host` header, or from an absolute request target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Protocol version, e.g. `HTTP/1.1`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Status code (responses only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// Reason phrase (responses only, may be absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Media type without parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Raw `Content-Encoding` value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,

    /// Body length after de-chunking and content decoding
    pub body_len: usize,

    /// Whether the body was successfully content-decoded
    pub decoded: bool,
}

impl HttpMeta {
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }
}

/// WebSocket decorations of a decoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsMeta {
    /// Frame opcode (for reassembled messages, the opcode of the first fragment)
    pub opcode: u8,

    /// FIN flag of the last frame contributing to this chunk
    pub fin: bool,

    /// Whether this message was reassembled from several frames
    pub was_fragmented: bool,
}

/// Protocol tag of a chunk with its decorations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChunkKind {
    Raw,
    Http(HttpMeta),
    #[serde(rename = "websocket")]
    WebSocket(WsMeta),
}

impl ChunkKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkKind::Raw => "raw",
            ChunkKind::Http(_) => "http",
            ChunkKind::WebSocket(_) => "websocket",
        }
    }
}

/// A piece of application payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadChunk {
    pub payload: Vec<u8>,
    pub direction: Direction,

    /// Capture time in milliseconds since the Unix epoch
    pub timestamp_ms: u64,

    /// Stream identifier for multiplexed transports (0 otherwise)
    pub stream_id: u32,

    pub kind: ChunkKind,
}

impl PayloadChunk {
    /// Create a raw chunk
    pub fn new(payload: Vec<u8>, direction: Direction, timestamp_ms: u64) -> Self {
        Self {
            payload,
            direction,
            timestamp_ms,
            stream_id: 0,
            kind: ChunkKind::Raw,
        }
    }

    pub fn with_kind(mut self, kind: ChunkKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_stream_id(mut self, stream_id: u32) -> Self {
        self.stream_id = stream_id;
        self
    }

    /// Copy the metadata of this chunk around a new payload
    pub fn derive(&self, payload: Vec<u8>, kind: ChunkKind) -> Self {
        Self {
            payload,
            direction: self.direction,
            timestamp_ms: self.timestamp_ms,
            stream_id: self.stream_id,
            kind,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.direction.is_sent()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn http(&self) -> Option<&HttpMeta> {
        match &self.kind {
            ChunkKind::Http(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn websocket(&self) -> Option<&WsMeta> {
        match &self.kind {
            ChunkKind::WebSocket(meta) => Some(meta),
            _ => None,
        }
    }
}
