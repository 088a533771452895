//! Connection records
//!
//! A [`Connection`] pairs immutable identity ([`ConnectionInfo`]) with mutable state
//! (counters, labels, and the reconstructed payload). The mutable half sits behind a
//! per-connection lock so UI threads can read while the correlator appends.

use crate::chunk::PayloadChunk;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Transport protocol of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Protocol {
    pub fn from_number(proto: u8) -> Self {
        match proto {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 | 58 => Protocol::Icmp,
            other => Protocol::Other(other),
        }
    }
}

/// Lifecycle status reported by the capture layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnStatus {
    #[default]
    New,
    Connecting,
    Connected,
    Closed,
    Error,
    SocketError,
    ClientError,
    Reset,
    Unreachable,
}

impl ConnStatus {
    /// Whether the flow can still carry data
    pub fn is_open(self) -> bool {
        matches!(
            self,
            ConnStatus::New | ConnStatus::Connecting | ConnStatus::Connected
        )
    }
}

/// Immutable identity of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Insertion id, unique and strictly increasing within a session
    pub incr_id: u64,

    pub protocol: Protocol,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,

    /// Owning application id
    pub uid: i32,

    /// First packet time in milliseconds since the Unix epoch
    pub first_seen_ms: u64,
}

impl ConnectionInfo {
    pub fn ip_version(&self) -> u8 {
        if self.src_ip.is_ipv4() {
            4
        } else {
            6
        }
    }
}

/// Absolute counters reported by the capture layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsUpdate {
    pub sent_bytes: u64,
    pub rcvd_bytes: u64,
    pub sent_pkts: u32,
    pub rcvd_pkts: u32,
    pub last_seen_ms: u64,
    pub status: ConnStatus,
    pub tcp_flags: u8,
}

/// Late-resolved labels reported by the capture layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoUpdate {
    pub info: Option<String>,
    pub url: Option<String>,
    pub l7proto: Option<String>,
}

/// An update for one connection, keyed by insertion id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub incr_id: u64,

    #[serde(default)]
    pub stats: Option<StatsUpdate>,

    #[serde(default)]
    pub info: Option<InfoUpdate>,
}

impl ConnectionUpdate {
    pub fn stats(incr_id: u64, stats: StatsUpdate) -> Self {
        Self {
            incr_id,
            stats: Some(stats),
            info: None,
        }
    }

    pub fn info(incr_id: u64, info: InfoUpdate) -> Self {
        Self {
            incr_id,
            stats: None,
            info: Some(info),
        }
    }
}

/// Longest request prefix kept as plaintext preview
pub const MAX_PLAINTEXT_LENGTH: usize = 1024;

#[derive(Debug, Default)]
struct ConnectionState {
    stats: StatsUpdate,
    info: Option<String>,
    url: Option<String>,
    l7proto: Option<String>,
    request_plaintext: Option<String>,
    decryption_error: Option<String>,
    payload_truncated: bool,
    payload_decrypted: bool,
    payload: Vec<PayloadChunk>,
}

/// A tracked connection
#[derive(Debug)]
pub struct Connection {
    info: ConnectionInfo,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            state: Mutex::new(ConnectionState::default()),
        }
    }

    /// Create a connection with counters already known
    pub fn with_stats(info: ConnectionInfo, stats: StatsUpdate) -> Self {
        Self {
            info,
            state: Mutex::new(ConnectionState {
                stats,
                ..Default::default()
            }),
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn incr_id(&self) -> u64 {
        self.info.incr_id
    }

    pub fn uid(&self) -> i32 {
        self.info.uid
    }

    /// Ephemeral port on the local side, used to match proxy traffic
    pub fn local_port(&self) -> u16 {
        self.info.src_port
    }

    pub fn status(&self) -> ConnStatus {
        self.state.lock().stats.status
    }

    pub fn stats(&self) -> StatsUpdate {
        self.state.lock().stats.clone()
    }

    pub fn total_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.stats.sent_bytes + state.stats.rcvd_bytes
    }

    /// Apply an update in place, returning the (sent, received) byte deltas
    pub(crate) fn apply_update(&self, update: &ConnectionUpdate) -> (i64, i64) {
        let mut state = self.state.lock();
        let mut deltas = (0, 0);

        if let Some(stats) = &update.stats {
            deltas = (
                stats.sent_bytes as i64 - state.stats.sent_bytes as i64,
                stats.rcvd_bytes as i64 - state.stats.rcvd_bytes as i64,
            );
            state.stats = stats.clone();
        }

        if let Some(info) = &update.info {
            if info.info.is_some() {
                state.info = info.info.clone();
            }
            if info.url.is_some() {
                state.url = info.url.clone();
            }
            if info.l7proto.is_some() {
                state.l7proto = info.l7proto.clone();
            }
        }

        deltas
    }

    /// Append reconstructed chunks in order
    pub fn append_payload<I>(&self, chunks: I)
    where
        I: IntoIterator<Item = PayloadChunk>,
    {
        let mut state = self.state.lock();
        state.payload.extend(chunks);
    }

    /// Copy of the reconstructed payload
    pub fn payload(&self) -> Vec<PayloadChunk> {
        self.state.lock().payload.clone()
    }

    /// Run a closure over the payload without copying it
    pub fn with_payload<R>(&self, f: impl FnOnce(&[PayloadChunk]) -> R) -> R {
        f(&self.state.lock().payload)
    }

    pub fn payload_len(&self) -> usize {
        self.state.lock().payload.len()
    }

    pub fn set_decryption_error(&self, error: impl Into<String>) {
        self.state.lock().decryption_error = Some(error.into());
    }

    pub fn decryption_error(&self) -> Option<String> {
        self.state.lock().decryption_error.clone()
    }

    pub fn set_payload_truncated(&self) {
        self.state.lock().payload_truncated = true;
    }

    pub fn is_payload_truncated(&self) -> bool {
        self.state.lock().payload_truncated
    }

    pub fn mark_decrypted(&self) {
        self.state.lock().payload_decrypted = true;
    }

    pub fn is_decrypted(&self) -> bool {
        self.state.lock().payload_decrypted
    }

    /// Keep the printable prefix of the first request seen on this connection
    pub fn set_request_plaintext(&self, data: &[u8]) {
        let mut state = self.state.lock();
        if state.request_plaintext.is_some() {
            return;
        }

        let text: String = data
            .iter()
            .take(MAX_PLAINTEXT_LENGTH)
            .take_while(|&&b| is_plaintext_byte(b))
            .map(|&b| b as char)
            .collect();

        if !text.is_empty() {
            state.request_plaintext = Some(text);
        }
    }

    pub fn request_plaintext(&self) -> Option<String> {
        self.state.lock().request_plaintext.clone()
    }

    /// Serializable copy of the connection metadata (without payload bytes)
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state.lock();
        ConnectionSnapshot {
            info: self.info.clone(),
            stats: state.stats.clone(),
            l7proto: state.l7proto.clone(),
            info_label: state.info.clone(),
            url: state.url.clone(),
            request_plaintext: state.request_plaintext.clone(),
            decryption_error: state.decryption_error.clone(),
            payload_truncated: state.payload_truncated,
            payload_decrypted: state.payload_decrypted,
            payload_chunks: state.payload.len(),
        }
    }
}

fn is_plaintext_byte(b: u8) -> bool {
    matches!(b, b'\r' | b'\n' | b'\t') || (0x20..0x7f).contains(&b)
}

/// Point-in-time copy of a connection for exporters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    #[serde(flatten)]
    pub info: ConnectionInfo,
    pub stats: StatsUpdate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l7proto: Option<String>,
    #[serde(rename = "info", skip_serializing_if = "Option::is_none")]
    pub info_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_plaintext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decryption_error: Option<String>,
    pub payload_truncated: bool,
    pub payload_decrypted: bool,
    pub payload_chunks: usize,
}
