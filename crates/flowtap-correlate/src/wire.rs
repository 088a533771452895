//! Proxy record framing
//!
//! Each record is an ASCII header line followed by exactly `length` raw bytes:
//!
//! ```text
//! <timestamp-ms>:<local-port>:<type>:<length>\n<payload>
//! ```

use crate::{CorrelateError, CorrelateResult};
use flowtap_core::Direction;
use std::io::{self, BufRead, Read};
use tracing::{debug, warn};

/// Record type tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Running,
    TlsError,
    HttpError,
    HttpRequest,
    HttpReply,
    TcpClientMsg,
    TcpServerMsg,
    TcpError,
    WebsocketClientMsg,
    WebsocketServerMsg,
    DataTruncated,
    MasterSecret,
    Log,
    Unknown(String),
}

impl MessageType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "running" => MessageType::Running,
            "tls_err" => MessageType::TlsError,
            "http_err" => MessageType::HttpError,
            "http_req" => MessageType::HttpRequest,
            "http_rep" => MessageType::HttpReply,
            "tcp_climsg" => MessageType::TcpClientMsg,
            "tcp_srvmsg" => MessageType::TcpServerMsg,
            "tcp_err" => MessageType::TcpError,
            "ws_climsg" => MessageType::WebsocketClientMsg,
            "ws_srvmsg" => MessageType::WebsocketServerMsg,
            "trunc" => MessageType::DataTruncated,
            "secret" => MessageType::MasterSecret,
            "log" => MessageType::Log,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            MessageType::Running => "running",
            MessageType::TlsError => "tls_err",
            MessageType::HttpError => "http_err",
            MessageType::HttpRequest => "http_req",
            MessageType::HttpReply => "http_rep",
            MessageType::TcpClientMsg => "tcp_climsg",
            MessageType::TcpServerMsg => "tcp_srvmsg",
            MessageType::TcpError => "tcp_err",
            MessageType::WebsocketClientMsg => "ws_climsg",
            MessageType::WebsocketServerMsg => "ws_srvmsg",
            MessageType::DataTruncated => "trunc",
            MessageType::MasterSecret => "secret",
            MessageType::Log => "log",
            MessageType::Unknown(tag) => tag,
        }
    }

    /// Records about the proxy itself rather than a connection
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageType::Running | MessageType::MasterSecret | MessageType::Log
        )
    }

    /// Direction of data-carrying records
    pub fn direction(&self) -> Option<Direction> {
        match self {
            MessageType::HttpRequest
            | MessageType::TcpClientMsg
            | MessageType::WebsocketClientMsg => Some(Direction::Sent),
            MessageType::HttpReply
            | MessageType::TcpServerMsg
            | MessageType::WebsocketServerMsg => Some(Direction::Received),
            _ => None,
        }
    }
}

/// Parsed record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub timestamp_ms: u64,
    pub port: u16,
    pub msg_type: MessageType,
    /// Declared payload length, as sent (may be out of range)
    pub length: i64,
}

impl RecordHeader {
    /// Parse `<timestamp>:<port>:<type>:<length>`
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut tokens = line.split(':');
        let (Some(ts), Some(port), Some(tag), Some(len), None) = (
            tokens.next(),
            tokens.next(),
            tokens.next(),
            tokens.next(),
            tokens.next(),
        ) else {
            return Err("expected 4 ':'-separated fields".into());
        };

        let timestamp_ms = ts
            .parse()
            .map_err(|_| format!("invalid timestamp {:?}", ts))?;
        let port = port.parse().map_err(|_| format!("invalid port {:?}", port))?;
        if tag.is_empty() {
            return Err("empty type".into());
        }
        let length = len.parse().map_err(|_| format!("invalid length {:?}", len))?;

        Ok(Self {
            timestamp_ms,
            port,
            msg_type: MessageType::from_tag(tag),
            length,
        })
    }
}

/// One complete record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub timestamp_ms: u64,
    pub port: u16,
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

/// Result of reading one record
#[derive(Debug)]
pub enum ReadOutcome {
    Record(ProxyRecord),
    /// The declared length was out of range; its bytes were discarded
    Skipped(RecordHeader),
    Eof,
}

/// Reads framed records from a byte stream
pub struct RecordReader<R> {
    reader: R,
    max_record_size: usize,
    max_header_line: usize,
    line: Vec<u8>,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R, max_record_size: usize, max_header_line: usize) -> Self {
        Self {
            reader,
            max_record_size,
            max_header_line,
            line: Vec::with_capacity(64),
        }
    }

    /// Read the next record
    ///
    /// A malformed header is a [`CorrelateError::Desync`]. A stream that ends mid-record
    /// reads as [`ReadOutcome::Eof`].
    pub fn next_record(&mut self) -> CorrelateResult<ReadOutcome> {
        self.line.clear();
        let limit = self.max_header_line as u64 + 1;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.line)?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }

        if self.line.last() != Some(&b'\n') {
            if self.line.len() as u64 >= limit {
                return Err(CorrelateError::Desync {
                    header: String::from_utf8_lossy(&self.line[..32.min(self.line.len())]).into_owned(),
                    reason: format!("header line longer than {} bytes", self.max_header_line),
                });
            }
            debug!("Proxy stream ended inside a record header");
            return Ok(ReadOutcome::Eof);
        }

        let raw = trim_line(&self.line);
        let line = std::str::from_utf8(raw).map_err(|_| CorrelateError::Desync {
            header: String::from_utf8_lossy(raw).into_owned(),
            reason: "header is not valid UTF-8".into(),
        })?;
        let header = RecordHeader::parse(line).map_err(|reason| CorrelateError::Desync {
            header: line.to_string(),
            reason,
        })?;

        if header.length < 0 || header.length as u64 > self.max_record_size as u64 {
            warn!(
                "Skipping {} record with bad length {}",
                header.msg_type.tag(),
                header.length
            );
            return self.skip(header);
        }

        let len = header.length as usize;
        let mut payload = Vec::new();
        if payload.try_reserve_exact(len).is_err() {
            warn!("Cannot allocate {} bytes for {} record, skipping", len, header.msg_type.tag());
            return self.skip(header);
        }
        payload.resize(len, 0);

        match self.reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Proxy stream ended inside a {} record", header.msg_type.tag());
                return Ok(ReadOutcome::Eof);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(ReadOutcome::Record(ProxyRecord {
            timestamp_ms: header.timestamp_ms,
            port: header.port,
            msg_type: header.msg_type,
            payload,
        }))
    }

    fn skip(&mut self, header: RecordHeader) -> CorrelateResult<ReadOutcome> {
        let len = header.length.max(0) as u64;
        let discarded = io::copy(&mut (&mut self.reader).take(len), &mut io::sink())?;
        if discarded < len {
            return Ok(ReadOutcome::Eof);
        }
        Ok(ReadOutcome::Skipped(header))
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Encode a record in wire format
pub fn encode_record(timestamp_ms: u64, port: u16, msg_type: &MessageType, payload: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "{}:{}:{}:{}\n",
        timestamp_ms,
        port,
        msg_type.tag(),
        payload.len()
    )
    .into_bytes();
    out.extend_from_slice(payload);
    out
}
