//! HTTP/1.x message reassembly
//!
//! [`HttpReassembler`] is fed the chunks of one connection direction and emits one chunk
//! per complete message: the header block followed by the de-chunked, content-decoded
//! body. Header blocks, chunk-size lines, and bodies may be split across any number of
//! input chunks, and one input chunk may carry the end of one message and the start of
//! the next.
//!
//! When message boundaries cannot be known the reassembler stops buffering:
//! - streams that never produce a valid header block are forwarded raw
//! - responses without `Content-Length` or chunked framing are passed through
//! - after `Upgrade: websocket`, chunks go to an embedded [`WebSocketDecoder`]

use crate::encoding;
use crate::websocket::WebSocketDecoder;
use flowtap_core::config::{HttpSettings, WebSocketSettings};
use flowtap_core::{ChunkKind, HttpMeta, PayloadChunk};
use tracing::{debug, warn};

/// Header slots tried first; messages with more headers are retried with a larger array
const HEADER_SLOTS: usize = 64;
const MAX_HEADER_SLOTS: usize = 512;

/// Longest accepted chunk-size or trailer line
const MAX_CHUNK_LINE: usize = 1024;

/// Parsed start line and framing headers of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHead {
    pub meta: HttpMeta,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub upgrade: Option<String>,
}

impl HttpHead {
    pub fn is_request(&self) -> bool {
        self.meta.is_request()
    }

    /// Responses that never carry a body
    fn is_bodyless_response(&self) -> bool {
        matches!(self.meta.status, Some(100..=199 | 204 | 304))
    }

    fn switches_protocol(&self) -> bool {
        self.upgrade.is_some() && (self.is_request() || self.meta.status == Some(101))
    }
}

/// Parse a complete header block (terminated by an empty line)
///
/// Returns `None` if the block is not valid HTTP/1.x.
pub fn parse_head(block: &[u8]) -> Option<HttpHead> {
    let mut slots = HEADER_SLOTS;
    loop {
        match parse_head_with(block, slots) {
            Err(httparse::Error::TooManyHeaders) if slots < MAX_HEADER_SLOTS => slots *= 2,
            Ok(head) => return head,
            Err(e) => {
                debug!("Invalid HTTP header block: {}", e);
                return None;
            }
        }
    }
}

fn parse_head_with(block: &[u8], slots: usize) -> Result<Option<HttpHead>, httparse::Error> {
    let mut headers = vec![httparse::EMPTY_HEADER; slots];
    let mut head = HttpHead::default();

    if block.starts_with(b"HTTP/") {
        let mut resp = httparse::Response::new(&mut headers);
        if resp.parse(block)?.is_partial() {
            return Ok(None);
        }
        head.meta.version = resp.version.map(|v| format!("HTTP/1.{}", v));
        head.meta.status = resp.code;
        head.meta.reason = resp.reason.filter(|r| !r.is_empty()).map(str::to_string);
        scan_headers(resp.headers, &mut head);
    } else {
        let mut req = httparse::Request::new(&mut headers);
        if req.parse(block)?.is_partial() {
            return Ok(None);
        }
        head.meta.version = req.version.map(|v| format!("HTTP/1.{}", v));
        head.meta.method = req.method.map(str::to_string);
        let target = req.path.unwrap_or("/");
        let (host, path, query) = split_target(target);
        head.meta.host = host;
        head.meta.path = Some(path);
        head.meta.query = query;
        scan_headers(req.headers, &mut head);
    }

    Ok(Some(head))
}

fn scan_headers(headers: &[httparse::Header<'_>], head: &mut HttpHead) {
    for header in headers {
        let value = String::from_utf8_lossy(header.value).trim().to_string();
        let name = header.name;

        if name.eq_ignore_ascii_case("content-length") {
            if head.content_length.is_none() {
                head.content_length = value.parse().ok();
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            head.chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        } else if name.eq_ignore_ascii_case("content-type") {
            let media = value.split(';').next().unwrap_or("").trim();
            if !media.is_empty() {
                head.meta.content_type = Some(media.to_string());
            }
        } else if name.eq_ignore_ascii_case("content-encoding") {
            if encoding::is_encoded(&value) {
                head.meta.content_encoding = Some(value);
            }
        } else if name.eq_ignore_ascii_case("host") {
            head.meta.host = Some(value);
        } else if name.eq_ignore_ascii_case("upgrade") {
            head.upgrade = Some(value);
        }
    }
}

/// Split a request target into (host, path, query)
///
/// Absolute targets (`http://host/path`) yield their host; the query keeps its `?`.
fn split_target(target: &str) -> (Option<String>, String, Option<String>) {
    let mut host = None;
    let mut rest = target;

    for scheme in ["http://", "https://", "ws://", "wss://"] {
        if let Some(after) = strip_prefix_ignore_case(target, scheme) {
            let end = after
                .find(|c| c == '/' || c == '?')
                .unwrap_or(after.len());
            host = Some(after[..end].to_string());
            rest = &after[end..];
            break;
        }
    }

    let (path, query) = match rest.find('?') {
        Some(idx) => (&rest[..idx], Some(rest[idx..].to_string())),
        None => (rest, None),
    };
    let path = if path.is_empty() { "/" } else { path };

    (host, path.to_string(), query)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes()) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| from + idx + 4)
}

#[derive(Debug)]
enum ChunkedState {
    /// Reading a `<hex-size>[;ext]\r\n` line
    Size(Vec<u8>),
    Data(usize),
    /// Skipping the CRLF after chunk data
    DataEnd(usize),
    /// Reading trailer lines until an empty one
    Trailers(Vec<u8>),
}

#[derive(Debug)]
enum ReadState {
    Headers,
    Length(usize),
    Chunked(ChunkedState),
}

/// What the reassembler does with incoming bytes for the rest of the stream
enum Mode {
    Reassemble,
    /// Message boundaries unknown: forward chunks as unparsed HTTP
    PassThrough,
    /// Not HTTP: forward chunks raw
    Raw,
    WebSocket(Box<WebSocketDecoder>),
}

/// Reassembler for one direction of an HTTP/1.x connection
pub struct HttpReassembler {
    settings: HttpSettings,
    ws_settings: WebSocketSettings,
    mode: Mode,
    state: ReadState,
    /// Header block of the message being read
    headers: Vec<u8>,
    body: Vec<u8>,
    head: Option<HttpHead>,
    /// Metadata of the chunk that started the current message
    start: Option<PayloadChunk>,
    /// Body exceeded the size cap; the rest of it is forwarded as it arrives
    overflowed: bool,
}

impl Default for HttpReassembler {
    fn default() -> Self {
        Self::new(&HttpSettings::default(), &WebSocketSettings::default())
    }
}

impl HttpReassembler {
    pub fn new(settings: &HttpSettings, ws_settings: &WebSocketSettings) -> Self {
        Self {
            settings: settings.clone(),
            ws_settings: ws_settings.clone(),
            mode: Mode::Reassemble,
            state: ReadState::Headers,
            headers: Vec::new(),
            body: Vec::new(),
            head: None,
            start: None,
            overflowed: false,
        }
    }

    /// Whether the stream switched to WebSocket decoding
    pub fn is_upgraded(&self) -> bool {
        matches!(self.mode, Mode::WebSocket(_))
    }

    /// Whether the stream was found not to be HTTP
    pub fn is_raw(&self) -> bool {
        matches!(self.mode, Mode::Raw)
    }

    /// Whether message boundaries were lost for the rest of the stream
    pub fn is_pass_through(&self) -> bool {
        matches!(self.mode, Mode::PassThrough)
    }

    /// Feed one chunk and emit every message it completes
    pub fn handle(&mut self, chunk: PayloadChunk, out: &mut Vec<PayloadChunk>) {
        if chunk.is_empty() {
            return;
        }

        if matches!(self.mode, Mode::Reassemble) && !self.settings.reassemble {
            self.forward_unreassembled(chunk, out);
            return;
        }

        match &mut self.mode {
            Mode::Reassemble => {}
            Mode::PassThrough => {
                out.push(chunk.with_kind(ChunkKind::Http(HttpMeta::default())));
                return;
            }
            Mode::Raw => {
                out.push(chunk.with_kind(ChunkKind::Raw));
                return;
            }
            Mode::WebSocket(decoder) => {
                decoder.handle(chunk, out);
                return;
            }
        }

        let mut data: &[u8] = &chunk.payload;
        while !data.is_empty() {
            if !matches!(self.mode, Mode::Reassemble) {
                // The stream changed mode mid-chunk: hand over the remaining bytes
                let rest = chunk.derive(data.to_vec(), ChunkKind::Raw);
                self.handle(rest, out);
                return;
            }

            let consumed = match self.state {
                ReadState::Headers => self.read_headers(&chunk, data, out),
                ReadState::Length(_) | ReadState::Chunked(_) => self.read_body(data, out),
            };
            data = &data[consumed..];
        }
    }

    /// Accumulate header bytes; returns how many bytes of `data` were consumed
    fn read_headers(&mut self, chunk: &PayloadChunk, data: &[u8], out: &mut Vec<PayloadChunk>) -> usize {
        if self.start.is_none() {
            self.start = Some(chunk.derive(Vec::new(), ChunkKind::Raw));
        }

        let before = self.headers.len();
        let search_from = before.saturating_sub(3);

        // Buffer only up to this block's terminator (or what one block may span); the rest
        // of `data` belongs to the body or to later messages
        let scan = &data[..data
            .len()
            .min((self.settings.max_header_size + 4).saturating_sub(before))];
        let window = find_header_end(scan, 0).unwrap_or(scan.len());
        self.headers.extend_from_slice(&data[..window]);

        let Some(end) = find_header_end(&self.headers, search_from) else {
            if self.headers.len() > self.settings.max_header_size {
                warn!(
                    "No HTTP header terminator within {} bytes, treating stream as raw",
                    self.settings.max_header_size
                );
                self.headers.extend_from_slice(&data[window..]);
                self.give_up_raw(out);
            }
            return data.len();
        };

        self.headers.truncate(end);
        let consumed = end - before;

        if end > self.settings.max_header_size {
            warn!("HTTP header block of {} bytes exceeds limit, treating stream as raw", end);
            self.give_up_raw(out);
            return consumed;
        }

        match parse_head(&self.headers) {
            Some(head) => self.on_head(head, out),
            None => self.give_up_raw(out),
        }
        consumed
    }

    fn on_head(&mut self, head: HttpHead, out: &mut Vec<PayloadChunk>) {
        let upgrade = head.switches_protocol().then(|| head.upgrade.clone()).flatten();

        if head.chunked {
            self.state = ReadState::Chunked(ChunkedState::Size(Vec::new()));
            self.head = Some(head);
            return;
        }

        match head.content_length {
            Some(len) if len > 0 => {
                self.state = ReadState::Length(len);
                self.head = Some(head);
                return;
            }
            Some(_) => {}
            None if head.is_request() || head.is_bodyless_response() || upgrade.is_some() => {}
            None => {
                debug!("HTTP response without length, passing the rest of the stream through");
                self.head = Some(head);
                self.complete_message(out);
                self.mode = Mode::PassThrough;
                return;
            }
        }

        self.head = Some(head);
        self.complete_message(out);

        if let Some(protocol) = upgrade {
            if protocol.eq_ignore_ascii_case("websocket") {
                debug!("HTTP connection upgraded to WebSocket");
                self.mode = Mode::WebSocket(Box::new(WebSocketDecoder::new(&self.ws_settings)));
            } else {
                debug!("HTTP connection upgraded to {}, passing through", protocol);
                self.mode = Mode::PassThrough;
            }
        }
    }

    /// Consume body bytes; returns how many bytes of `data` were consumed
    fn read_body(&mut self, data: &[u8], out: &mut Vec<PayloadChunk>) -> usize {
        match &mut self.state {
            ReadState::Length(remaining) => {
                let n = (*remaining).min(data.len());
                *remaining -= n;
                let done = *remaining == 0;
                self.push_body(&data[..n], out);
                if done {
                    self.complete_message(out);
                }
                n
            }
            ReadState::Chunked(_) => self.read_chunked(data, out),
            ReadState::Headers => 0,
        }
    }

    fn read_chunked(&mut self, data: &[u8], out: &mut Vec<PayloadChunk>) -> usize {
        let mut pos = 0;

        while pos < data.len() {
            let ReadState::Chunked(state) = &mut self.state else {
                break;
            };

            match state {
                ChunkedState::Size(line) => {
                    let (taken, complete) = take_line(line, &data[pos..]);
                    pos += taken;
                    if !complete {
                        if line.len() > MAX_CHUNK_LINE {
                            warn!("Oversized chunk-size line, passing the rest of the stream through");
                            self.abandon_message(out);
                            return pos;
                        }
                        continue;
                    }

                    match parse_chunk_size(line) {
                        Some(0) => *state = ChunkedState::Trailers(Vec::new()),
                        Some(size) => *state = ChunkedState::Data(size),
                        None => {
                            warn!("Invalid chunk-size line, passing the rest of the stream through");
                            self.abandon_message(out);
                            return pos;
                        }
                    }
                }
                ChunkedState::Data(remaining) => {
                    let n = (*remaining).min(data.len() - pos);
                    *remaining -= n;
                    if *remaining == 0 {
                        *state = ChunkedState::DataEnd(2);
                    }
                    self.push_body(&data[pos..pos + n], out);
                    pos += n;
                }
                ChunkedState::DataEnd(left) => {
                    let n = (*left).min(data.len() - pos);
                    *left -= n;
                    pos += n;
                    if *left == 0 {
                        *state = ChunkedState::Size(Vec::new());
                    }
                }
                ChunkedState::Trailers(line) => {
                    let (taken, complete) = take_line(line, &data[pos..]);
                    pos += taken;
                    if !complete {
                        if line.len() > MAX_CHUNK_LINE {
                            line.clear();
                        }
                        continue;
                    }

                    if trim_crlf(line).is_empty() {
                        self.complete_message(out);
                        return pos;
                    }
                    line.clear();
                }
            }
        }

        pos
    }

    fn push_body(&mut self, bytes: &[u8], out: &mut Vec<PayloadChunk>) {
        if bytes.is_empty() {
            return;
        }

        if self.overflowed {
            if let Some(start) = &self.start {
                out.push(start.derive(bytes.to_vec(), ChunkKind::Http(HttpMeta::default())));
            }
            return;
        }

        self.body.extend_from_slice(bytes);
        if self.body.len() > self.settings.max_body_size {
            warn!(
                "HTTP body exceeds {} bytes, forwarding the rest undecoded",
                self.settings.max_body_size
            );
            self.emit_unit(false, out);
            self.overflowed = true;
        }
    }

    /// Emit the current header block and body as one unit
    fn emit_unit(&mut self, decode: bool, out: &mut Vec<PayloadChunk>) {
        let Some(start) = self.start.clone() else {
            return;
        };
        let mut meta = self
            .head
            .as_ref()
            .map(|h| h.meta.clone())
            .unwrap_or_default();
        let mut body = std::mem::take(&mut self.body);

        // Empty bodies (HEAD, 204, 304) keep their Content-Encoding but have nothing to decode
        if decode && !body.is_empty() {
            if let Some(enc) = meta.content_encoding.as_deref() {
                match encoding::decode_body(enc, &body, self.settings.max_decoded_size) {
                    Ok(decoded) => {
                        body = decoded;
                        meta.decoded = true;
                    }
                    Err(e) => warn!("Could not decode {} HTTP body: {}", enc, e),
                }
            }
        }
        meta.body_len = body.len();

        // The header buffer is reused for the next message, so copy out exactly
        let mut payload = Vec::with_capacity(self.headers.len() + body.len());
        payload.extend_from_slice(&self.headers);
        payload.extend_from_slice(&body);
        self.headers.clear();
        out.push(start.derive(payload, ChunkKind::Http(meta)));
    }

    fn complete_message(&mut self, out: &mut Vec<PayloadChunk>) {
        if !self.overflowed {
            self.emit_unit(true, out);
        }
        self.reset_message();
    }

    fn reset_message(&mut self) {
        self.state = ReadState::Headers;
        self.headers.clear();
        self.body.clear();
        self.head = None;
        self.start = None;
        self.overflowed = false;
    }

    /// Framing broke mid-message: emit what we have and stop reassembling
    fn abandon_message(&mut self, out: &mut Vec<PayloadChunk>) {
        if !self.overflowed {
            self.emit_unit(false, out);
        }
        self.reset_message();
        self.mode = Mode::PassThrough;
    }

    /// Not HTTP: emit the buffered bytes raw and stop parsing
    fn give_up_raw(&mut self, out: &mut Vec<PayloadChunk>) {
        if let Some(start) = self.start.take() {
            let payload = std::mem::take(&mut self.headers);
            out.push(start.derive(payload, ChunkKind::Raw));
        }
        self.reset_message();
        self.mode = Mode::Raw;
    }

    fn forward_unreassembled(&mut self, chunk: PayloadChunk, out: &mut Vec<PayloadChunk>) {
        let head = find_header_end(&chunk.payload, 0).and_then(|end| parse_head(&chunk.payload[..end]));
        let meta = head.as_ref().map(|h| h.meta.clone()).unwrap_or_default();
        let upgrade = head.and_then(|h| h.switches_protocol().then_some(h.upgrade).flatten());

        out.push(chunk.with_kind(ChunkKind::Http(meta)));

        if upgrade.is_some_and(|p| p.eq_ignore_ascii_case("websocket")) {
            self.mode = Mode::WebSocket(Box::new(WebSocketDecoder::new(&self.ws_settings)));
        }
    }
}

/// Append bytes up to and including `\n`; returns (bytes taken, line complete)
fn take_line(line: &mut Vec<u8>, data: &[u8]) -> (usize, bool) {
    match data.iter().position(|&b| b == b'\n') {
        Some(idx) => {
            line.extend_from_slice(&data[..=idx]);
            (idx + 1, true)
        }
        None => {
            line.extend_from_slice(data);
            (data.len(), false)
        }
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(trim_crlf(line)).ok()?;
    let size = line.split(';').next()?.trim();
    usize::from_str_radix(size, 16).ok()
}
