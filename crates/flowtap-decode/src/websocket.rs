//! RFC 6455 WebSocket frame decoder
//!
//! Incoming chunks are queued until a complete frame is available. A frame may start in
//! the middle of one chunk and end several chunks later; reads walk the queue using an
//! offset into the first chunk, and fully consumed chunks are released from the front.
//!
//! Data messages split across frames are reassembled and emitted once, under the opcode of
//! the first fragment. Control frames are emitted as soon as they are parsed, including
//! when they arrive between the fragments of a data message.

use flowtap_core::config::WebSocketSettings;
use flowtap_core::{ChunkKind, Direction, PayloadChunk, WsMeta};
use std::collections::VecDeque;
use tracing::{debug, warn};

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xA;

/// Control frames (close, ping, pong and the reserved 0xB-0xF range)
pub fn is_control_opcode(opcode: u8) -> bool {
    opcode & 0x08 != 0
}

/// Opcodes defined by RFC 6455
pub fn is_valid_opcode(opcode: u8) -> bool {
    matches!(
        opcode,
        OPCODE_CONTINUATION
            | OPCODE_TEXT
            | OPCODE_BINARY
            | OPCODE_CLOSE
            | OPCODE_PING
            | OPCODE_PONG
    )
}

/// Largest payload a control frame may carry
const MAX_CONTROL_PAYLOAD: usize = 125;

struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
    /// Header plus payload bytes
    wire_len: usize,
}

enum ParseResult {
    Incomplete,
    Frame(Frame),
    Error(String),
}

struct FragmentBuffer {
    opcode: u8,
    direction: Direction,
    timestamp_ms: u64,
    stream_id: u32,
    data: Vec<u8>,
}

impl FragmentBuffer {
    fn chunk(self, kind: ChunkKind) -> PayloadChunk {
        PayloadChunk::new(self.data, self.direction, self.timestamp_ms)
            .with_stream_id(self.stream_id)
            .with_kind(kind)
    }
}

/// Decoder for one direction of a WebSocket connection
pub struct WebSocketDecoder {
    settings: WebSocketSettings,
    pending: VecDeque<PayloadChunk>,
    /// Bytes of the first pending chunk already consumed
    offset: usize,
    /// Unconsumed bytes across all pending chunks
    pending_bytes: usize,
    fragment: Option<FragmentBuffer>,
}

impl Default for WebSocketDecoder {
    fn default() -> Self {
        Self::new(&WebSocketSettings::default())
    }
}

impl WebSocketDecoder {
    pub fn new(settings: &WebSocketSettings) -> Self {
        Self {
            settings: settings.clone(),
            pending: VecDeque::new(),
            offset: 0,
            pending_bytes: 0,
            fragment: None,
        }
    }

    /// Bytes waiting for a complete frame
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Whether a fragmented message is in progress
    pub fn has_fragment(&self) -> bool {
        self.fragment.is_some()
    }

    /// Feed one chunk and emit every message it completes
    pub fn handle(&mut self, chunk: PayloadChunk, out: &mut Vec<PayloadChunk>) {
        if chunk.is_empty() {
            return;
        }

        if self.pending.len() >= self.settings.max_pending_chunks
            || self.pending_bytes + chunk.len() > self.settings.max_pending_bytes
        {
            warn!(
                "WebSocket pending buffer full ({} chunks, {} bytes), flushing as raw",
                self.pending.len(),
                self.pending_bytes
            );
            self.flush_raw(out);
        }

        self.pending_bytes += chunk.len();
        self.pending.push_back(chunk);

        loop {
            match self.parse_frame() {
                ParseResult::Incomplete => break,
                ParseResult::Error(reason) => {
                    warn!("Invalid WebSocket frame: {}, flushing as raw", reason);
                    self.flush_raw(out);
                    break;
                }
                ParseResult::Frame(frame) => {
                    // The frame takes its metadata from the chunk it starts in
                    let Some(template) = self.pending.front().map(|c| c.derive(Vec::new(), ChunkKind::Raw))
                    else {
                        break;
                    };
                    self.consume(frame.wire_len);
                    self.on_frame(frame, template, out);
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, template: PayloadChunk, out: &mut Vec<PayloadChunk>) {
        let Frame {
            fin,
            opcode,
            payload,
            ..
        } = frame;

        if is_control_opcode(opcode) {
            if !fin || payload.len() > MAX_CONTROL_PAYLOAD {
                debug!(
                    "Control frame 0x{:x} violates RFC 6455 (fin={}, len={}), passing through",
                    opcode,
                    fin,
                    payload.len()
                );
            }
            out.push(message(&template, payload, opcode, fin, false));
            return;
        }

        if !is_valid_opcode(opcode) {
            debug!("Reserved WebSocket opcode 0x{:x}", opcode);
        }

        if opcode == OPCODE_CONTINUATION {
            let Some(buffer) = self.fragment.as_mut() else {
                warn!("WebSocket continuation frame without a started message");
                out.push(message(&template, payload, opcode, fin, false));
                return;
            };

            if buffer.data.len() + payload.len() > self.settings.max_fragment_size {
                warn!(
                    "Fragmented WebSocket message exceeds {} bytes, flushing as raw",
                    self.settings.max_fragment_size
                );
                if let Some(mut buffer) = self.fragment.take() {
                    buffer.data.extend_from_slice(&payload);
                    out.push(buffer.chunk(ChunkKind::Raw));
                }
                return;
            }

            buffer.data.extend_from_slice(&payload);
            if fin {
                if let Some(buffer) = self.fragment.take() {
                    let opcode = buffer.opcode;
                    out.push(buffer.chunk(ChunkKind::WebSocket(WsMeta {
                        opcode,
                        fin: true,
                        was_fragmented: true,
                    })));
                }
            }
        } else if !fin {
            if let Some(stale) = self.fragment.take() {
                warn!("New fragmented WebSocket message before the previous one ended");
                out.push(stale.chunk(ChunkKind::Raw));
            }
            self.fragment = Some(FragmentBuffer {
                opcode,
                direction: template.direction,
                timestamp_ms: template.timestamp_ms,
                stream_id: template.stream_id,
                data: payload,
            });
        } else {
            out.push(message(&template, payload, opcode, true, false));
        }
    }

    fn byte_at(&self, pos: usize) -> Option<u8> {
        let mut pos = pos + self.offset;
        for chunk in &self.pending {
            if pos < chunk.len() {
                return Some(chunk.payload[pos]);
            }
            pos -= chunk.len();
        }
        None
    }

    fn copy_range(&self, start: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut skip = start + self.offset;
        for chunk in &self.pending {
            if out.len() == len {
                break;
            }
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let take = (chunk.len() - skip).min(len - out.len());
            out.extend_from_slice(&chunk.payload[skip..skip + take]);
            skip = 0;
        }
        out
    }

    fn consume(&mut self, mut len: usize) {
        self.pending_bytes -= len;
        while len > 0 {
            let Some(front) = self.pending.front() else {
                break;
            };
            let available = front.len() - self.offset;
            if len < available {
                self.offset += len;
                return;
            }
            len -= available;
            self.pending.pop_front();
            self.offset = 0;
        }
    }

    fn parse_frame(&self) -> ParseResult {
        let available = self.pending_bytes;
        let (Some(b0), Some(b1)) = (self.byte_at(0), self.byte_at(1)) else {
            return ParseResult::Incomplete;
        };

        let fin = b0 & 0x80 != 0;
        let rsv = (b0 >> 4) & 0x07;
        let opcode = b0 & 0x0F;
        let masked = b1 & 0x80 != 0;
        let mut pos = 2;

        let payload_len = match b1 & 0x7F {
            126 => {
                if available < pos + 2 {
                    return ParseResult::Incomplete;
                }
                let bytes = self.copy_range(pos, 2);
                pos += 2;
                u16::from_be_bytes([bytes[0], bytes[1]]) as u64
            }
            127 => {
                if available < pos + 8 {
                    return ParseResult::Incomplete;
                }
                let bytes = self.copy_range(pos, 8);
                pos += 8;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return ParseResult::Error("64-bit length has the high bit set".into());
                }
                len
            }
            len => len as u64,
        };

        if payload_len > self.settings.max_frame_size {
            return ParseResult::Error(format!(
                "payload length {} exceeds {}",
                payload_len, self.settings.max_frame_size
            ));
        }
        let payload_len = payload_len as usize;

        let mask = if masked {
            if available < pos + 4 {
                return ParseResult::Incomplete;
            }
            let key = self.copy_range(pos, 4);
            pos += 4;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        if available < pos + payload_len {
            return ParseResult::Incomplete;
        }

        if rsv != 0 {
            debug!("WebSocket frame with reserved bits 0x{:x}", rsv);
        }

        if let Some(front) = self.pending.front() {
            match (front.direction, masked) {
                (Direction::Sent, false) => debug!("Unmasked client WebSocket frame"),
                (Direction::Received, true) => debug!("Masked server WebSocket frame"),
                _ => {}
            }
        }

        let mut payload = self.copy_range(pos, payload_len);
        if let Some(key) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        ParseResult::Frame(Frame {
            fin,
            opcode,
            payload,
            wire_len: pos + payload_len,
        })
    }

    /// Emit everything buffered, unmodified, as raw chunks
    fn flush_raw(&mut self, out: &mut Vec<PayloadChunk>) {
        if let Some(buffer) = self.fragment.take() {
            out.push(buffer.chunk(ChunkKind::Raw));
        }

        let offset = std::mem::take(&mut self.offset);
        for (i, chunk) in self.pending.drain(..).enumerate() {
            if i == 0 && offset > 0 {
                out.push(chunk.derive(chunk.payload[offset..].to_vec(), ChunkKind::Raw));
            } else {
                out.push(chunk.with_kind(ChunkKind::Raw));
            }
        }
        self.pending_bytes = 0;
    }
}

fn message(template: &PayloadChunk, payload: Vec<u8>, opcode: u8, fin: bool, was_fragmented: bool) -> PayloadChunk {
    template.derive(
        payload,
        ChunkKind::WebSocket(WsMeta {
            opcode,
            fin,
            was_fragmented,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fin: bool, opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode];
        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        match payload.len() {
            len if len < 126 => out.push(mask_bit | len as u8),
            len if len <= u16::MAX as usize => {
                out.push(mask_bit | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(mask_bit | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        match mask {
            Some(key) => {
                out.extend_from_slice(&key);
                out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
            }
            None => out.extend_from_slice(payload),
        }
        out
    }

    fn chunk(data: Vec<u8>, ts: u64) -> PayloadChunk {
        PayloadChunk::new(data, Direction::Received, ts)
    }

    fn decode_all(decoder: &mut WebSocketDecoder, chunks: Vec<Vec<u8>>) -> Vec<PayloadChunk> {
        let mut out = Vec::new();
        for (i, data) in chunks.into_iter().enumerate() {
            decoder.handle(chunk(data, i as u64), &mut out);
        }
        out
    }

    #[test]
    fn test_opcode_helpers() {
        assert!(is_control_opcode(OPCODE_CLOSE));
        assert!(is_control_opcode(OPCODE_PONG));
        assert!(!is_control_opcode(OPCODE_BINARY));
        assert!(is_valid_opcode(OPCODE_PING));
        assert!(!is_valid_opcode(0x3));
        assert!(!is_valid_opcode(0xB));
    }

    #[test]
    fn test_single_unmasked_frame() {
        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(&mut decoder, vec![frame(true, OPCODE_TEXT, b"Hello", None)]);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"Hello");
        assert_eq!(
            out[0].websocket(),
            Some(&WsMeta {
                opcode: OPCODE_TEXT,
                fin: true,
                was_fragmented: false
            })
        );
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_masked_frame() {
        let mut decoder = WebSocketDecoder::default();
        let mut out = Vec::new();
        let data = frame(true, OPCODE_TEXT, b"Hello", Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(&data[..2], &[0x81, 0x85]);

        decoder.handle(PayloadChunk::new(data, Direction::Sent, 0), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"Hello");
        assert_eq!(out[0].direction, Direction::Sent);
    }

    #[test]
    fn test_fragmented_message_matches_single_frame() {
        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(
            &mut decoder,
            vec![
                frame(false, OPCODE_TEXT, b"Hel", None),
                frame(false, OPCODE_CONTINUATION, b"lo ", None),
                frame(true, OPCODE_CONTINUATION, b"World", None),
            ],
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"Hello World");
        let meta = out[0].websocket().unwrap();
        assert_eq!(meta.opcode, OPCODE_TEXT);
        assert!(meta.was_fragmented);
        assert_eq!(out[0].timestamp_ms, 0);
        assert!(!decoder.has_fragment());
    }

    #[test]
    fn test_control_frame_between_fragments() {
        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(
            &mut decoder,
            vec![
                frame(false, OPCODE_BINARY, &[1, 2], None),
                frame(true, OPCODE_PING, b"ping", None),
                frame(true, OPCODE_CONTINUATION, &[3, 4], None),
            ],
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].websocket().unwrap().opcode, OPCODE_PING);
        assert_eq!(out[0].payload, b"ping");
        assert_eq!(out[1].websocket().unwrap().opcode, OPCODE_BINARY);
        assert_eq!(out[1].payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_control_frame_violations_pass_through() {
        let mut decoder = WebSocketDecoder::default();
        let big = vec![0x42; 200];
        let out = decode_all(
            &mut decoder,
            vec![
                frame(false, OPCODE_PING, b"x", None),
                frame(true, OPCODE_CLOSE, &big, None),
            ],
        );

        assert_eq!(out.len(), 2);
        assert!(!out[0].websocket().unwrap().fin);
        assert_eq!(out[1].payload, big);
        assert!(!decoder.has_fragment());
    }

    #[test]
    fn test_frame_split_at_every_offset() {
        let data = frame(true, OPCODE_BINARY, &[9u8; 300], Some([1, 2, 3, 4]));
        for split in 1..data.len() {
            let mut decoder = WebSocketDecoder::default();
            let out = decode_all(
                &mut decoder,
                vec![data[..split].to_vec(), data[split..].to_vec()],
            );
            assert_eq!(out.len(), 1, "split at {}", split);
            assert_eq!(out[0].payload, vec![9u8; 300], "split at {}", split);
            assert_eq!(out[0].websocket().unwrap().opcode, OPCODE_BINARY);
        }
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut data = frame(true, OPCODE_TEXT, b"one", None);
        data.extend(frame(true, OPCODE_TEXT, b"two", None));
        data.extend(&frame(true, OPCODE_TEXT, b"three", None)[..3]);

        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(&mut decoder, vec![data]);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload, b"one");
        assert_eq!(out[1].payload, b"two");
        assert_eq!(decoder.pending_bytes(), 3);
    }

    #[test]
    fn test_extended_16bit_length() {
        let payload = vec![7u8; 1000];
        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(&mut decoder, vec![frame(true, OPCODE_BINARY, &payload, None)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.len(), 1000);
    }

    #[test]
    fn test_extended_64bit_length() {
        let payload = vec![5u8; 70_000];
        let data = frame(true, OPCODE_BINARY, &payload, None);
        assert_eq!(data[1], 127);

        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(&mut decoder, data.chunks(4096).map(|c| c.to_vec()).collect());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.len(), 70_000);
    }

    #[test]
    fn test_oversized_frame_flushes_raw() {
        let mut data = vec![0x82, 127];
        data.extend_from_slice(&(u32::MAX as u64).to_be_bytes());
        data.extend_from_slice(b"tail");

        let mut decoder = WebSocketDecoder::default();
        let mut out = Vec::new();
        decoder.handle(chunk(b"\x81\x02".to_vec(), 0), &mut out);
        decoder.handle(chunk(b"hi".to_vec(), 1), &mut out);
        decoder.handle(chunk(data.clone(), 2), &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload, b"hi");
        assert_eq!(out[1].kind, ChunkKind::Raw);
        assert_eq!(out[1].payload, data);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_raw_flush_starts_at_unconsumed_offset() {
        let mut data = frame(true, OPCODE_TEXT, b"ok", None);
        data.extend_from_slice(&[0x82, 127, 0xff, 0, 0, 0, 0, 0, 0, 0]);

        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(&mut decoder, vec![data]);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload, b"ok");
        assert_eq!(out[1].kind, ChunkKind::Raw);
        assert_eq!(out[1].payload[..2], [0x82, 127]);
    }

    #[test]
    fn test_orphan_continuation_emitted_as_is() {
        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(&mut decoder, vec![frame(true, OPCODE_CONTINUATION, b"late", None)]);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"late");
        let meta = out[0].websocket().unwrap();
        assert_eq!(meta.opcode, OPCODE_CONTINUATION);
        assert!(!meta.was_fragmented);
    }

    #[test]
    fn test_reserved_opcode_emitted() {
        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(&mut decoder, vec![frame(true, 0x3, b"?", None)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].websocket().unwrap().opcode, 0x3);
    }

    #[test]
    fn test_fragment_overflow_flushes_raw() {
        let settings = WebSocketSettings {
            max_frame_size: 8,
            max_fragment_size: 10,
            ..Default::default()
        };
        let mut decoder = WebSocketDecoder::new(&settings);
        let out = decode_all(
            &mut decoder,
            vec![
                frame(false, OPCODE_TEXT, b"123456", None),
                frame(false, OPCODE_CONTINUATION, b"789012", None),
                frame(true, OPCODE_TEXT, b"next", None),
            ],
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, ChunkKind::Raw);
        assert_eq!(out[0].payload, b"123456789012");
        assert_eq!(out[1].payload, b"next");
        assert!(!decoder.has_fragment());
    }

    #[test]
    fn test_pending_chunk_limit() {
        let settings = WebSocketSettings {
            max_pending_chunks: 3,
            ..Default::default()
        };
        let mut decoder = WebSocketDecoder::new(&settings);
        let header = frame(true, OPCODE_BINARY, &[0u8; 100], None);

        let mut out = Vec::new();
        for i in 0..3 {
            decoder.handle(chunk(header[i..i + 1].to_vec(), i as u64), &mut out);
        }
        assert!(out.is_empty());

        decoder.handle(chunk(vec![0xAA], 3), &mut out);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|c| c.kind == ChunkKind::Raw));
        assert_eq!(decoder.pending_bytes(), 1);
    }

    #[test]
    fn test_empty_chunks_ignored() {
        let mut decoder = WebSocketDecoder::default();
        let out = decode_all(&mut decoder, vec![Vec::new(), Vec::new()]);
        assert!(out.is_empty());
        assert_eq!(decoder.pending_bytes(), 0);
    }
}
