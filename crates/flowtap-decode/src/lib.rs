//! Stream decoders for flowtap
//!
//! Both decoders consume raw [`PayloadChunk`](flowtap_core::PayloadChunk)s of one
//! connection direction, in order, and push the chunks they reconstruct onto an output
//! vector. Input chunk boundaries are arbitrary.
//!
//! - **HttpReassembler**: HTTP/1.x messages, with chunked framing and content decoding
//! - **WebSocketDecoder**: RFC 6455 frames, with fragment reassembly

pub mod encoding;
pub mod http;
pub mod websocket;

pub use encoding::{ContentEncoding, DecodeError, DecodeResult};
pub use http::HttpReassembler;
pub use websocket::WebSocketDecoder;
