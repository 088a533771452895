//! HTTP content decoding (gzip, deflate, brotli, zstd)

use std::io::{self, Read};
use thiserror::Error;

/// Content decoding errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported content encoding: {0}")]
    Unsupported(String),

    #[error("Decompression failed: {0}")]
    Io(#[from] io::Error),

    #[error("Decoded body exceeds {0} bytes")]
    TooLarge(usize),
}

/// Result type for content decoding
pub type DecodeResult<T> = Result<T, DecodeError>;

/// A single `Content-Encoding` token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Zstd,
}

impl ContentEncoding {
    /// Parse one encoding token (case-insensitive)
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Some(ContentEncoding::Identity),
            "gzip" | "x-gzip" => Some(ContentEncoding::Gzip),
            "deflate" => Some(ContentEncoding::Deflate),
            "br" => Some(ContentEncoding::Brotli),
            "zstd" => Some(ContentEncoding::Zstd),
            _ => None,
        }
    }

    /// Decode `data`, failing if the output would exceed `limit` bytes
    pub fn decode(self, data: &[u8], limit: usize) -> DecodeResult<Vec<u8>> {
        match self {
            ContentEncoding::Identity => Ok(data.to_vec()),
            ContentEncoding::Gzip => read_limited(flate2::read::GzDecoder::new(data), limit),
            ContentEncoding::Deflate => {
                // Servers disagree on whether "deflate" carries the zlib wrapper
                read_limited(flate2::read::ZlibDecoder::new(data), limit).or_else(|_| {
                    read_limited(flate2::read::DeflateDecoder::new(data), limit)
                })
            }
            ContentEncoding::Brotli => read_limited(brotli::Decompressor::new(data, 4096), limit),
            ContentEncoding::Zstd => {
                read_limited(zstd::stream::read::Decoder::new(data)?, limit)
            }
        }
    }
}

/// Decode a body according to a full `Content-Encoding` header value
///
/// Encodings are listed in the order they were applied, so they are undone in reverse.
pub fn decode_body(header_value: &str, data: &[u8], limit: usize) -> DecodeResult<Vec<u8>> {
    let encodings = header_value
        .split(',')
        .map(|token| {
            ContentEncoding::parse(token).ok_or_else(|| DecodeError::Unsupported(token.trim().into()))
        })
        .collect::<DecodeResult<Vec<_>>>()?;

    let mut body = data.to_vec();
    for encoding in encodings.into_iter().rev() {
        body = encoding.decode(&body, limit)?;
    }
    Ok(body)
}

/// Whether a header value names at least one real (non-identity) encoding
pub fn is_encoded(header_value: &str) -> bool {
    header_value
        .split(',')
        .any(|token| ContentEncoding::parse(token) != Some(ContentEncoding::Identity))
}

fn read_limited<R: Read>(reader: R, limit: usize) -> DecodeResult<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(DecodeError::TooLarge(limit));
    }
    Ok(out)
}
