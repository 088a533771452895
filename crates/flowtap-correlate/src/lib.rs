//! Proxy plaintext correlation for flowtap
//!
//! A TLS-terminating proxy streams the decrypted traffic it relays as framed records,
//! each tagged with the local port of the client socket. The [`Correlator`] maps those
//! ports back to connections known to the
//! [`ConnectionRegistry`](flowtap_core::ConnectionRegistry), feeds the payload through
//! the HTTP and WebSocket decoders, and appends the result to the connection.
//!
//! Records may arrive before the capture layer has reported their connection; they are
//! buffered per port and delivered once the connection appears.

pub mod correlator;
pub mod keylog;
pub mod pending;
pub mod wire;

use std::path::PathBuf;
use thiserror::Error;

pub use correlator::{
    ChannelCloser, Correlator, CorrelatorHandle, LoggingHandler, ProxyChannel, ProxyEventHandler,
    ProxyLogLevel,
};
pub use pending::PendingBuffer;
pub use wire::{MessageType, ProxyRecord, ReadOutcome, RecordHeader, RecordReader};

/// Correlation errors
#[derive(Debug, Error)]
pub enum CorrelateError {
    /// The record stream can no longer be framed; the session must end
    #[error("Proxy stream desynchronized at header {header:?}: {reason}")]
    Desync { header: String, reason: String },

    #[error("Proxy stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to open key log {path}: {source}")]
    Keylog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Correlator thread panicked")]
    ThreadPanicked,
}

/// Result type for correlation operations
pub type CorrelateResult<T> = Result<T, CorrelateError>;
