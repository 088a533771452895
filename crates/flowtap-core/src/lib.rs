//! flowtap core - connection registry, payload model, and configuration
//!
//! This crate provides the foundational types shared by the flowtap engine:
//!
//! - **Connections**: connection records, live counters, and reconstructed payload
//! - **Chunks**: payload chunks tagged as raw, HTTP, or WebSocket
//! - **Registry**: bounded ring of connections with per-app aggregates and observers
//! - **Config**: TOML configuration with env overrides
//! - **Metrics**: engine counters with Prometheus/JSON export

pub mod chunk;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod registry;

// Re-export commonly used types
pub use chunk::{ChunkKind, Direction, HttpMeta, PayloadChunk, WsMeta};
pub use config::{ConfigError, ConfigLoader, ConfigResult, FlowtapConfig};
pub use connection::{
    ConnStatus, Connection, ConnectionInfo, ConnectionSnapshot, ConnectionUpdate, InfoUpdate,
    Protocol, StatsUpdate,
};
pub use metrics::EngineMetrics;
pub use registry::{AppStats, ConnectionRegistry, ConnectionsListener, ListenerHandle};

/// Engine version
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
