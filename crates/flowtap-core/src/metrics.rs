//! Engine metrics
//!
//! Lock-free counters shared by the registry and the correlator, exportable in
//! Prometheus text format or as JSON.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics for one capture session
#[derive(Debug)]
pub struct EngineMetrics {
    /// When the collector was started
    start_time: Instant,
    /// Registry metrics
    pub registry: RegistryMetrics,
    /// Correlator metrics
    pub correlator: CorrelatorMetrics,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry-related metrics
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    pub inserted: AtomicU64,
    pub evicted: AtomicU64,
    pub updates_applied: AtomicU64,
    pub updates_ignored: AtomicU64,
}

/// Correlator-related metrics
#[derive(Debug, Default)]
pub struct CorrelatorMetrics {
    pub records: AtomicU64,
    pub bytes: AtomicU64,
    pub skipped: AtomicU64,
    pub buffered: AtomicU64,
    pub flushed: AtomicU64,
    pub expired: AtomicU64,
    pub dropped: AtomicU64,
    pub http_units: AtomicU64,
    pub websocket_messages: AtomicU64,
    pub raw_chunks: AtomicU64,
}

fn counter(output: &mut String, name: &str, help: &str, value: &AtomicU64) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} counter\n", name));
    output.push_str(&format!("{} {}\n\n", name, value.load(Ordering::Relaxed)));
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            registry: RegistryMetrics::default(),
            correlator: CorrelatorMetrics::default(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP flowtap_uptime_seconds Time since the session started\n");
        output.push_str("# TYPE flowtap_uptime_seconds gauge\n");
        output.push_str(&format!(
            "flowtap_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        let r = &self.registry;
        counter(
            &mut output,
            "flowtap_registry_inserted_total",
            "Connections inserted",
            &r.inserted,
        );
        counter(
            &mut output,
            "flowtap_registry_evicted_total",
            "Connections evicted by capacity",
            &r.evicted,
        );
        counter(
            &mut output,
            "flowtap_registry_updates_applied_total",
            "Connection updates applied",
            &r.updates_applied,
        );
        counter(
            &mut output,
            "flowtap_registry_updates_ignored_total",
            "Connection updates outside the live window",
            &r.updates_ignored,
        );

        let c = &self.correlator;
        counter(
            &mut output,
            "flowtap_proxy_records_total",
            "Proxy records read",
            &c.records,
        );
        counter(
            &mut output,
            "flowtap_proxy_bytes_total",
            "Proxy payload bytes read",
            &c.bytes,
        );
        counter(
            &mut output,
            "flowtap_proxy_skipped_total",
            "Proxy records skipped for size",
            &c.skipped,
        );
        counter(
            &mut output,
            "flowtap_pending_buffered_total",
            "Records buffered awaiting their connection",
            &c.buffered,
        );
        counter(
            &mut output,
            "flowtap_pending_flushed_total",
            "Buffered records delivered late",
            &c.flushed,
        );
        counter(
            &mut output,
            "flowtap_pending_expired_total",
            "Buffered records dropped by TTL",
            &c.expired,
        );
        counter(
            &mut output,
            "flowtap_pending_dropped_total",
            "Buffered records dropped by size limits",
            &c.dropped,
        );

        output.push_str("# HELP flowtap_chunks_total Reconstructed chunks by type\n");
        output.push_str("# TYPE flowtap_chunks_total counter\n");
        output.push_str(&format!(
            "flowtap_chunks_total{{type=\"http\"}} {}\n",
            c.http_units.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "flowtap_chunks_total{{type=\"websocket\"}} {}\n",
            c.websocket_messages.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "flowtap_chunks_total{{type=\"raw\"}} {}\n",
            c.raw_chunks.load(Ordering::Relaxed)
        ));

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let r = &self.registry;
        let c = &self.correlator;
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "registry": {
                "inserted": r.inserted.load(Ordering::Relaxed),
                "evicted": r.evicted.load(Ordering::Relaxed),
                "updates_applied": r.updates_applied.load(Ordering::Relaxed),
                "updates_ignored": r.updates_ignored.load(Ordering::Relaxed),
            },
            "correlator": {
                "records": c.records.load(Ordering::Relaxed),
                "bytes": c.bytes.load(Ordering::Relaxed),
                "skipped": c.skipped.load(Ordering::Relaxed),
                "buffered": c.buffered.load(Ordering::Relaxed),
                "flushed": c.flushed.load(Ordering::Relaxed),
                "expired": c.expired.load(Ordering::Relaxed),
                "dropped": c.dropped.load(Ordering::Relaxed),
                "http_units": c.http_units.load(Ordering::Relaxed),
                "websocket_messages": c.websocket_messages.load(Ordering::Relaxed),
                "raw_chunks": c.raw_chunks.load(Ordering::Relaxed),
            },
        })
    }
}
