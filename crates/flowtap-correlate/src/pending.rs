//! Records waiting for their connection
//!
//! The proxy often reports plaintext before the capture layer reports the connection it
//! belongs to. Such records are parked here under their local port, in arrival order, and
//! bounded three ways: by age, by count per port, and by total bytes.

use crate::wire::ProxyRecord;
use flowtap_core::config::CorrelatorSettings;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct PendingRecord {
    record: ProxyRecord,
    enqueued: Instant,
}

/// Bounded per-port buffer of uncorrelated records
pub struct PendingBuffer {
    by_port: HashMap<u16, VecDeque<PendingRecord>>,
    total_bytes: usize,
    len: usize,
    ttl: Duration,
    max_per_port: usize,
    max_bytes: usize,
}

impl PendingBuffer {
    pub fn new(settings: &CorrelatorSettings) -> Self {
        Self {
            by_port: HashMap::new(),
            total_bytes: 0,
            len: 0,
            ttl: Duration::from_millis(settings.pending_ttl_ms),
            max_per_port: settings.max_pending_per_port.max(1),
            max_bytes: settings.max_pending_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.by_port.contains_key(&port)
    }

    /// Buffer a record; returns how many records were dropped to make room
    pub fn push(&mut self, record: ProxyRecord, now: Instant) -> usize {
        let size = record.payload.len();
        if size > self.max_bytes {
            return 1;
        }

        let mut dropped = 0;
        let port = record.port;
        let queue = self.by_port.entry(port).or_default();
        if queue.len() >= self.max_per_port {
            if let Some(old) = queue.pop_front() {
                self.total_bytes -= old.record.payload.len();
                self.len -= 1;
                dropped += 1;
            }
        }
        queue.push_back(PendingRecord {
            record,
            enqueued: now,
        });
        self.total_bytes += size;
        self.len += 1;

        while self.total_bytes > self.max_bytes {
            if !self.drop_oldest() {
                break;
            }
            dropped += 1;
        }

        dropped
    }

    /// Remove and return the records buffered for a port, oldest first
    pub fn take(&mut self, port: u16) -> Vec<ProxyRecord> {
        let Some(queue) = self.by_port.remove(&port) else {
            return Vec::new();
        };
        self.len -= queue.len();
        queue
            .into_iter()
            .map(|pending| {
                self.total_bytes -= pending.record.payload.len();
                pending.record
            })
            .collect()
    }

    /// Drop records older than the TTL; returns how many were dropped
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut dropped = 0;
        let mut freed = 0;

        self.by_port.retain(|_, queue| {
            while let Some(front) = queue.front() {
                if now.saturating_duration_since(front.enqueued) < ttl {
                    break;
                }
                if let Some(old) = queue.pop_front() {
                    freed += old.record.payload.len();
                    dropped += 1;
                }
            }
            !queue.is_empty()
        });

        self.total_bytes -= freed;
        self.len -= dropped;
        dropped
    }

    fn drop_oldest(&mut self) -> bool {
        let oldest_port = self
            .by_port
            .iter()
            .filter_map(|(port, queue)| queue.front().map(|p| (*port, p.enqueued)))
            .min_by_key(|(_, enqueued)| *enqueued)
            .map(|(port, _)| port);

        let Some(port) = oldest_port else {
            return false;
        };
        let Some(queue) = self.by_port.get_mut(&port) else {
            return false;
        };
        if let Some(old) = queue.pop_front() {
            self.total_bytes -= old.record.payload.len();
            self.len -= 1;
        }
        if queue.is_empty() {
            self.by_port.remove(&port);
        }
        true
    }
}
