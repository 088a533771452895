//! Proxy session correlator
//!
//! One [`Correlator`] serves one capture session. It listens to the registry for new
//! connections (to learn their local ports) and reads proxy records on a dedicated thread.
//! Both paths share one lock over the port map, the pending buffer, and the per-connection
//! decoders, so buffered records are delivered exactly once and in arrival order.

use crate::keylog::KeylogWriter;
use crate::pending::PendingBuffer;
use crate::wire::{MessageType, ProxyRecord, ReadOutcome, RecordReader};
use crate::{CorrelateError, CorrelateResult};
use flowtap_core::config::FlowtapConfig;
use flowtap_core::{
    ChunkKind, Connection, ConnectionRegistry, ConnectionsListener, EngineMetrics,
    ListenerHandle, PayloadChunk,
};
use flowtap_decode::{HttpReassembler, WebSocketDecoder};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, BufReader, Read};
use std::net::{Shutdown, TcpStream};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Severity of a proxy `log` record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl ProxyLogLevel {
    /// Split a `log` payload such as `W:certificate rejected` into level and message
    ///
    /// Payloads without a level prefix are logged at info.
    pub fn parse(payload: &[u8]) -> (Self, String) {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end();

        let (level, message) = match text.split_once(':') {
            Some(("D", rest)) => (ProxyLogLevel::Debug, rest),
            Some(("I", rest)) => (ProxyLogLevel::Info, rest),
            Some(("W", rest)) => (ProxyLogLevel::Warn, rest),
            Some(("E", rest)) => (ProxyLogLevel::Error, rest),
            _ => (ProxyLogLevel::Info, text),
        };
        (level, message.trim_start().to_string())
    }
}

/// Receives proxy status and control records
///
/// The defaults log through `tracing`; the orchestrator overrides them to surface
/// status changes.
pub trait ProxyEventHandler: Send + Sync {
    fn on_running(&self) {
        info!("TLS decryption proxy is running");
    }

    fn on_log(&self, level: ProxyLogLevel, message: &str) {
        match level {
            ProxyLogLevel::Debug => debug!(target: "flowtap::proxy", "{}", message),
            ProxyLogLevel::Info => info!(target: "flowtap::proxy", "{}", message),
            ProxyLogLevel::Warn => warn!(target: "flowtap::proxy", "{}", message),
            ProxyLogLevel::Error => error!(target: "flowtap::proxy", "{}", message),
        }
    }

    /// The reader thread ended, cleanly or with the error that ended the session
    fn on_stopped(&self, error: Option<&CorrelateError>) {
        match error {
            Some(e) => error!("Proxy session ended: {}", e),
            None => info!("Proxy session ended"),
        }
    }
}

/// Handler that only logs
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl ProxyEventHandler for LoggingHandler {}

/// Decoders for one connection
struct ConnectionStreams {
    http_request: HttpReassembler,
    http_reply: HttpReassembler,
    ws_client: WebSocketDecoder,
    ws_server: WebSocketDecoder,
}

impl ConnectionStreams {
    fn new(config: &FlowtapConfig) -> Self {
        Self {
            http_request: HttpReassembler::new(&config.http, &config.websocket),
            http_reply: HttpReassembler::new(&config.http, &config.websocket),
            ws_client: WebSocketDecoder::new(&config.websocket),
            ws_server: WebSocketDecoder::new(&config.websocket),
        }
    }
}

struct CorrelatorState {
    /// Local port -> insertion id of the latest connection using it
    port_map: LruCache<u16, u64>,
    pending: PendingBuffer,
    streams: HashMap<u64, ConnectionStreams>,
    keylog: Option<KeylogWriter>,
}

struct Shared {
    registry: Arc<ConnectionRegistry>,
    config: FlowtapConfig,
    metrics: Arc<EngineMetrics>,
    handler: Arc<dyn ProxyEventHandler>,
    state: Mutex<CorrelatorState>,
    closing: AtomicBool,
}

impl Shared {
    fn handle_record(&self, record: ProxyRecord) {
        self.metrics.correlator.records.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .correlator
            .bytes
            .fetch_add(record.payload.len() as u64, Ordering::Relaxed);

        match record.msg_type {
            MessageType::Running => self.handler.on_running(),
            MessageType::Log => {
                let (level, message) = ProxyLogLevel::parse(&record.payload);
                self.handler.on_log(level, &message);
            }
            MessageType::MasterSecret => {
                let mut state = self.state.lock();
                match state.keylog.as_mut() {
                    Some(keylog) => {
                        if let Err(e) = keylog.write_secret(&record.payload) {
                            warn!("Failed to write TLS secret to {}: {}", keylog.path().display(), e);
                        }
                    }
                    None => trace!("Ignoring TLS secret, no key log configured"),
                }
            }
            MessageType::Unknown(ref tag) => {
                debug!("Ignoring proxy record of unknown type {:?}", tag);
            }
            _ => {
                let now = Instant::now();
                let mut state = self.state.lock();
                self.purge_expired(&mut state, now);

                match self.resolve(&mut state, record.port) {
                    Some(conn) => self.dispatch(&mut state, &conn, record),
                    None => {
                        let port = record.port;
                        trace!("No connection for port {} yet, buffering {}", port, record.msg_type.tag());
                        let dropped = state.pending.push(record, now);
                        self.metrics.correlator.buffered.fetch_add(1, Ordering::Relaxed);
                        if dropped > 0 {
                            self.metrics
                                .correlator
                                .dropped
                                .fetch_add(dropped as u64, Ordering::Relaxed);
                            warn!(
                                "Pending proxy buffer full, dropped {} records (port {})",
                                dropped, port
                            );
                        }
                    }
                }
            }
        }
    }

    /// Find the live connection currently using a local port
    /// Live connection for a proxy-side source port
    ///
    /// The port map only caches recent ports; older live connections are found by
    /// scanning the registry and re-cached.
    fn resolve(&self, state: &mut CorrelatorState, port: u16) -> Option<Arc<Connection>> {
        let cached = state
            .port_map
            .get(&port)
            .and_then(|&id| self.registry.lookup_by_id(id))
            .filter(|conn| conn.local_port() == port);
        if cached.is_some() {
            return cached;
        }

        let conn = self.registry.find_by_local_port(port)?;
        state.port_map.put(port, conn.incr_id());
        Some(conn)
    }

    fn dispatch(&self, state: &mut CorrelatorState, conn: &Connection, record: ProxyRecord) {
        let ProxyRecord {
            timestamp_ms,
            msg_type,
            payload,
            ..
        } = record;

        match msg_type {
            MessageType::TlsError | MessageType::HttpError | MessageType::TcpError => {
                let reason = String::from_utf8_lossy(&payload).trim().to_string();
                debug!(
                    "Connection {} {}: {}",
                    conn.incr_id(),
                    msg_type.tag(),
                    reason
                );
                conn.set_decryption_error(reason);
                return;
            }
            MessageType::DataTruncated => {
                conn.set_payload_truncated();
                return;
            }
            _ => {}
        }

        let Some(direction) = msg_type.direction() else {
            return;
        };

        conn.mark_decrypted();
        if msg_type == MessageType::HttpRequest {
            conn.set_request_plaintext(&payload);
        }

        let chunk = PayloadChunk::new(payload, direction, timestamp_ms);
        let streams = state
            .streams
            .entry(conn.incr_id())
            .or_insert_with(|| ConnectionStreams::new(&self.config));

        let mut out = Vec::new();
        match msg_type {
            MessageType::HttpRequest => streams.http_request.handle(chunk, &mut out),
            MessageType::HttpReply => streams.http_reply.handle(chunk, &mut out),
            MessageType::WebsocketClientMsg => streams.ws_client.handle(chunk, &mut out),
            MessageType::WebsocketServerMsg => streams.ws_server.handle(chunk, &mut out),
            _ => out.push(chunk),
        }

        for chunk in &out {
            let counter = match chunk.kind {
                ChunkKind::Http(_) => &self.metrics.correlator.http_units,
                ChunkKind::WebSocket(_) => &self.metrics.correlator.websocket_messages,
                ChunkKind::Raw => &self.metrics.correlator.raw_chunks,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        conn.append_payload(out);
    }

    fn purge_expired(&self, state: &mut CorrelatorState, now: Instant) {
        let expired = state.pending.purge_expired(now);
        if expired > 0 {
            self.metrics
                .correlator
                .expired
                .fetch_add(expired as u64, Ordering::Relaxed);
            warn!("Dropped {} proxy records that never matched a connection", expired);
        }
    }
}

impl ConnectionsListener for Shared {
    fn connections_changed(&self, count: usize) {
        if count == 0 {
            let mut state = self.state.lock();
            state.port_map.clear();
            state.streams.clear();
            return;
        }

        // Subscribed to a populated registry
        let live = self.registry.connections();
        self.connections_added(0, &live);
    }

    fn connections_removed(&self, _start: usize, removed: &[Arc<Connection>]) {
        let mut state = self.state.lock();
        for conn in removed {
            state.streams.remove(&conn.incr_id());
            if state.port_map.peek(&conn.local_port()) == Some(&conn.incr_id()) {
                state.port_map.pop(&conn.local_port());
            }
        }
    }

    fn connections_added(&self, _start: usize, added: &[Arc<Connection>]) {
        let now = Instant::now();
        let mut state = self.state.lock();

        for conn in added {
            state.port_map.put(conn.local_port(), conn.incr_id());
        }

        for conn in added {
            let port = conn.local_port();
            // A later connection in the same batch may have taken over the port
            if state.port_map.peek(&port) != Some(&conn.incr_id()) {
                continue;
            }

            let records = state.pending.take(port);
            if records.is_empty() {
                continue;
            }

            debug!(
                "Delivering {} buffered proxy records to connection {}",
                records.len(),
                conn.incr_id()
            );
            self.metrics
                .correlator
                .flushed
                .fetch_add(records.len() as u64, Ordering::Relaxed);
            for record in records {
                self.dispatch(&mut state, conn, record);
            }
        }

        self.purge_expired(&mut state, now);
    }
}

/// Correlates one proxy session with the connections of a registry
pub struct Correlator {
    shared: Arc<Shared>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl Correlator {
    /// Create a correlator and subscribe it to the registry
    ///
    /// Connections already in the registry are correlatable immediately.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: &FlowtapConfig,
        handler: Arc<dyn ProxyEventHandler>,
    ) -> CorrelateResult<Self> {
        let keylog = match &config.correlator.keylog_path {
            Some(path) => Some(KeylogWriter::open(path).map_err(|source| {
                CorrelateError::Keylog {
                    path: path.clone(),
                    source,
                }
            })?),
            None => None,
        };

        let capacity =
            NonZeroUsize::new(config.correlator.port_map_capacity).unwrap_or(NonZeroUsize::MIN);
        let port_map = LruCache::new(capacity);

        let shared = Arc::new(Shared {
            metrics: registry.metrics().clone(),
            registry: registry.clone(),
            config: config.clone(),
            handler,
            state: Mutex::new(CorrelatorState {
                port_map,
                pending: PendingBuffer::new(&config.correlator),
                streams: HashMap::new(),
                keylog,
            }),
            closing: AtomicBool::new(false),
        });

        let handle = registry.subscribe(shared.clone());
        debug!("Correlator subscribed to connection registry");

        Ok(Self {
            shared,
            listener: Mutex::new(Some(handle)),
        })
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.shared.metrics
    }

    /// Records waiting for their connection
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Connections with decoder state
    pub fn tracked_streams(&self) -> usize {
        self.shared.state.lock().streams.len()
    }

    /// Process one record
    pub fn handle_record(&self, record: ProxyRecord) {
        self.shared.handle_record(record);
    }

    /// Read and process records until the stream ends
    ///
    /// Returns an error only if the stream desynchronizes or fails while the session is
    /// still meant to be running.
    pub fn run<R: Read>(&self, reader: R) -> CorrelateResult<()> {
        let settings = &self.shared.config.correlator;
        let mut records = RecordReader::new(
            BufReader::new(reader),
            settings.max_record_size,
            settings.max_header_line,
        );

        loop {
            let outcome = match records.next_record() {
                Ok(outcome) => outcome,
                Err(CorrelateError::Io(e)) if self.shared.closing.load(Ordering::SeqCst) => {
                    debug!("Proxy stream closed during shutdown: {}", e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match outcome {
                ReadOutcome::Record(record) => self.shared.handle_record(record),
                ReadOutcome::Skipped(header) => {
                    self.shared
                        .metrics
                        .correlator
                        .skipped
                        .fetch_add(1, Ordering::Relaxed);
                    trace!("Skipped record for port {}", header.port);
                }
                ReadOutcome::Eof => {
                    debug!("Proxy stream reached end of file");
                    return Ok(());
                }
            }
        }
    }

    /// Run on a dedicated thread reading from `channel`
    pub fn spawn<C: ProxyChannel>(self, channel: C) -> CorrelateResult<CorrelatorHandle> {
        let closer = channel.closer()?;
        let correlator = Arc::new(self);
        let worker = correlator.clone();

        let thread = std::thread::Builder::new()
            .name("flowtap-correlator".to_string())
            .spawn(move || {
                let result = worker.run(channel);
                worker.shared.handler.on_stopped(result.as_ref().err());
                result
            })?;

        info!("Correlator thread started");
        Ok(CorrelatorHandle {
            correlator,
            closer,
            thread: Some(thread),
        })
    }

    /// Unsubscribe from the registry and close the key log
    pub fn close(&self) -> CorrelateResult<()> {
        if let Some(handle) = self.listener.lock().take() {
            self.shared.registry.unsubscribe(handle);
        }

        let keylog = self.shared.state.lock().keylog.take();
        if let Some(keylog) = keylog {
            keylog.close()?;
        }
        Ok(())
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing correlator: {}", e);
        }
    }
}

/// Closes a proxy channel from another thread, waking a blocked reader
pub trait ChannelCloser: Send {
    fn close(&self) -> io::Result<()>;
}

/// A readable proxy channel that can be closed from another thread
pub trait ProxyChannel: Read + Send + 'static {
    fn closer(&self) -> io::Result<Box<dyn ChannelCloser>>;
}

struct TcpCloser(TcpStream);

impl ChannelCloser for TcpCloser {
    fn close(&self) -> io::Result<()> {
        match self.0.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl ProxyChannel for TcpStream {
    fn closer(&self) -> io::Result<Box<dyn ChannelCloser>> {
        Ok(Box::new(TcpCloser(self.try_clone()?)))
    }
}

#[cfg(unix)]
struct UnixCloser(std::os::unix::net::UnixStream);

#[cfg(unix)]
impl ChannelCloser for UnixCloser {
    fn close(&self) -> io::Result<()> {
        match self.0.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(unix)]
impl ProxyChannel for std::os::unix::net::UnixStream {
    fn closer(&self) -> io::Result<Box<dyn ChannelCloser>> {
        Ok(Box::new(UnixCloser(self.try_clone()?)))
    }
}

/// Owns a running correlator thread
pub struct CorrelatorHandle {
    correlator: Arc<Correlator>,
    closer: Box<dyn ChannelCloser>,
    thread: Option<JoinHandle<CorrelateResult<()>>>,
}

impl CorrelatorHandle {
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Whether the reader thread has exited on its own
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Close the channel, join the reader, and release the session
    pub fn stop(mut self) -> CorrelateResult<()> {
        info!("Stopping correlator");
        self.correlator.shared.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.closer.close() {
            debug!("Closing proxy channel: {}", e);
        }
        self.finish()
    }

    /// Wait for the proxy to close the channel, then release the session
    pub fn join(mut self) -> CorrelateResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> CorrelateResult<()> {
        let result = match self.thread.take() {
            Some(thread) => {
                debug!("Joining correlator thread");
                thread
                    .join()
                    .unwrap_or_else(|_| Err(CorrelateError::ThreadPanicked))
            }
            None => Ok(()),
        };
        let closed = self.correlator.close();
        result.and(closed)
    }
}

impl Drop for CorrelatorHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.correlator.shared.closing.store(true, Ordering::SeqCst);
            if let Err(e) = self.closer.close() {
                debug!("Closing proxy channel: {}", e);
            }
            if let Err(e) = self.finish() {
                warn!("Correlator ended with error: {}", e);
            }
        }
    }
}
