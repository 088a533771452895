//! flowtap - traffic stream reconstruction
//!
//! Correlates plaintext from a TLS-decrypting proxy with captured connections and prints
//! the reconstructed HTTP and WebSocket messages.

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowtap_core::config::{ConfigLoader, FlowtapConfig};
use flowtap_core::{
    ChunkKind, Connection, ConnectionInfo, ConnectionRegistry, PayloadChunk, StatsUpdate,
};
use flowtap_correlate::{Correlator, CorrelatorHandle, LoggingHandler};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Bytes of each chunk shown in reports
const PREVIEW_LEN: usize = 120;

#[derive(Parser)]
#[command(name = "flowtap")]
#[command(author = "Oximy")]
#[command(version)]
#[command(about = "Traffic stream reconstruction and proxy correlation", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (json, text)
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "FLOWTAP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Correlate a recorded proxy stream with a connection list
    Replay {
        /// Connections as JSON lines
        #[arg(long)]
        connections: PathBuf,

        /// Recorded proxy stream
        #[arg(long)]
        stream: PathBuf,
    },

    /// Accept a live proxy on loopback and correlate until it disconnects
    Listen {
        /// Connections as JSON lines
        #[arg(long)]
        connections: PathBuf,

        /// Loopback port the proxy connects to
        #[arg(short, long, default_value = "5750")]
        port: u16,
    },

    /// Print or save the effective configuration
    Config {
        /// Write the configuration here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Text,
}

impl OutputFormat {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "text" => OutputFormat::Text,
            other => {
                warn!("Unknown output format {:?}, using text", other);
                OutputFormat::Text
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config
    let log_level = log_level(cli.verbose, &config.engine.log_level);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let format = OutputFormat::parse(&cli.format);

    match cli.command {
        Commands::Replay {
            connections,
            stream,
        } => replay_command(&config, &connections, &stream, format),
        Commands::Listen { connections, port } => {
            listen_command(&config, &connections, port, format)
        }
        Commands::Config { output } => config_command(&config, output, format),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> FlowtapConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // No subscriber yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            FlowtapConfig::default()
        }
    }
}

fn log_level(verbose: u8, configured: &str) -> Level {
    match verbose {
        0 => match configured.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// One line of the connections file
#[derive(Debug, Deserialize)]
struct ConnectionLine {
    #[serde(flatten)]
    info: ConnectionInfo,

    #[serde(default)]
    stats: Option<StatsUpdate>,
}

fn load_connections(path: &Path) -> anyhow::Result<Vec<Connection>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open connections file {}", path.display()))?;

    let mut connections = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed: ConnectionLine = serde_json::from_str(line)
            .with_context(|| format!("Invalid connection at {}:{}", path.display(), idx + 1))?;
        connections.push(match parsed.stats {
            Some(stats) => Connection::with_stats(parsed.info, stats),
            None => Connection::new(parsed.info),
        });
    }

    info!("Loaded {} connections from {}", connections.len(), path.display());
    Ok(connections)
}

/// Build a registry holding the connections from `path`
fn build_registry(config: &FlowtapConfig, path: &Path) -> anyhow::Result<Arc<ConnectionRegistry>> {
    let connections = load_connections(path)?;
    let registry = Arc::new(ConnectionRegistry::new(config.registry.capacity));
    registry.insert(connections);
    if registry.untracked_count() > 0 {
        warn!(
            "Registry capacity {} exceeded, {} connections not tracked",
            registry.capacity(),
            registry.untracked_count()
        );
    }
    Ok(registry)
}

fn replay_command(
    config: &FlowtapConfig,
    connections: &Path,
    stream: &Path,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let registry = build_registry(config, connections)?;
    let correlator = Correlator::new(registry.clone(), config, Arc::new(LoggingHandler))?;

    let file = File::open(stream)
        .with_context(|| format!("Failed to open proxy stream {}", stream.display()))?;
    info!("Replaying proxy stream {}", stream.display());

    let outcome = correlator.run(file);
    if correlator.pending_len() > 0 {
        warn!(
            "{} proxy records never matched a connection",
            correlator.pending_len()
        );
    }
    correlator.close()?;

    print_report(&registry, format)?;
    outcome.context("Proxy stream replay failed")
}

fn listen_command(
    config: &FlowtapConfig,
    connections: &Path,
    port: u16,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let registry = build_registry(config, connections)?;
    let correlator = Correlator::new(registry.clone(), config, Arc::new(LoggingHandler))?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let listener = TcpListener::bind(("127.0.0.1", port))
        .with_context(|| format!("Failed to bind 127.0.0.1:{}", port))?;
    listener.set_nonblocking(true)?;
    info!("Waiting for proxy on 127.0.0.1:{}", port);

    let stream = loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("Proxy connected from {}", addr);
                stream.set_nonblocking(false)?;
                break stream;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if rx.recv_timeout(Duration::from_millis(100)).is_ok() {
                    info!("Interrupted before the proxy connected");
                    correlator.close()?;
                    return Ok(());
                }
            }
            Err(e) => return Err(e).context("Failed to accept proxy connection"),
        }
    };

    let handle = correlator.spawn(stream)?;
    let outcome = wait_for_session(handle, &rx);

    print_report(&registry, format)?;
    outcome.context("Proxy session failed")
}

/// Run until the proxy disconnects or Ctrl-C is pressed
fn wait_for_session(
    handle: CorrelatorHandle,
    interrupt: &mpsc::Receiver<()>,
) -> flowtap_correlate::CorrelateResult<()> {
    loop {
        if handle.is_finished() {
            debug!("Proxy disconnected");
            return handle.join();
        }
        if interrupt.recv_timeout(Duration::from_millis(200)).is_ok() {
            info!("Interrupted, stopping");
            return handle.stop();
        }
    }
}

fn config_command(
    config: &FlowtapConfig,
    output: Option<PathBuf>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if let Some(path) = output {
        ConfigLoader::new()
            .save(config, &path)
            .with_context(|| format!("Failed to save configuration to {}", path.display()))?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}

/// Printable view of one reconstructed chunk
#[derive(Debug, Serialize)]
struct ChunkView {
    direction: &'static str,
    timestamp: Option<String>,
    kind: ChunkKind,
    length: usize,
    preview: String,
}

impl ChunkView {
    fn from_chunk(chunk: &PayloadChunk) -> Self {
        Self {
            direction: chunk.direction.as_str(),
            timestamp: chrono::DateTime::from_timestamp_millis(chunk.timestamp_ms as i64)
                .map(|t| t.to_rfc3339()),
            kind: chunk.kind.clone(),
            length: chunk.len(),
            preview: preview(&chunk.payload),
        }
    }

    fn summary(&self) -> String {
        match &self.kind {
            ChunkKind::Http(meta) => match (meta.method.as_deref(), meta.status) {
                (Some(method), _) => format!(
                    "HTTP {} {}{}",
                    method,
                    meta.host.as_deref().unwrap_or(""),
                    meta.path.as_deref().unwrap_or("")
                ),
                (None, Some(status)) => format!(
                    "HTTP {} {}",
                    status,
                    meta.content_type.as_deref().unwrap_or("")
                ),
                (None, None) => "HTTP (continued)".to_string(),
            },
            ChunkKind::WebSocket(ws) => format!(
                "WS opcode={}{}",
                ws.opcode,
                if ws.was_fragmented { " (fragmented)" } else { "" }
            ),
            ChunkKind::Raw => "RAW".to_string(),
        }
    }
}

fn preview(payload: &[u8]) -> String {
    payload
        .iter()
        .take(PREVIEW_LEN)
        .map(|&b| match b {
            b' '..=b'~' => b as char,
            b'\r' | b'\n' | b'\t' => ' ',
            _ => '.',
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct ConnectionReport {
    #[serde(flatten)]
    connection: flowtap_core::ConnectionSnapshot,
    chunks: Vec<ChunkView>,
}

fn print_report(registry: &ConnectionRegistry, format: OutputFormat) -> anyhow::Result<()> {
    for conn in registry.connections() {
        let chunks: Vec<ChunkView> = conn.with_payload(|p| p.iter().map(ChunkView::from_chunk).collect());

        match format {
            OutputFormat::Json => {
                let report = ConnectionReport {
                    connection: conn.snapshot(),
                    chunks,
                };
                println!("{}", serde_json::to_string(&report)?);
            }
            OutputFormat::Text => {
                let info = conn.info();
                println!(
                    "#{} uid={} {}:{} -> {}:{} [{:?}]{}",
                    info.incr_id,
                    info.uid,
                    info.src_ip,
                    info.src_port,
                    info.dst_ip,
                    info.dst_port,
                    conn.status(),
                    conn.decryption_error()
                        .map(|e| format!(" decryption error: {}", e))
                        .unwrap_or_default()
                );
                for chunk in &chunks {
                    println!(
                        "  {:<4} {:>8}B  {}  {}",
                        chunk.direction,
                        chunk.length,
                        chunk.summary(),
                        chunk.preview
                    );
                }
                if conn.is_payload_truncated() {
                    println!("  (payload truncated by proxy)");
                }
            }
        }
    }

    let apps = registry.app_stats_snapshot();
    let metrics = registry.metrics();
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "apps": apps, "metrics": metrics.to_json() }));
        }
        OutputFormat::Text => {
            println!();
            println!("Applications:");
            for app in &apps {
                println!(
                    "  uid {:<8} {:>6} connections {:>12} sent {:>12} received",
                    app.uid, app.num_connections, app.sent_bytes, app.rcvd_bytes
                );
            }
            println!();
            print!("{}", metrics.to_prometheus());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(0, "debug"), Level::DEBUG);
        assert_eq!(log_level(0, "bogus"), Level::WARN);
        assert_eq!(log_level(2, "error"), Level::DEBUG);
        assert_eq!(log_level(5, "error"), Level::TRACE);
    }

    #[test]
    fn test_load_connections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# recorded session").unwrap();
        writeln!(
            file,
            r#"{{"incr_id":0,"protocol":"tcp","src_ip":"10.0.0.2","src_port":40000,"dst_ip":"1.1.1.1","dst_port":443,"uid":1000,"first_seen_ms":0}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"incr_id":1,"protocol":"udp","src_ip":"10.0.0.2","src_port":5353,"dst_ip":"8.8.8.8","dst_port":53,"uid":1001,"first_seen_ms":5,"stats":{{"sent_bytes":40,"rcvd_bytes":80}}}}"#
        )
        .unwrap();

        let connections = load_connections(file.path()).unwrap();
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].local_port(), 40000);
        assert_eq!(connections[1].total_bytes(), 120);
    }

    #[test]
    fn test_load_connections_reports_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"incr_id\":0}}").unwrap();

        let err = load_connections(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains(":1"));
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview(b"GET /\r\n\x00ok"), "GET /  .ok");
    }
}
