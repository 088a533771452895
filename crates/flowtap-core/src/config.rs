//! Engine configuration
//!
//! Settings come from a TOML file found on a fixed search path, then `FLOWTAP_*`
//! environment variables override individual values. Every resource limit the decoders
//! and the correlator enforce lives here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hard upper bound for a single proxy record
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowtapConfig {
    /// Engine settings
    pub engine: EngineSettings,

    /// Connection registry settings
    pub registry: RegistrySettings,

    /// HTTP reassembly settings
    pub http: HttpSettings,

    /// WebSocket decoding settings
    pub websocket: WebSocketSettings,

    /// Proxy correlation settings
    pub correlator: CorrelatorSettings,
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Connection registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Maximum number of live connections
    pub capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self { capacity: 8192 }
    }
}

/// HTTP reassembly settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Reassemble messages; when false every chunk is forwarded as-is
    pub reassemble: bool,

    /// Header block size after which the stream is treated as non-HTTP
    pub max_header_size: usize,

    /// Body size after which the remainder of the message is passed through
    pub max_body_size: usize,

    /// Upper bound on a content-decoded body
    pub max_decoded_size: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            reassemble: true,
            max_header_size: 8 * 1024,
            max_body_size: 16 * 1024 * 1024,
            max_decoded_size: 32 * 1024 * 1024,
        }
    }
}

/// WebSocket decoding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    /// Largest accepted frame payload
    pub max_frame_size: u64,

    /// Largest reassembled fragmented message
    pub max_fragment_size: usize,

    /// Chunks buffered while waiting for a complete frame
    pub max_pending_chunks: usize,

    /// Bytes buffered while waiting for a complete frame
    pub max_pending_bytes: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_fragment_size: 64 * 1024 * 1024,
            max_pending_chunks: 100,
            max_pending_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Proxy correlation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorSettings {
    /// Entries in the local port to connection map
    pub port_map_capacity: usize,

    /// How long an uncorrelated record is kept (milliseconds)
    pub pending_ttl_ms: u64,

    /// Buffered records per local port
    pub max_pending_per_port: usize,

    /// Buffered payload bytes across all ports
    pub max_pending_bytes: usize,

    /// Records declaring a larger length are skipped
    pub max_record_size: usize,

    /// Longest accepted record header line
    pub max_header_line: usize,

    /// Append TLS secrets to this SSLKEYLOGFILE
    pub keylog_path: Option<PathBuf>,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            port_map_capacity: 64,
            pending_ttl_ms: 5_000,
            max_pending_per_port: 32,
            max_pending_bytes: 8 * 1024 * 1024,
            max_record_size: MAX_RECORD_SIZE,
            max_header_line: 256,
            keylog_path: None,
        }
    }
}

/// Configuration loader with file discovery and env overrides
#[derive(Debug, Default)]
pub struct ConfigLoader {
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader using only the standard search path
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Prefer an explicit path (from `--config`)
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. FLOWTAP_CONFIG environment variable
    /// 3. ~/.config/flowtap/config.toml
    /// 4. /etc/flowtap/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<FlowtapConfig> {
        let mut config = if let Some(path) = self.find_config_file() {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            FlowtapConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// First existing file on the search path
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("FLOWTAP_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("FLOWTAP_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("flowtap").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/flowtap/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Parse one TOML file without env overrides or validation
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<FlowtapConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: FlowtapConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Override single values from `FLOWTAP_*` variables
    fn apply_env_overrides(&self, config: &mut FlowtapConfig) {
        if let Ok(val) = std::env::var("FLOWTAP_LOG_LEVEL") {
            config.engine.log_level = val;
        }

        if let Ok(val) = std::env::var("FLOWTAP_REGISTRY_CAPACITY") {
            match val.parse() {
                Ok(capacity) => config.registry.capacity = capacity,
                Err(_) => warn!("Ignoring invalid FLOWTAP_REGISTRY_CAPACITY: {}", val),
            }
        }

        if let Ok(val) = std::env::var("FLOWTAP_PENDING_TTL_MS") {
            match val.parse() {
                Ok(ttl) => config.correlator.pending_ttl_ms = ttl,
                Err(_) => warn!("Ignoring invalid FLOWTAP_PENDING_TTL_MS: {}", val),
            }
        }

        if let Ok(val) = std::env::var("FLOWTAP_KEYLOG_PATH") {
            config.correlator.keylog_path = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("FLOWTAP_HTTP_REASSEMBLE") {
            config.http.reassemble = val.parse().unwrap_or(config.http.reassemble);
        }
    }

    /// Reject limits the engine cannot honor
    pub fn validate(&self, config: &FlowtapConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.engine.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.engine.log_level, valid_levels
            )));
        }

        if config.registry.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Registry capacity cannot be 0".to_string(),
            ));
        }

        if config.correlator.port_map_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Port map capacity cannot be 0".to_string(),
            ));
        }

        if config.correlator.max_record_size > MAX_RECORD_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_record_size {} exceeds the {} byte limit",
                config.correlator.max_record_size, MAX_RECORD_SIZE
            )));
        }

        if config.websocket.max_frame_size > config.websocket.max_fragment_size as u64 {
            return Err(ConfigError::ValidationError(format!(
                "WebSocket max_frame_size ({}) cannot exceed max_fragment_size ({})",
                config.websocket.max_frame_size, config.websocket.max_fragment_size
            )));
        }

        if config.http.max_header_size == 0 {
            return Err(ConfigError::ValidationError(
                "HTTP max_header_size cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Write pretty TOML, creating parent directories
    pub fn save(&self, config: &FlowtapConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FlowtapConfig::default();
        assert_eq!(config.engine.log_level, "info");
        assert!(config.http.reassemble);
        assert_eq!(config.websocket.max_pending_chunks, 100);
        assert_eq!(config.correlator.port_map_capacity, 64);
        assert!(config.correlator.keylog_path.is_none());
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [engine]
            log_level = "debug"
        "#;
        let config: FlowtapConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.log_level, "debug");
        assert_eq!(config.registry.capacity, 8192);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [engine]
            log_level = "trace"

            [registry]
            capacity = 128

            [http]
            reassemble = false
            max_header_size = 1024

            [websocket]
            max_frame_size = 1048576
            max_pending_chunks = 10

            [correlator]
            port_map_capacity = 16
            pending_ttl_ms = 250
            keylog_path = "/tmp/sslkeys.log"
        "#;

        let config: FlowtapConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.log_level, "trace");
        assert_eq!(config.registry.capacity, 128);
        assert!(!config.http.reassemble);
        assert_eq!(config.http.max_header_size, 1024);
        assert_eq!(config.websocket.max_frame_size, 1_048_576);
        assert_eq!(config.websocket.max_pending_chunks, 10);
        assert_eq!(config.correlator.pending_ttl_ms, 250);
        assert_eq!(
            config.correlator.keylog_path.as_deref(),
            Some(Path::new("/tmp/sslkeys.log"))
        );
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = FlowtapConfig {
            engine: EngineSettings {
                log_level: "invalid".to_string(),
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_zero_capacity() {
        let mut config = FlowtapConfig::default();
        config.registry.capacity = 0;
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_record_size_limit() {
        let mut config = FlowtapConfig::default();
        config.correlator.max_record_size = MAX_RECORD_SIZE + 1;
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_frame_larger_than_fragment() {
        let mut config = FlowtapConfig::default();
        config.websocket.max_frame_size = 2048;
        config.websocket.max_fragment_size = 1024;
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_save_and_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = FlowtapConfig::default();
        config.registry.capacity = 42;
        config.correlator.pending_ttl_ms = 1234;

        let loader = ConfigLoader::new();
        loader.save(&config, &path).unwrap();
        let loaded = loader.load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::new().load_from_file(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_cli_path_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[registry]\ncapacity = 7\n").unwrap();

        let config = ConfigLoader::new()
            .with_cli_path(Some(path))
            .load()
            .unwrap();
        assert_eq!(config.registry.capacity, 7);
    }
}
