//! Node configuration
//!
//! Loaded from TOML, then overridden from `VERSYNC_*` environment variables:
//!
//! - `VERSYNC_LISTEN`: comma-separated `host:port` TCP listeners
//! - `VERSYNC_OBJECT_BUFFER_SIZE`: stream flush threshold in bytes
//! - `VERSYNC_REQUEST_TIMEOUT_MS`, `VERSYNC_BARRIER_TIMEOUT_MS`
//! - `VERSYNC_COMPRESSOR`: codec name (`none`, `rle`, `zstd`)
//! - `VERSYNC_COMPRESSION_THRESHOLD_KBS`
//! - `VERSYNC_LOG_LEVEL`, `VERSYNC_LOG_JSON`

use crate::codec::CompressionConfig;
use crate::connection::ConnectionDescription;
use crate::protocol::PACKET_SIZE_MAX;
use crate::stream::DEFAULT_FLUSH_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest id block handed out by an id pool.
pub const MIN_ID_RANGE: u32 = 1024;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    InvalidValue { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {}: {:?}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Inbound listeners opened by `LocalNode::listen`
    pub listeners: Vec<ConnectionDescription>,
    /// Buffered bytes after which an object stream sends a chunk
    pub object_buffer_size: usize,
    /// Packets declaring a larger size are rejected
    pub max_packet_size: u64,
    /// Default wait for internal request/response pairs
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    /// How long a timed-out barrier entry is remembered by the master
    #[serde(with = "duration_millis")]
    pub barrier_timeout: Duration,
    pub min_id_range: u32,
    /// Number of ids owned by a session master
    pub id_pool_capacity: u64,
    pub compression: CompressionConfig,
    pub log: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            listeners: Vec::new(),
            object_buffer_size: DEFAULT_FLUSH_THRESHOLD,
            max_packet_size: PACKET_SIZE_MAX,
            request_timeout: Duration::from_secs(30),
            barrier_timeout: Duration::from_secs(60),
            min_id_range: MIN_ID_RANGE,
            id_pool_capacity: u32::MAX as u64,
            compression: CompressionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Configuration for tests (no listeners, short timeouts)
    pub fn test() -> Self {
        NodeConfig {
            object_buffer_size: 4096,
            request_timeout: Duration::from_secs(5),
            barrier_timeout: Duration::from_millis(500),
            log: LogConfig {
                level: "warn".to_string(),
                json: false,
            },
            ..NodeConfig::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = NodeConfig::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `VERSYNC_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(listen) = var("VERSYNC_LISTEN") {
            self.listeners = listen
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|addr| parse_listener(addr))
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = var("VERSYNC_OBJECT_BUFFER_SIZE") {
            self.object_buffer_size = parse("VERSYNC_OBJECT_BUFFER_SIZE", &v)?;
        }
        if let Some(v) = var("VERSYNC_REQUEST_TIMEOUT_MS") {
            self.request_timeout =
                Duration::from_millis(parse("VERSYNC_REQUEST_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = var("VERSYNC_BARRIER_TIMEOUT_MS") {
            self.barrier_timeout =
                Duration::from_millis(parse("VERSYNC_BARRIER_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = var("VERSYNC_COMPRESSOR") {
            self.compression.codec = v;
        }
        if let Some(v) = var("VERSYNC_COMPRESSION_THRESHOLD_KBS") {
            self.compression.bandwidth_threshold_kbs =
                parse("VERSYNC_COMPRESSION_THRESHOLD_KBS", &v)?;
        }
        if let Some(v) = var("VERSYNC_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = var("VERSYNC_LOG_JSON") {
            self.log.json = v == "true" || v == "1";
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_listener(addr: &str) -> Result<ConnectionDescription, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: "VERSYNC_LISTEN".to_string(),
        value: addr.to_string(),
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    Ok(ConnectionDescription::tcp(host, port))
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionType;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.object_buffer_size, 60_000);
        assert_eq!(config.min_id_range, 1024);
        assert_eq!(config.compression.bandwidth_threshold_kbs, 262_144);
        assert!(config.listeners.is_empty());
    }

    #[test]
    fn test_from_toml() {
        let config = NodeConfig::from_toml_str(
            r#"
            object_buffer_size = 1000
            request_timeout = 250

            [[listeners]]
            type = "stream-socket"
            hostname = "0.0.0.0"
            port = 4242

            [compression]
            codec = "none"
            bandwidth_threshold_kbs = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.object_buffer_size, 1000);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(
            config.listeners[0].connection_type,
            ConnectionType::StreamSocket
        );
        assert_eq!(config.listeners[0].port, 4242);
        assert_eq!(config.compression.codec, "none");
        assert_eq!(config.barrier_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = NodeConfig::test();
        let text = toml::to_string(&config).unwrap();
        assert_eq!(NodeConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "min_id_range = 64\n").unwrap();
        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.min_id_range, 64);
        assert_eq!(config.object_buffer_size, 60_000);

        assert!(NodeConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VERSYNC_LISTEN", "127.0.0.1:7000, 127.0.0.1:7001"),
            ("VERSYNC_COMPRESSOR", "none"),
            ("VERSYNC_REQUEST_TIMEOUT_MS", "90"),
            ("VERSYNC_LOG_JSON", "1"),
        ]
        .into_iter()
        .collect();
        let mut config = NodeConfig::default();
        config
            .apply_vars(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[1].port, 7001);
        assert_eq!(config.compression.codec, "none");
        assert_eq!(config.request_timeout, Duration::from_millis(90));
        assert!(config.log.json);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = NodeConfig::default();
        let result = config.apply_vars(|k| {
            (k == "VERSYNC_OBJECT_BUFFER_SIZE").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
