//! Connection descriptions: how to reach (or offer) an endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bandwidth assumed for stream sockets (KB/s).
pub const DEFAULT_SOCKET_BANDWIDTH_KBS: u64 = 102_400;
/// Bandwidth assumed for local pipes and connection pairs (KB/s).
pub const DEFAULT_LOCAL_BANDWIDTH_KBS: u64 = 1_048_576;

/// Transport kind of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    /// TCP stream socket
    StreamSocket,
    /// Local (Unix domain) pipe addressed by `filename`
    LocalPipe,
    /// RDMA transport
    Rdma,
    /// Multicast group
    MulticastGroup,
    /// In-process connected pair
    ConnectionPair,
}

impl ConnectionType {
    fn default_bandwidth(&self) -> u64 {
        match self {
            ConnectionType::StreamSocket | ConnectionType::MulticastGroup => {
                DEFAULT_SOCKET_BANDWIDTH_KBS
            }
            ConnectionType::LocalPipe | ConnectionType::ConnectionPair | ConnectionType::Rdma => {
                DEFAULT_LOCAL_BANDWIDTH_KBS
            }
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::StreamSocket => "stream-socket",
            ConnectionType::LocalPipe => "local-pipe",
            ConnectionType::Rdma => "rdma",
            ConnectionType::MulticastGroup => "multicast-group",
            ConnectionType::ConnectionPair => "connection-pair",
        };
        f.write_str(name)
    }
}

/// Everything needed to connect to or listen on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub port: u16,
    /// Socket path for local pipes.
    #[serde(default)]
    pub filename: String,
    /// Link bandwidth in KB/s, the input of the compression predicate.
    #[serde(default)]
    pub bandwidth_kbs: u64,
    #[serde(default)]
    pub interface_name: String,
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

impl ConnectionDescription {
    pub fn new(connection_type: ConnectionType) -> Self {
        ConnectionDescription {
            connection_type,
            hostname: default_hostname(),
            port: 0,
            filename: String::new(),
            bandwidth_kbs: connection_type.default_bandwidth(),
            interface_name: String::new(),
        }
    }

    /// TCP endpoint.
    pub fn tcp(hostname: impl Into<String>, port: u16) -> Self {
        ConnectionDescription {
            hostname: hostname.into(),
            port,
            ..Self::new(ConnectionType::StreamSocket)
        }
    }

    /// Local pipe bound to a filesystem path.
    pub fn pipe(filename: impl Into<String>) -> Self {
        ConnectionDescription {
            filename: filename.into(),
            ..Self::new(ConnectionType::LocalPipe)
        }
    }

    pub fn with_bandwidth(mut self, bandwidth_kbs: u64) -> Self {
        self.bandwidth_kbs = bandwidth_kbs;
        self
    }

    /// Bandwidth with the per-type default substituted for an unset value.
    pub fn effective_bandwidth(&self) -> u64 {
        if self.bandwidth_kbs == 0 {
            self.connection_type.default_bandwidth()
        } else {
            self.bandwidth_kbs
        }
    }
}

impl fmt::Display for ConnectionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connection_type {
            ConnectionType::LocalPipe => write!(f, "{}:{}", self.connection_type, self.filename),
            _ => write!(f, "{}:{}:{}", self.connection_type, self.hostname, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_roundtrip() {
        let desc = ConnectionDescription::tcp("10.0.0.1", 4242).with_bandwidth(1000);
        let text = toml::to_string(&desc).unwrap();
        assert!(text.contains("stream-socket"));
        let back: ConnectionDescription = toml::from_str(&text).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let desc: ConnectionDescription = toml::from_str("type = \"local-pipe\"\nfilename = \"/tmp/x\"").unwrap();
        assert_eq!(desc.connection_type, ConnectionType::LocalPipe);
        assert_eq!(desc.bandwidth_kbs, 0);
        assert_eq!(desc.effective_bandwidth(), DEFAULT_LOCAL_BANDWIDTH_KBS);
    }
}
