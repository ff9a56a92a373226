use super::{ConnectionState, ConnectionType};
use std::io;

/// Transport-level failures. Always recoverable by the caller.
#[derive(Debug)]
pub enum ConnectionError {
    /// Underlying I/O failure
    Io(io::Error),
    /// Peer closed the connection (read returned zero bytes)
    Closed,
    /// Operation needs a different connection state
    InvalidState {
        expected: ConnectionState,
        actual: ConnectionState,
    },
    /// Transport kind not available in this build
    Unsupported(ConnectionType),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectionError::Closed => write!(f, "Connection closed by peer"),
            ConnectionError::InvalidState { expected, actual } => {
                write!(f, "Invalid connection state: expected {:?}, got {:?}", expected, actual)
            }
            ConnectionError::Unsupported(t) => write!(f, "Unsupported connection type: {}", t),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ConnectionError::Closed
        } else {
            ConnectionError::Io(e)
        }
    }
}
