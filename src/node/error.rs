use crate::codec::CodecError;
use crate::connection::ConnectionError;
use crate::monitor::RequestError;
use crate::types::{NodeId, SessionId};

#[derive(Debug)]
pub enum NodeError {
    Connection(ConnectionError),
    /// The node is not running
    Closed,
    /// No connection to the node
    Unreachable(NodeId),
    UnknownSession(SessionId),
    /// Connection handshake failed
    Handshake(String),
    Request(RequestError),
    Codec(CodecError),
    /// Worker thread could not be started
    Spawn(std::io::Error),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Connection(e) => write!(f, "Connection error: {}", e),
            NodeError::Closed => write!(f, "Node is closed"),
            NodeError::Unreachable(node) => write!(f, "Node {} is not connected", node),
            NodeError::UnknownSession(id) => write!(f, "Unknown session {}", id),
            NodeError::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            NodeError::Request(e) => write!(f, "Request error: {}", e),
            NodeError::Codec(e) => write!(f, "Codec error: {}", e),
            NodeError::Spawn(e) => write!(f, "Failed to start thread: {}", e),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ConnectionError> for NodeError {
    fn from(e: ConnectionError) -> Self {
        NodeError::Connection(e)
    }
}

impl From<RequestError> for NodeError {
    fn from(e: RequestError) -> Self {
        NodeError::Request(e)
    }
}

impl From<CodecError> for NodeError {
    fn from(e: CodecError) -> Self {
        NodeError::Codec(e)
    }
}
