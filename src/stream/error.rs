use crate::codec::CodecError;
use crate::connection::ConnectionError;
use crate::protocol::ProtocolViolation;

#[derive(Debug)]
pub enum StreamError {
    /// Write on a stream that is not enabled
    NotEnabled,
    /// Read beyond the last bucket of the message
    ReadPastEnd { requested: usize, available: usize },
    /// Value could not be (de)serialized
    Serialization(String),
    /// No bucket arrived in time
    Timeout,
    Codec(CodecError),
    Connection(ConnectionError),
    Protocol(ProtocolViolation),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::NotEnabled => write!(f, "Stream is not enabled"),
            StreamError::ReadPastEnd {
                requested,
                available,
            } => write!(
                f,
                "Read past end of stream: requested {} bytes, {} available",
                requested, available
            ),
            StreamError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            StreamError::Timeout => write!(f, "Timed out waiting for stream data"),
            StreamError::Codec(e) => write!(f, "Codec error: {}", e),
            StreamError::Connection(e) => write!(f, "Connection error: {}", e),
            StreamError::Protocol(e) => write!(f, "Protocol violation: {}", e),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<CodecError> for StreamError {
    fn from(e: CodecError) -> Self {
        StreamError::Codec(e)
    }
}

impl From<ConnectionError> for StreamError {
    fn from(e: ConnectionError) -> Self {
        StreamError::Connection(e)
    }
}

impl From<ProtocolViolation> for StreamError {
    fn from(e: ProtocolViolation) -> Self {
        StreamError::Protocol(e)
    }
}

impl From<bincode::Error> for StreamError {
    fn from(e: bincode::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for StreamError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}
