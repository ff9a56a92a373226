use crate::monitor::RequestError;
use crate::node::NodeError;
use crate::protocol::ProtocolViolation;
use crate::stream::StreamError;
use crate::types::Version;

#[derive(Debug)]
pub enum ObjectError {
    /// Operation needs an attached object
    NotAttached,
    /// Operation needs the master instance
    NotMaster,
    /// Static objects never change after registration
    NotCommittable,
    /// The requested version is not retained by the master
    VersionUnavailable {
        requested: Version,
        oldest: Version,
        head: Version,
    },
    /// No data arrived in time
    Timeout,
    /// The command thread could not complete the operation
    Failed(String),
    Stream(StreamError),
    Protocol(ProtocolViolation),
    Node(NodeError),
    Request(RequestError),
}

impl std::fmt::Display for ObjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectError::NotAttached => write!(f, "Object is not attached to a session"),
            ObjectError::NotMaster => write!(f, "Operation requires the master instance"),
            ObjectError::NotCommittable => write!(f, "Static object cannot be committed"),
            ObjectError::VersionUnavailable {
                requested,
                oldest,
                head,
            } => write!(
                f,
                "Version {} unavailable (retained {}..={})",
                requested, oldest, head
            ),
            ObjectError::Timeout => write!(f, "Timed out waiting for object data"),
            ObjectError::Failed(msg) => write!(f, "Operation failed: {}", msg),
            ObjectError::Stream(e) => write!(f, "Stream error: {}", e),
            ObjectError::Protocol(e) => write!(f, "Protocol violation: {}", e),
            ObjectError::Node(e) => write!(f, "Node error: {}", e),
            ObjectError::Request(e) => write!(f, "Request error: {}", e),
        }
    }
}

impl std::error::Error for ObjectError {}

impl From<StreamError> for ObjectError {
    fn from(e: StreamError) -> Self {
        ObjectError::Stream(e)
    }
}

impl From<ProtocolViolation> for ObjectError {
    fn from(e: ProtocolViolation) -> Self {
        ObjectError::Protocol(e)
    }
}

impl From<NodeError> for ObjectError {
    fn from(e: NodeError) -> Self {
        ObjectError::Node(e)
    }
}

impl From<RequestError> for ObjectError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Timeout(_) => ObjectError::Timeout,
            other => ObjectError::Request(other),
        }
    }
}
