use crate::monitor::RequestError;
use crate::node::NodeError;
use crate::object::ObjectError;
use crate::types::{NodeId, ObjectId};

#[derive(Debug)]
pub enum SessionError {
    /// The id pool cannot satisfy the request
    IdsExhausted { requested: u32 },
    /// No node is known to hold the master of this id
    UnknownMaster(ObjectId),
    /// Id range runs past the end of the id space
    InvalidRange { start: ObjectId, range: u32 },
    /// The object is already attached
    AlreadyAttached,
    /// Operation needs a slave instance
    NotSlave,
    /// The node owning the session went away
    Closed,
    /// Unexpected reply from a peer
    BadReply(String),
    Unreachable(NodeId),
    Node(NodeError),
    Object(ObjectError),
    Request(RequestError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::IdsExhausted { requested } => {
                write!(f, "Cannot allocate {} object ids", requested)
            }
            SessionError::UnknownMaster(id) => write!(f, "No master known for object {}", id),
            SessionError::InvalidRange { start, range } => {
                write!(f, "Id range {}+{} overflows the id space", start, range)
            }
            SessionError::AlreadyAttached => write!(f, "Object is already attached"),
            SessionError::NotSlave => write!(f, "Operation requires a slave instance"),
            SessionError::Closed => write!(f, "Session is closed"),
            SessionError::BadReply(msg) => write!(f, "Unexpected reply: {}", msg),
            SessionError::Unreachable(node) => write!(f, "Master node {} is not connected", node),
            SessionError::Node(e) => write!(f, "Node error: {}", e),
            SessionError::Object(e) => write!(f, "Object error: {}", e),
            SessionError::Request(e) => write!(f, "Request error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<NodeError> for SessionError {
    fn from(e: NodeError) -> Self {
        SessionError::Node(e)
    }
}

impl From<ObjectError> for SessionError {
    fn from(e: ObjectError) -> Self {
        SessionError::Object(e)
    }
}

impl From<RequestError> for SessionError {
    fn from(e: RequestError) -> Self {
        SessionError::Request(e)
    }
}
