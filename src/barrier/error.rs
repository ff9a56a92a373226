use crate::node::NodeError;
use crate::object::ObjectError;
use crate::types::Version;

#[derive(Debug)]
pub enum BarrierError {
    /// Not enough entrants arrived before the timeout
    Timeout { version: Version, height: u32 },
    /// Height zero can never be reached
    InvalidHeight,
    Object(ObjectError),
    Node(NodeError),
}

impl std::fmt::Display for BarrierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarrierError::Timeout { version, height } => write!(
                f,
                "Timed out in barrier version {} (height {})",
                version, height
            ),
            BarrierError::InvalidHeight => write!(f, "Barrier height must be at least 1"),
            BarrierError::Object(e) => write!(f, "Object error: {}", e),
            BarrierError::Node(e) => write!(f, "Node error: {}", e),
        }
    }
}

impl std::error::Error for BarrierError {}

impl From<ObjectError> for BarrierError {
    fn from(e: ObjectError) -> Self {
        BarrierError::Object(e)
    }
}

impl From<NodeError> for BarrierError {
    fn from(e: NodeError) -> Self {
        BarrierError::Node(e)
    }
}
