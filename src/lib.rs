pub mod types;
pub mod config;
pub mod observability;
pub mod monitor;
pub mod connection;
pub mod codec;
pub mod stream;
pub mod protocol;
pub mod object;
pub mod session;
pub mod node;
pub mod barrier;

pub use barrier::{Barrier, BarrierError};
pub use config::{ConfigError, LogConfig, NodeConfig};
pub use connection::{
    Connection, ConnectionDescription, ConnectionError, ConnectionSet, ConnectionState,
    ConnectionType, SelectEvent,
};
pub use node::{LocalNode, NodeError};
pub use object::{ChangeType, CommitRequest, Distributable, Distributed, Object, ObjectError};
pub use session::{MapRequest, Session, SessionError};
pub use stream::{DataIStream, DataOStream, StreamError};
pub use types::{InstanceId, NodeId, ObjectId, SessionId, Version};
