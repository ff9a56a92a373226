//! Local node runtime
//!
//! A [`LocalNode`] owns the connections to its peers and two threads:
//!
//! ```text
//!   peers ──► ConnectionSet ──► receiver thread ──┬─► registry / inboxes / requests
//!                                                 └─► job queue ──► command thread
//!                                                                     │
//!   app threads ──► requests, streams ──────────────────────────────────┘
//! ```
//!
//! Local packets travel through a connection pair to the node itself, so
//! commands for local objects take the same path as remote ones. The
//! receiver thread never locks a change manager; anything that might is
//! queued for the command thread.

mod command;
mod error;
mod peer;
mod receiver;

pub use error::NodeError;

use crate::codec::{CodecRegistry, CompressionPolicy};
use crate::config::NodeConfig;
use crate::connection::{
    Connection, ConnectionDescription, ConnectionHandle, ConnectionSet, ConnectionSetHandle,
};
use crate::monitor::{Reply, RequestHandler};
use crate::protocol::{Packet, PacketBody};
use crate::session::{Session, SessionInner};
use crate::stream::{ChunkFramer, DataOStream};
use crate::types::{NodeId, SessionId};
use ahash::AHashMap;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use peer::PeerTable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Work for the command thread.
pub(crate) enum Job {
    Packet(Packet, NodeId),
    NodeDown(NodeId),
    Stop,
}

pub struct NodeInner {
    node_id: NodeId,
    config: NodeConfig,
    codecs: Arc<CodecRegistry>,
    policy: CompressionPolicy,
    requests: RequestHandler,
    peers: RwLock<PeerTable>,
    sessions: RwLock<AHashMap<SessionId, Arc<SessionInner>>>,
    set: Mutex<Option<ConnectionSetHandle>>,
    jobs: Sender<Job>,
    running: AtomicBool,
}

impl NodeInner {
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub(crate) fn requests(&self) -> &RequestHandler {
        &self.requests
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Output stream using the configured codec and chunk size.
    pub(crate) fn new_ostream(&self, framer: Box<dyn ChunkFramer>) -> DataOStream {
        let codec = match self.codecs.choose(&self.config.compression.codec) {
            Ok(codec) => codec,
            Err(e) => {
                warn!("compression disabled: {}", e);
                None
            }
        };
        DataOStream::new(framer)
            .with_codec(codec, self.policy)
            .with_flush_threshold(self.config.object_buffer_size)
    }

    pub(crate) fn connections_for(&self, nodes: &[NodeId]) -> Vec<ConnectionHandle> {
        self.peers.read().connections_for(nodes)
    }

    pub(crate) fn is_reachable(&self, node: NodeId) -> bool {
        self.peers
            .read()
            .connection(node)
            .is_some_and(|c| c.is_connected())
    }

    pub(crate) fn send(&self, node: NodeId, packet: &Packet) -> Result<(), NodeError> {
        if !self.is_running() {
            return Err(NodeError::Closed);
        }
        self.send_raw(node, packet)
    }

    /// Send regardless of the running flag; used during shutdown.
    fn send_raw(&self, node: NodeId, packet: &Packet) -> Result<(), NodeError> {
        let connection = self
            .peers
            .read()
            .connection(node)
            .ok_or(NodeError::Unreachable(node))?;
        connection.send(&packet.encode(), false)?;
        Ok(())
    }

    pub(crate) fn send_self(&self, packet: &Packet) -> Result<(), NodeError> {
        self.send(self.node_id, packet)
    }

    pub(crate) fn session(&self, id: SessionId) -> Option<Arc<SessionInner>> {
        self.sessions.read().get(&id).cloned()
    }

    fn add_to_set(&self, connection: ConnectionHandle) {
        if let Some(set) = self.set.lock().as_ref() {
            set.add_connection(connection);
        }
    }

    /// Add a handshaken peer connection.
    pub(crate) fn add_peer(&self, node: NodeId, connection: ConnectionHandle) {
        info!("peer {} on connection {}", node, connection.id());
        self.peers.write().insert(node, connection);
    }

    /// Close `connection` and forget the peer it served.
    pub(crate) fn drop_connection(&self, connection: &Connection) {
        if let Some(set) = self.set.lock().as_ref() {
            set.remove_connection(connection);
        }
        let node = self.peers.write().remove_connection(connection.id());
        connection.close();
        if let Some(node) = node {
            warn!("lost peer {} (connection {})", node, connection.id());
            if self.jobs.send(Job::NodeDown(node)).is_err() {
                debug!("command thread gone, node-down of {} dropped", node);
            }
        }
    }

    /// Close the route to `node` after it misbehaved.
    pub(crate) fn drop_peer(&self, node: NodeId) {
        if node == self.node_id {
            return;
        }
        let connection = self.peers.read().connection(node);
        if let Some(connection) = connection {
            self.drop_connection(&connection);
        }
    }

    pub(crate) fn enqueue(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            debug!("command thread gone, job dropped");
        }
    }
}

/// A node participating in the cluster.
pub struct LocalNode {
    inner: Arc<NodeInner>,
    job_receiver: Mutex<Option<Receiver<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<Vec<ConnectionHandle>>,
}

impl LocalNode {
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let codecs = CodecRegistry::shared();
        codecs.choose(&config.compression.codec)?;
        let policy = CompressionPolicy::from_config(&config.compression);
        let (jobs, job_receiver) = channel::unbounded();

        let inner = Arc::new(NodeInner {
            node_id: NodeId::generate(),
            config,
            codecs,
            policy,
            requests: RequestHandler::new(),
            peers: RwLock::new(PeerTable::default()),
            sessions: RwLock::new(AHashMap::new()),
            set: Mutex::new(None),
            jobs,
            running: AtomicBool::new(false),
        });
        Ok(LocalNode {
            inner,
            job_receiver: Mutex::new(Some(job_receiver)),
            threads: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Open the configured listeners and start the receiver and command
    /// threads.
    pub fn listen(&self) -> Result<(), NodeError> {
        let Some(job_receiver) = self.job_receiver.lock().take() else {
            return Err(NodeError::Closed);
        };
        let mut set = ConnectionSet::new()?;
        let handle = set.handle();

        let (self_send, self_recv) = Connection::pair()?;
        {
            let mut peers = self.inner.peers.write();
            peers.insert(self.inner.node_id, self_send);
            peers.insert_origin(self_recv.id(), self.inner.node_id);
        }
        handle.add_connection(self_recv);

        for description in &self.inner.config.listeners {
            let listener = Connection::create(description.clone());
            listener.listen()?;
            handle.add_connection(listener.clone());
            self.listeners.lock().push(listener);
        }

        *self.inner.set.lock() = Some(handle);
        self.inner.running.store(true, Ordering::Release);

        let name = format!("versync-{:08x}", self.inner.node_id.0 as u32);
        let receiver_inner = self.inner.clone();
        let receiver = thread::Builder::new()
            .name(format!("{}-recv", name))
            .spawn(move || receiver::run(receiver_inner, &mut set))
            .map_err(NodeError::Spawn)?;
        let command_inner = self.inner.clone();
        let commands = thread::Builder::new()
            .name(format!("{}-cmd", name))
            .spawn(move || command::run(command_inner, job_receiver))
            .map_err(NodeError::Spawn)?;
        self.threads.lock().extend([receiver, commands]);

        info!("node {} running", self.inner.node_id);
        Ok(())
    }

    /// Descriptions of the open listeners, with bound ports filled in.
    pub fn listener_descriptions(&self) -> Vec<ConnectionDescription> {
        self.listeners
            .lock()
            .iter()
            .map(|l| l.description())
            .collect()
    }

    /// Connect to a listening node and return its id.
    pub fn connect(&self, description: &ConnectionDescription) -> Result<NodeId, NodeError> {
        if !self.is_running() {
            return Err(NodeError::Closed);
        }
        let connection = Connection::create(description.clone());
        connection.connect()?;
        self.inner.add_to_set(connection.clone());

        let requests = &self.inner.requests;
        let request_id = requests.register();
        let hello = Packet::node(PacketBody::NodeConnect {
            request_id,
            node_id: self.inner.node_id,
        });
        if let Err(e) = connection.send(&hello.encode(), false) {
            requests.unregister(request_id);
            self.inner.drop_connection(&connection);
            return Err(e.into());
        }

        match requests.wait(request_id, Some(self.inner.config.request_timeout)) {
            Ok(Reply::Node(node)) => Ok(node),
            Ok(other) => {
                self.inner.drop_connection(&connection);
                Err(NodeError::Handshake(format!("unexpected reply {:?}", other)))
            }
            Err(e) => {
                requests.unregister(request_id);
                self.inner.drop_connection(&connection);
                Err(e.into())
            }
        }
    }

    /// Join two running nodes in this process with a connection pair.
    pub fn connect_pair(a: &LocalNode, b: &LocalNode) -> Result<(), NodeError> {
        if !a.is_running() || !b.is_running() {
            return Err(NodeError::Closed);
        }
        let (a_end, b_end) = Connection::pair()?;
        a.inner.add_peer(b.node_id(), a_end.clone());
        b.inner.add_peer(a.node_id(), b_end.clone());
        a.inner.add_to_set(a_end);
        b.inner.add_to_set(b_end);
        Ok(())
    }

    /// Attach an externally created group connection used for fan-out to
    /// `node`.
    pub fn set_multicast(&self, node: NodeId, connection: ConnectionHandle) -> bool {
        self.inner.peers.write().set_multicast(node, connection)
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.inner.is_reachable(node)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.inner.peers.read().nodes()
    }

    /// Create a session mastered by this node.
    pub fn create_session(&self) -> Result<Session, NodeError> {
        if !self.is_running() {
            return Err(NodeError::Closed);
        }
        let session = SessionInner::new(SessionId::generate(), self.inner.node_id, &self.inner);
        self.inner.sessions.write().insert(session.id(), session.clone());
        info!("created session {}", session.id());
        Ok(Session::from_inner(session))
    }

    /// Join a session mastered by `master`.
    pub fn map_session(&self, master: NodeId, session_id: SessionId) -> Result<Session, NodeError> {
        if let Some(existing) = self.inner.session(session_id) {
            return Ok(Session::from_inner(existing));
        }
        let requests = &self.inner.requests;
        let request_id = requests.register();
        let packet = Packet::session(session_id, PacketBody::MapSession { request_id });
        if let Err(e) = self.inner.send(master, &packet) {
            requests.unregister(request_id);
            return Err(e);
        }

        match requests.wait(request_id, Some(self.inner.config.request_timeout)) {
            Ok(Reply::Bool(true)) => {
                let session = SessionInner::new(session_id, master, &self.inner);
                self.inner.sessions.write().insert(session_id, session.clone());
                info!("mapped session {} from {}", session_id, master);
                Ok(Session::from_inner(session))
            }
            Ok(_) => Err(NodeError::UnknownSession(session_id)),
            Err(e) => {
                requests.unregister(request_id);
                Err(e.into())
            }
        }
    }

    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.inner.session(session_id).map(Session::from_inner)
    }

    /// Stop the threads, close every connection and detach all objects.
    pub fn close(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("node {} closing", self.inner.node_id);

        let stop = Packet::node(PacketBody::NodeStop);
        for peer in self.peers() {
            if peer == self.inner.node_id {
                continue;
            }
            if let Err(e) = self.inner.send_raw(peer, &stop) {
                debug!("stop notice to {} failed: {}", peer, e);
            }
        }
        let self_connection = self.inner.peers.read().connection(self.inner.node_id);
        if let Some(connection) = self_connection {
            if let Err(e) = connection.send(&stop.encode(), false) {
                warn!("stop packet not delivered: {}", e);
            }
        }
        self.inner.enqueue(Job::Stop);

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                warn!("node thread panicked");
            }
        }

        for listener in self.listeners.lock().drain(..) {
            listener.close();
        }
        for connection in self.inner.peers.write().drain() {
            connection.close();
        }
        if let Some(set) = self.inner.set.lock().take() {
            set.clear();
        }
        let sessions: Vec<_> = self.inner.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.clear();
        }
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("node_id", &self.inner.node_id)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    #[test]
    fn test_node_rejects_unknown_codec() {
        let mut config = NodeConfig::test();
        config.compression.codec = "lz-nope".to_string();
        assert!(matches!(LocalNode::new(config), Err(NodeError::Codec(_))));
    }

    #[test]
    fn test_operations_need_running_node() {
        let node = LocalNode::new(NodeConfig::test()).unwrap();
        assert!(!node.is_running());
        assert!(matches!(node.create_session(), Err(NodeError::Closed)));
        assert!(matches!(
            node.connect(&ConnectionDescription::tcp("127.0.0.1", 1)),
            Err(NodeError::Closed)
        ));
    }

    #[test]
    fn test_listen_and_close() {
        let node = LocalNode::new(NodeConfig::test()).unwrap();
        node.listen().unwrap();
        assert!(node.is_running());
        assert!(node.is_connected(node.node_id()));
        let session = node.create_session().unwrap();
        assert!(node.session(session.id()).is_some());

        node.close();
        assert!(!node.is_running());
        assert!(node.session(session.id()).is_none());
        assert!(matches!(node.listen(), Err(NodeError::Closed)));
    }

    #[test]
    fn test_connect_pair_makes_nodes_reachable() {
        let a = LocalNode::new(NodeConfig::test()).unwrap();
        let b = LocalNode::new(NodeConfig::test()).unwrap();
        a.listen().unwrap();
        b.listen().unwrap();
        LocalNode::connect_pair(&a, &b).unwrap();
        assert!(a.is_connected(b.node_id()));
        assert!(b.is_connected(a.node_id()));
    }
}
