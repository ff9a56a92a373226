//! Routing table from node ids to connections.

use crate::connection::ConnectionHandle;
use crate::types::NodeId;
use ahash::{AHashMap, AHashSet};

struct Peer {
    connection: ConnectionHandle,
    /// Shared group connection reaching this node among others
    multicast: Option<ConnectionHandle>,
}

#[derive(Default)]
pub(crate) struct PeerTable {
    by_node: AHashMap<NodeId, Peer>,
    /// connection id -> node the packets on it come from
    origins: AHashMap<u64, NodeId>,
}

impl PeerTable {
    /// Route to `node` over `connection`, which also identifies its packets.
    pub fn insert(&mut self, node: NodeId, connection: ConnectionHandle) {
        self.origins.insert(connection.id(), node);
        // A replaced route keeps its origin entry until it disconnects.
        self.by_node.insert(
            node,
            Peer {
                connection,
                multicast: None,
            },
        );
    }

    /// Packets on `connection_id` come from `node` (receive side of a pair).
    pub fn insert_origin(&mut self, connection_id: u64, node: NodeId) {
        self.origins.insert(connection_id, node);
    }

    pub fn set_multicast(&mut self, node: NodeId, connection: ConnectionHandle) -> bool {
        match self.by_node.get_mut(&node) {
            Some(peer) => {
                peer.multicast = Some(connection);
                true
            }
            None => false,
        }
    }

    pub fn origin(&self, connection_id: u64) -> Option<NodeId> {
        self.origins.get(&connection_id).copied()
    }

    pub fn connection(&self, node: NodeId) -> Option<ConnectionHandle> {
        self.by_node.get(&node).map(|p| p.connection.clone())
    }

    /// Forget `connection_id`. Returns the node if it was that node's route.
    pub fn remove_connection(&mut self, connection_id: u64) -> Option<NodeId> {
        let node = self.origins.remove(&connection_id)?;
        let is_route = self
            .by_node
            .get(&node)
            .is_some_and(|p| p.connection.id() == connection_id);
        if is_route {
            self.by_node.remove(&node);
            Some(node)
        } else {
            None
        }
    }

    /// Connections reaching `nodes`. Nodes sharing a multicast group are
    /// served by one send on that group.
    pub fn connections_for(&self, nodes: &[NodeId]) -> Vec<ConnectionHandle> {
        let mut seen = AHashSet::new();
        let mut connections = Vec::with_capacity(nodes.len());
        for node in nodes {
            let Some(peer) = self.by_node.get(node) else {
                continue;
            };
            let connection = peer.multicast.as_ref().unwrap_or(&peer.connection);
            if seen.insert(connection.id()) {
                connections.push(connection.clone());
            }
        }
        connections
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.by_node.keys().copied().collect()
    }

    /// Every distinct connection, for shutdown.
    pub fn drain(&mut self) -> Vec<ConnectionHandle> {
        self.origins.clear();
        let mut seen = AHashSet::new();
        let mut connections = Vec::new();
        for (_, peer) in self.by_node.drain() {
            for connection in std::iter::once(peer.connection).chain(peer.multicast) {
                if seen.insert(connection.id()) {
                    connections.push(connection);
                }
            }
        }
        connections
    }
}
