//! Network side of an attached object: packet addressing and data streams.

use crate::connection::ConnectionHandle;
use crate::node::{NodeError, NodeInner};
use crate::protocol::{DataKind, ObjectData, Packet, PacketBody};
use crate::stream::{ChunkFramer, DataOStream, WireChunk};
use crate::types::{InstanceId, NodeId, ObjectId, SessionId, Version};
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Frames stream chunks as versioned object data packets.
pub(crate) struct ObjectFramer {
    session_id: SessionId,
    object_id: ObjectId,
    target: Arc<AtomicU32>,
    kind: DataKind,
    version: Version,
    sequence: u32,
}

impl ChunkFramer for ObjectFramer {
    fn reset(&mut self) {
        self.sequence = 0;
    }

    fn frame(&mut self, chunk: &WireChunk, last: bool) -> Bytes {
        let packet = Packet::object(
            self.session_id,
            self.object_id,
            self.target.load(Ordering::Acquire),
            PacketBody::ObjectData(ObjectData {
                kind: self.kind,
                version: self.version,
                sequence: self.sequence,
                last,
                chunk: chunk.clone(),
            }),
        );
        self.sequence += 1;
        packet.encode()
    }
}

/// A data stream whose destination instance can be changed between resends.
pub(crate) struct VersionStream {
    pub version: Version,
    pub stream: DataOStream,
    target: Arc<AtomicU32>,
}

impl VersionStream {
    /// Send the saved message to `instance_id` on `connections`.
    pub fn resend_to(&mut self, connections: &[ConnectionHandle], instance_id: InstanceId) {
        let previous = self.target.swap(instance_id, Ordering::AcqRel);
        self.stream.resend(connections);
        self.target.store(previous, Ordering::Release);
    }

    pub fn saved_len(&self) -> usize {
        self.stream.saved_data().len()
    }
}

#[derive(Clone)]
pub(crate) struct ObjectLink {
    pub node: Arc<NodeInner>,
    pub session_id: SessionId,
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
}

impl ObjectLink {
    #[inline]
    pub fn local_node_id(&self) -> NodeId {
        self.node.node_id()
    }

    /// New stream for one message of `kind` at `version`, addressed to `target`.
    pub fn stream(
        &self,
        kind: DataKind,
        version: Version,
        target: InstanceId,
        save: bool,
    ) -> VersionStream {
        let target = Arc::new(AtomicU32::new(target));
        let framer = ObjectFramer {
            session_id: self.session_id,
            object_id: self.object_id,
            target: target.clone(),
            kind,
            version,
            sequence: 0,
        };
        let mut stream = self.node.new_ostream(Box::new(framer));
        if save {
            stream.enable_save();
        }
        VersionStream {
            version,
            stream,
            target,
        }
    }

    pub fn connections(&self, nodes: &[NodeId]) -> Vec<ConnectionHandle> {
        self.node.connections_for(nodes)
    }

    /// Send an object packet to `instance_id` of this object on `node`.
    pub fn send(
        &self,
        node: NodeId,
        instance_id: InstanceId,
        body: PacketBody,
    ) -> Result<(), NodeError> {
        let packet = Packet::object(self.session_id, self.object_id, instance_id, body);
        self.node.send(node, &packet)
    }

    /// Send an object packet to this instance through the local node.
    pub fn send_self(&self, body: PacketBody) -> Result<(), NodeError> {
        self.send(self.local_node_id(), self.instance_id, body)
    }
}
