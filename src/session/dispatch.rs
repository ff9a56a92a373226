//! Session packet handlers.
//!
//! `handle_in_receiver` runs on the receiver thread and is the only writer of
//! the object registry. `handle_command` runs on the command thread and may
//! lock change managers.

use super::{IdMasterMap, PendingAttach, SessionInner};
use crate::monitor::Reply;
use crate::node::NodeInner;
use crate::object::link::ObjectLink;
use crate::object::{ObjectCore, ObjectError};
use crate::protocol::{DataKind, ObjectData, Packet, PacketBody, ProtocolViolation};
use crate::types::{
    InstanceId, NodeId, ObjectId, RequestId, Version, INSTANCE_ALL, INSTANCE_INVALID,
    REQUEST_INVALID,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl SessionInner {
    pub(crate) fn handle_in_receiver(
        self: &Arc<Self>,
        node: &Arc<NodeInner>,
        packet: Packet,
        origin: NodeId,
    ) -> Result<(), ProtocolViolation> {
        match &packet.body {
            PacketBody::AttachObject { request_id } => {
                self.attach_pending(node, &packet, *request_id, origin)
            }
            PacketBody::MapObject {
                request_id,
                version,
                ..
            } => {
                trace!("map {} at {} attaches locally", packet.object_id, version);
                self.attach_pending(node, &packet, *request_id, origin)
            }
            PacketBody::DetachObject { request_id } => {
                self.detach_instance(&packet);
                node.requests().serve(*request_id, Reply::None);
                Ok(())
            }
            PacketBody::SubscribeObjectReply {
                request_id,
                ok,
                version,
                master_instance_id,
                oldest,
                head,
            } => {
                node.requests().serve(
                    *request_id,
                    Reply::Subscribe {
                        ok: *ok,
                        version: *version,
                        master_instance_id: *master_instance_id,
                        oldest: *oldest,
                        head: *head,
                    },
                );
                Ok(())
            }
            PacketBody::ObjectData(data) => self.deliver_data(node, &packet, data, origin),
            _ => Err(ProtocolViolation::UnexpectedPacket(format!(
                "{:?} on receiver thread",
                packet.command()
            ))),
        }
    }

    fn attach_pending(
        self: &Arc<Self>,
        node: &Arc<NodeInner>,
        packet: &Packet,
        request_id: RequestId,
        origin: NodeId,
    ) -> Result<(), ProtocolViolation> {
        if origin != node.node_id() {
            return Err(ProtocolViolation::UnexpectedPacket(
                "attach request from a remote node".to_string(),
            ));
        }
        let PendingAttach { core, master_node } = self
            .pending
            .lock()
            .remove(&request_id)
            .ok_or_else(|| {
                ProtocolViolation::UnexpectedPacket(format!(
                    "attach of {} without pending request",
                    packet.object_id
                ))
            })?;

        let (key, instance_id) = self.registry.write().insert(packet.object_id, core.clone());
        let link = ObjectLink {
            node: node.clone(),
            session_id: self.id,
            object_id: packet.object_id,
            instance_id,
        };
        let master_instance_id = if master_node == node.node_id() {
            instance_id
        } else {
            INSTANCE_INVALID
        };
        core.attach(link, Arc::downgrade(self), key, master_node, master_instance_id);
        node.requests().serve(request_id, Reply::Bool(true));
        Ok(())
    }

    fn detach_instance(&self, packet: &Packet) {
        let core = self
            .registry
            .read()
            .instance(packet.object_id, packet.instance_id);
        let Some(core) = core else {
            debug!(
                "detach of unknown instance {}:{}",
                packet.object_id, packet.instance_id
            );
            return;
        };
        if let Some(key) = core.key() {
            self.registry.write().remove(key);
        }
        core.detach();
        core.inbox.clear();
    }

    fn deliver_data(
        &self,
        node: &NodeInner,
        packet: &Packet,
        data: &ObjectData,
        origin: NodeId,
    ) -> Result<(), ProtocolViolation> {
        let payload = data
            .chunk
            .payload(node.codecs())
            .map_err(|e| ProtocolViolation::MalformedChunk(e.to_string()))?;

        let direct = packet.instance_id != INSTANCE_ALL;
        let targets = {
            let registry = self.registry.read();
            if direct {
                registry
                    .instance(packet.object_id, packet.instance_id)
                    .into_iter()
                    .collect()
            } else {
                registry.instances(packet.object_id)
            }
        };
        if targets.is_empty() {
            trace!(
                "{:?} v{} for unattached {}:{} dropped",
                data.kind,
                data.version,
                packet.object_id,
                packet.instance_id
            );
            return Ok(());
        }

        for core in targets {
            // Masters consume slave commits only; their own broadcasts also
            // reach local slaves through the same packet.
            if core.is_master() != (data.kind == DataKind::SlaveDelta) {
                continue;
            }
            core.inbox.push(origin, direct, data, payload.clone())?;
        }
        Ok(())
    }

    pub(crate) fn handle_command(
        self: &Arc<Self>,
        node: &Arc<NodeInner>,
        packet: Packet,
        origin: NodeId,
    ) -> Result<(), ProtocolViolation> {
        match &packet.body {
            PacketBody::GenIds { request_id, range } => {
                let id = self.pool.lock().alloc(*range);
                let allocated = if id.is_some() { *range } else { 0 };
                let reply = Packet::session(
                    self.id,
                    PacketBody::GenIdsReply {
                        request_id: *request_id,
                        id: id.unwrap_or(ObjectId::INVALID),
                        requested: *range,
                        allocated,
                    },
                );
                self.reply(node, origin, &reply);
            }
            PacketBody::GenIdsReply {
                request_id,
                id,
                requested,
                allocated,
            } => {
                if allocated < requested && id.is_valid() {
                    return Err(ProtocolViolation::UnexpectedPacket(format!(
                        "{} ids allocated for {} requested",
                        allocated, requested
                    )));
                }
                node.requests().serve(*request_id, Reply::Id(*id));
            }
            PacketBody::SetIdMaster {
                request_id,
                start,
                range,
                master,
            } => {
                if !IdMasterMap::is_valid_range(*start, *range) {
                    return Err(ProtocolViolation::UnexpectedPacket(format!(
                        "id range {}+{} overflows the id space",
                        start, range
                    )));
                }
                self.id_masters.write().insert(*start, *range, *master);
                trace!("ids {}+{} mastered by {}", start, range, master);
                let ack = Packet::node(PacketBody::AckRequest {
                    request_id: *request_id,
                });
                self.reply(node, origin, &ack);
            }
            PacketBody::GetIdMaster { request_id, id } => {
                let (start, range, master) = self
                    .id_masters
                    .read()
                    .lookup(*id)
                    .unwrap_or((*id, 0, NodeId::ZERO));
                let reply = Packet::session(
                    self.id,
                    PacketBody::GetIdMasterReply {
                        request_id: *request_id,
                        id: *id,
                        start,
                        range,
                        master,
                    },
                );
                self.reply(node, origin, &reply);
            }
            PacketBody::GetIdMasterReply {
                request_id,
                start,
                range,
                master,
                ..
            } => {
                if !master.is_zero() && IdMasterMap::is_valid_range(*start, *range) {
                    self.id_masters.write().insert(*start, *range, *master);
                }
                node.requests().serve(*request_id, Reply::Node(*master));
            }
            PacketBody::SubscribeObject {
                request_id,
                requested,
                slave_instance_id,
            } => self.subscribe(node, &packet, *request_id, *requested, *slave_instance_id, origin),
            PacketBody::UnsubscribeObject {
                request_id,
                master_instance_id,
                slave_instance_id,
            } => {
                let master = self
                    .registry
                    .read()
                    .instance(packet.object_id, *master_instance_id);
                match master {
                    Some(core) => {
                        let removed = core.with_cm(|cm, _| Ok(cm.remove_slave(origin)));
                        if !matches!(removed, Ok(true)) {
                            warn!("unsubscribe of {} from non-slave {}", packet.object_id, origin);
                        }
                    }
                    None => debug!("unsubscribe from unknown master {}", packet.object_id),
                }
                let detach = Packet::object(
                    self.id,
                    packet.object_id,
                    *slave_instance_id,
                    PacketBody::DetachObject {
                        request_id: *request_id,
                    },
                );
                self.reply(node, origin, &detach);
            }
            PacketBody::ObjectCommit { request_id } => {
                match self.local_instance(&packet) {
                    Some(core) => core.handle_commit(*request_id),
                    None => {
                        if *request_id != REQUEST_INVALID {
                            node.requests().serve(
                                *request_id,
                                Reply::Failed(ObjectError::NotAttached.to_string()),
                            );
                        }
                    }
                }
            }
            PacketBody::ObjectObsolete { count } => {
                if let Some(core) = self.local_instance(&packet) {
                    core.handle_obsolete(*count);
                }
            }
            PacketBody::BarrierEnter { .. } | PacketBody::BarrierEnterReply { .. } => {
                let targets = if packet.instance_id == INSTANCE_ALL {
                    self.registry.read().instances(packet.object_id)
                } else {
                    self.local_instance(&packet).into_iter().collect()
                };
                for core in targets {
                    let Some(extension) = core.extension() else {
                        continue;
                    };
                    match extension.handle(&core, &packet, origin) {
                        Ok(()) => {}
                        Err(ObjectError::Protocol(violation)) => return Err(violation),
                        Err(e) => warn!("{:?} on {}: {}", packet.command(), packet.object_id, e),
                    }
                }
            }
            _ => {
                return Err(ProtocolViolation::UnexpectedPacket(format!(
                    "{:?} on command thread",
                    packet.command()
                )))
            }
        }
        Ok(())
    }

    fn local_instance(&self, packet: &Packet) -> Option<Arc<ObjectCore>> {
        self.registry
            .read()
            .instance(packet.object_id, packet.instance_id)
    }

    fn subscribe(
        &self,
        node: &NodeInner,
        packet: &Packet,
        request_id: RequestId,
        requested: Version,
        slave_instance_id: InstanceId,
        origin: NodeId,
    ) {
        let master = self.registry.read().master(packet.object_id);
        let (ok, version, master_instance_id, oldest, head) = match master {
            Some(core) => {
                let result =
                    core.with_cm(|cm, ctx| cm.add_slave(ctx, origin, slave_instance_id, requested));
                let (oldest, head) = (core.oldest_version(), core.version());
                match result {
                    Ok(start) => (true, start, core.instance_id(), oldest, head),
                    Err(e) => {
                        warn!(
                            "subscribe of {} from {} at {} refused: {}",
                            packet.object_id, origin, requested, e
                        );
                        (false, Version::INVALID, core.instance_id(), oldest, head)
                    }
                }
            }
            None => {
                warn!("subscribe to {} which has no master here", packet.object_id);
                (
                    false,
                    Version::INVALID,
                    INSTANCE_INVALID,
                    Version::NONE,
                    Version::NONE,
                )
            }
        };

        let reply = Packet::object(
            self.id,
            packet.object_id,
            slave_instance_id,
            PacketBody::SubscribeObjectReply {
                request_id,
                ok,
                version,
                master_instance_id,
                oldest,
                head,
            },
        );
        self.reply(node, origin, &reply);
    }

    fn reply(&self, node: &NodeInner, to: NodeId, packet: &Packet) {
        if let Err(e) = node.send(to, packet) {
            warn!("reply {:?} to {} failed: {}", packet.command(), to, e);
        }
    }
}
