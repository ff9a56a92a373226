//! Command thread: runs queued packets that may lock change managers.

use super::{Job, NodeInner};
use crate::monitor::Reply;
use crate::protocol::{Packet, PacketBody};
use crate::types::NodeId;
use crossbeam::channel::Receiver;
use std::sync::Arc;
use tracing::{debug, warn};

pub(super) fn run(node: Arc<NodeInner>, jobs: Receiver<Job>) {
    debug!("command thread started");
    for job in jobs.iter() {
        match job {
            Job::Packet(packet, origin) => handle(&node, packet, origin),
            Job::NodeDown(peer) => {
                let sessions: Vec<_> = node.sessions.read().values().cloned().collect();
                for session in sessions {
                    session.notify_node_down(peer);
                }
            }
            Job::Stop => break,
        }
    }
    debug!("command thread stopped");
}

fn handle(node: &Arc<NodeInner>, packet: Packet, origin: NodeId) {
    match packet.body {
        PacketBody::MapSession { request_id } => {
            let ok = node.session(packet.session_id).is_some();
            if !ok {
                warn!("{} mapped unknown session {}", origin, packet.session_id);
            }
            let reply = Packet::session(
                packet.session_id,
                PacketBody::MapSessionReply { request_id, ok },
            );
            if let Err(e) = node.send(origin, &reply) {
                warn!("map session reply to {} failed: {}", origin, e);
            }
        }
        PacketBody::MapSessionReply { request_id, ok } => {
            node.requests().serve(request_id, Reply::Bool(ok));
        }
        _ => {
            let Some(session) = node.session(packet.session_id) else {
                debug!(
                    "{:?} for unknown session {} dropped",
                    packet.command(),
                    packet.session_id
                );
                return;
            };
            if let Err(violation) = session.handle_command(node, packet, origin) {
                warn!("protocol violation from {}: {}", origin, violation);
                node.drop_peer(origin);
            }
        }
    }
}
