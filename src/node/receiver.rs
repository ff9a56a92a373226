//! Receiver thread: reads packets from every connection in the set.
//!
//! Handshakes, request acks, object attach/detach and versioned data are
//! handled here. Everything else goes to the command thread in arrival
//! order.

use super::{Job, NodeInner};
use crate::connection::{ConnectionHandle, ConnectionSet, SelectEvent};
use crate::monitor::Reply;
use crate::protocol::{read_packet, Packet, PacketBody, ProtocolViolation};
use crate::stream::StreamError;
use crate::types::{NodeId, RequestId};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Outcome of handling one packet.
enum Flow {
    Continue,
    Stop,
}

pub(super) fn run(node: Arc<NodeInner>, set: &mut ConnectionSet) {
    debug!("receiver thread started");
    loop {
        match set.select(None) {
            SelectEvent::Connect(listener) => match listener.accept() {
                Ok(connection) => {
                    debug!("accepted connection {}", connection.id());
                    node.add_to_set(connection);
                }
                Err(e) => warn!("accept on connection {} failed: {}", listener.id(), e),
            },
            SelectEvent::Data(connection) => {
                if let Flow::Stop = receive(&node, &connection) {
                    break;
                }
            }
            SelectEvent::Disconnect(connection) => {
                debug!("connection {} hung up", connection.id());
                node.drop_connection(&connection);
            }
            SelectEvent::Error(Some(connection)) => {
                warn!("error on connection {}", connection.id());
                node.drop_connection(&connection);
            }
            SelectEvent::Error(None) => {
                error!("connection set wait failed, receiver exiting");
                break;
            }
            SelectEvent::Timeout | SelectEvent::Interrupt => {}
        }
    }
    debug!("receiver thread stopped");
}

fn receive(node: &Arc<NodeInner>, connection: &ConnectionHandle) -> Flow {
    let packet = match read_packet(connection, node.config().max_packet_size) {
        Ok(packet) => packet,
        Err(StreamError::Protocol(violation)) => {
            warn!(
                "protocol violation on connection {}: {}",
                connection.id(),
                violation
            );
            node.drop_connection(connection);
            return Flow::Continue;
        }
        Err(e) => {
            debug!("read on connection {} failed: {}", connection.id(), e);
            node.drop_connection(connection);
            return Flow::Continue;
        }
    };
    trace!(
        "received {:?} on connection {}",
        packet.command(),
        connection.id()
    );

    // Handshake packets arrive before the connection has an origin.
    match packet.body {
        PacketBody::NodeConnect {
            request_id,
            node_id,
        } => {
            accept_peer(node, connection, request_id, node_id);
            return Flow::Continue;
        }
        PacketBody::NodeConnectReply {
            request_id,
            node_id,
        } => {
            node.add_peer(node_id, connection.clone());
            node.requests().serve(request_id, Reply::Node(node_id));
            return Flow::Continue;
        }
        _ => {}
    }

    let Some(origin) = node.peers.read().origin(connection.id()) else {
        warn!(
            "{:?} on connection {} before handshake",
            packet.command(),
            connection.id()
        );
        node.drop_connection(connection);
        return Flow::Continue;
    };

    match dispatch(node, packet, origin) {
        Ok(flow) => flow,
        Err(violation) => {
            warn!("protocol violation from {}: {}", origin, violation);
            if origin != node.node_id() {
                node.drop_connection(connection);
            }
            Flow::Continue
        }
    }
}

fn accept_peer(
    node: &Arc<NodeInner>,
    connection: &ConnectionHandle,
    request_id: RequestId,
    peer: NodeId,
) {
    if peer == node.node_id() {
        warn!("node connected to itself on connection {}", connection.id());
        node.drop_connection(connection);
        return;
    }
    node.add_peer(peer, connection.clone());
    let reply = Packet::node(PacketBody::NodeConnectReply {
        request_id,
        node_id: node.node_id(),
    });
    if let Err(e) = connection.send(&reply.encode(), false) {
        warn!("handshake reply to {} failed: {}", peer, e);
        node.drop_connection(connection);
    } else {
        info!("node {} connected", peer);
    }
}

fn dispatch(node: &Arc<NodeInner>, packet: Packet, origin: NodeId) -> Result<Flow, ProtocolViolation> {
    let command = packet.command();
    match packet.body {
        PacketBody::NodeStop => {
            if origin == node.node_id() {
                return Ok(Flow::Stop);
            }
            info!("node {} stopping", origin);
            node.drop_peer(origin);
            return Ok(Flow::Continue);
        }
        PacketBody::AckRequest { request_id } => {
            node.requests().serve(request_id, Reply::None);
            return Ok(Flow::Continue);
        }
        _ => {}
    }

    if !command.runs_in_receiver() {
        node.enqueue(Job::Packet(packet, origin));
        return Ok(Flow::Continue);
    }

    match node.session(packet.session_id) {
        Some(session) => session.handle_in_receiver(node, packet, origin)?,
        None => debug!(
            "{:?} for unknown session {} dropped",
            command, packet.session_id
        ),
    }
    Ok(Flow::Continue)
}
