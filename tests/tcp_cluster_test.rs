//! Nodes joined over loopback TCP

mod common;

use common::{Counter, TIMEOUT};
use std::thread;
use std::time::{Duration, Instant};
use versync::{ConnectionDescription, LocalNode, NodeConfig, Object, Version};

fn listening_node() -> LocalNode {
    let mut config = NodeConfig::test();
    config.listeners = vec![ConnectionDescription::tcp("127.0.0.1", 0)];
    let node = LocalNode::new(config).unwrap();
    node.listen().unwrap();
    node
}

fn plain_node() -> LocalNode {
    let node = LocalNode::new(NodeConfig::test()).unwrap();
    node.listen().unwrap();
    node
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_connect_handshake() {
    let server = listening_node();
    let client = plain_node();

    let listeners = server.listener_descriptions();
    assert_eq!(listeners.len(), 1);
    assert_ne!(listeners[0].port, 0);

    let remote = client.connect(&listeners[0]).unwrap();
    assert_eq!(remote, server.node_id());
    assert!(client.is_connected(server.node_id()));
    assert!(wait_until(|| server.is_connected(client.node_id())));

    client.close();
    assert!(wait_until(|| !server.is_connected(client.node_id())));
    server.close();
}

#[test]
fn test_replication_over_tcp() {
    let server = listening_node();
    let client = plain_node();
    client.connect(&server.listener_descriptions()[0]).unwrap();
    assert!(wait_until(|| server.is_connected(client.node_id())));

    let session = server.create_session().unwrap();
    let mapped = client.map_session(server.node_id(), session.id()).unwrap();

    let master = Object::new(Counter::default());
    // Large enough to cross several chunks on the socket.
    master.lock().label = "tcp ".repeat(10_000);
    session.register_object(&master).unwrap();

    let slave = Object::new(Counter::default());
    mapped.map_object(&slave, master.id(), Version::OLDEST).unwrap();
    assert_eq!(slave.lock().label.len(), 40_000);

    for value in 1..=3 {
        master.lock().value = value;
        master.commit(TIMEOUT).unwrap();
    }
    assert_eq!(slave.sync(Version(4), TIMEOUT).unwrap(), Version(4));
    assert_eq!(slave.lock().value, 3);

    mapped.unmap_object(&slave).unwrap();
    assert_eq!(master.slave_count(), 0);

    client.close();
    server.close();
}

#[test]
fn test_connect_to_closed_port_fails() {
    let server = listening_node();
    let description = server.listener_descriptions()[0].clone();
    server.close();

    let client = plain_node();
    assert!(client.connect(&description).is_err());
    assert!(client.peers().iter().all(|p| *p == client.node_id()));
}
