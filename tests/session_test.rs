//! Session id management and object lifecycle

mod common;

use common::{Cluster, Counter};
use versync::{NodeConfig, NodeError, Object, ObjectId, SessionError, SessionId, Version};

#[test]
fn test_session_master_and_mapping() {
    let cluster = Cluster::new(3);
    assert!(cluster.sessions[0].is_master().unwrap());
    for session in &cluster.sessions[1..] {
        assert!(!session.is_master().unwrap());
        assert_eq!(session.id(), cluster.sessions[0].id());
        assert_eq!(session.master_node(), cluster.nodes[0].node_id());
    }

    // Mapping again returns the existing session.
    let again = cluster.nodes[1]
        .map_session(cluster.nodes[0].node_id(), cluster.sessions[0].id())
        .unwrap();
    assert_eq!(again.id(), cluster.sessions[1].id());
    assert!(cluster.nodes[1].session(again.id()).is_some());
}

#[test]
fn test_map_unknown_session() {
    let cluster = Cluster::new(2);
    let err = cluster.nodes[1]
        .map_session(cluster.nodes[0].node_id(), SessionId::generate())
        .unwrap_err();
    assert!(matches!(err, NodeError::UnknownSession(_)), "{}", err);
}

#[test]
fn test_gen_ids_master_and_cached_ranges() {
    let cluster = Cluster::new(2);
    let master = &cluster.sessions[0];
    let slave = &cluster.sessions[1];

    assert_eq!(master.gen_ids(10).unwrap(), ObjectId(1));

    // The slave fetches a minimum-sized block and serves later calls from it.
    let first = slave.gen_ids(5).unwrap();
    assert_eq!(first, ObjectId(11));
    assert_eq!(slave.gen_ids(5).unwrap(), ObjectId(16));

    let min_range = NodeConfig::test().min_id_range as u128;
    assert_eq!(master.gen_ids(1).unwrap(), ObjectId(11 + min_range));
}

#[test]
fn test_free_ids_are_reused() {
    let cluster = Cluster::new(1);
    let session = &cluster.sessions[0];
    let a = session.gen_ids(4).unwrap();
    let b = session.gen_ids(4).unwrap();
    assert_eq!(b, a.offset(4));
    session.free_ids(a, 4).unwrap();
    assert_eq!(session.gen_ids(2).unwrap(), a);
    assert_eq!(session.gen_ids(2).unwrap(), a.offset(2));
}

#[test]
fn test_ids_exhausted() {
    let mut config = NodeConfig::test();
    config.id_pool_capacity = 100;
    config.min_id_range = 64;
    let cluster = Cluster::with_config(2, config);

    assert!(matches!(
        cluster.sessions[0].gen_ids(101),
        Err(SessionError::IdsExhausted { requested: 101 })
    ));
    assert!(cluster.sessions[1].gen_ids(1).is_ok());
    // 64 ids went to the slave's cache; the master cannot serve another block.
    assert!(matches!(
        cluster.sessions[1].gen_ids(65),
        Err(SessionError::IdsExhausted { requested: 65 })
    ));
}

#[test]
fn test_id_master_lookup() {
    let cluster = Cluster::new(3);
    let owner = cluster.nodes[1].node_id();
    let start = cluster.sessions[1].gen_ids(8).unwrap();
    cluster.sessions[1].set_id_master(start, 8, owner).unwrap();

    assert_eq!(cluster.sessions[2].get_id_master(start.offset(3)).unwrap(), owner);
    assert_eq!(cluster.sessions[0].get_id_master(start).unwrap(), owner);
    assert!(matches!(
        cluster.sessions[2].get_id_master(start.offset(8)),
        Err(SessionError::UnknownMaster(_))
    ));
}

#[test]
fn test_register_twice_is_rejected() {
    let cluster = Cluster::new(1);
    let object = Object::new(Counter::default());
    let id = cluster.sessions[0].register_object(&object).unwrap();
    assert!(object.is_master());
    assert_eq!(object.id(), id);
    assert_eq!(cluster.sessions[0].object_count(), 1);

    assert!(matches!(
        cluster.sessions[0].register_object(&object),
        Err(SessionError::AlreadyAttached)
    ));
    assert_eq!(cluster.sessions[0].get_id_master(id).unwrap(), cluster.nodes[0].node_id());

    cluster.sessions[0].deregister_object(&object).unwrap();
    assert_eq!(cluster.sessions[0].object_count(), 0);
    assert!(matches!(
        cluster.sessions[0].get_id_master(id),
        Err(SessionError::UnknownMaster(_))
    ));
}

#[test]
fn test_attach_and_detach_local_instance() {
    let cluster = Cluster::new(1);
    let session = &cluster.sessions[0];
    let object = Object::new(Counter::default());
    let id = session.gen_ids(1).unwrap();

    let instance = session.attach_object(&object, id).unwrap();
    assert!(object.is_attached());
    assert!(!object.is_master());
    assert_eq!(object.instance_id(), instance);
    assert_eq!(object.id(), id);

    session.detach_object(&object).unwrap();
    assert!(!object.is_attached());
    assert_eq!(session.object_count(), 0);
}

#[test]
fn test_map_unknown_object() {
    let cluster = Cluster::new(2);
    let object = Object::new(Counter::default());
    let err = cluster.sessions[1]
        .map_object(&object, ObjectId(4242), Version::HEAD)
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownMaster(ObjectId(4242))), "{}", err);
    assert!(!object.is_attached());
}

#[test]
fn test_local_slave_of_local_master() {
    let cluster = Cluster::new(1);
    let session = &cluster.sessions[0];
    let master = Object::new(Counter::default());
    master.lock().value = 3;
    let id = session.register_object(&master).unwrap();

    let slave = Object::new(Counter::default());
    assert_eq!(session.map_object(&slave, id, Version::OLDEST).unwrap(), Version::FIRST);
    assert_eq!(slave.lock().value, 3);
    assert_eq!(session.object_count(), 2);

    master.lock().value = 4;
    master.commit(common::TIMEOUT).unwrap();
    assert_eq!(slave.sync(Version::NEXT, common::TIMEOUT).unwrap(), Version(2));
    assert_eq!(slave.lock().value, 4);
}
