//! Barrier rendezvous across nodes

mod common;

use common::{Cluster, TIMEOUT};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use versync::{Barrier, BarrierError, Version};

/// Register a barrier on node 0 and map it on every other node.
fn barriers(cluster: &Cluster, height: u32) -> Vec<Barrier> {
    let master = Barrier::new(height).unwrap();
    let id = cluster.sessions[0].register_object(&master).unwrap();
    let mut all = vec![master];
    for session in &cluster.sessions[1..] {
        let slave = Barrier::new(1).unwrap();
        session.map_object(&slave, id, Version::OLDEST).unwrap();
        assert_eq!(slave.height(), height);
        all.push(slave);
    }
    all
}

#[test]
fn test_barrier_rounds_across_nodes() {
    let cluster = Cluster::new(3);
    let all = barriers(&cluster, 3);
    let rounds = 10;

    let handles: Vec<_> = all
        .into_iter()
        .map(|barrier| {
            thread::spawn(move || {
                for _ in 0..rounds {
                    barrier.enter(TIMEOUT).unwrap();
                }
                barrier.rounds()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), rounds);
    }
}

#[test]
fn test_barrier_waits_for_height() {
    let cluster = Cluster::new(2);
    let all = barriers(&cluster, 2);
    let master = all[0].clone();
    let slave = all[1].clone();

    let entered = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = entered.clone();
    let waiter = thread::spawn(move || {
        slave.enter(TIMEOUT).unwrap();
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!entered.load(std::sync::atomic::Ordering::SeqCst));
    master.enter(TIMEOUT).unwrap();
    waiter.join().unwrap();
    assert!(entered.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(master.rounds(), 1);
}

#[test]
fn test_barrier_timeout_then_retry() {
    let cluster = Cluster::new(3);
    let all = barriers(&cluster, 3);

    let short = Some(Duration::from_millis(100));
    let partial: Vec<_> = all[..2]
        .iter()
        .cloned()
        .map(|barrier| thread::spawn(move || barrier.enter(short)))
        .collect();
    for handle in partial {
        let err = handle.join().unwrap().unwrap_err();
        assert!(
            matches!(err, BarrierError::Timeout { version: Version(1), height: 3 }),
            "unexpected error: {}",
            err
        );
    }
    assert!(all.iter().all(|b| b.rounds() == 0));

    // Everybody enters: the timed-out entrants retry their round.
    let full: Vec<_> = all
        .iter()
        .cloned()
        .map(|barrier| thread::spawn(move || barrier.enter(TIMEOUT)))
        .collect();
    for handle in full {
        handle.join().unwrap().unwrap();
    }
    assert!(all.iter().all(|b| b.rounds() == 1));
}

#[test]
fn test_barrier_height_change_is_replicated() {
    let cluster = Cluster::new(3);
    let all = barriers(&cluster, 3);

    all[0].set_height(2).unwrap();
    assert_eq!(all[0].commit(TIMEOUT).unwrap(), Version(2));
    for slave in &all[1..] {
        assert_eq!(slave.sync(Version(2), TIMEOUT).unwrap(), Version(2));
        assert_eq!(slave.height(), 2);
    }
    assert!(matches!(
        all[1].set_height(4),
        Err(BarrierError::Object(_))
    ));

    // Two of the three nodes are enough now.
    let pair: Vec<_> = all[1..]
        .iter()
        .cloned()
        .map(|barrier| thread::spawn(move || barrier.enter(TIMEOUT)))
        .collect();
    for handle in pair {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(all[0].rounds(), 0);
}
