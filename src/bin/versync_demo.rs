//! Frame-synchronized replication over loopback TCP.
//!
//! One master node commits a frame object and every slave node follows it,
//! meeting at a barrier after each frame.
//!
//! Usage: versync-demo [slaves] [frames]

use serde::Serialize;
use std::env;
use std::thread;
use std::time::{Duration, Instant};
use versync::observability::init_tracing;
use versync::{
    Barrier, ConnectionDescription, DataIStream, DataOStream, Distributable, LocalNode,
    NodeConfig, Object, ObjectId, Session, StreamError, Version,
};

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

#[derive(Debug, Default)]
struct Frame {
    number: u64,
    payload: Vec<u8>,
    checksum: u32,
}

impl Frame {
    fn advance(&mut self) {
        self.number += 1;
        let seed = self.number as u8;
        self.payload = (0..4096u32).map(|i| seed.wrapping_add((i / 64) as u8)).collect();
        self.checksum = crc32fast::hash(&self.payload);
    }

    fn is_intact(&self) -> bool {
        crc32fast::hash(&self.payload) == self.checksum
    }
}

impl Distributable for Frame {
    fn get_instance_data(&self, os: &mut DataOStream) -> Result<(), StreamError> {
        os.write_u64(self.number)?;
        os.write_bytes(&self.payload)?;
        os.write_u32(self.checksum)
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<(), StreamError> {
        self.number = is.read_u64()?;
        self.payload = is.read_bytes()?;
        self.checksum = is.read_u32()?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SlaveReport {
    node: String,
    frames: u64,
    last_version: String,
    corrupt: u64,
}

#[derive(Debug, Serialize)]
struct Report {
    slaves: usize,
    frames: u64,
    elapsed_ms: u128,
    frames_per_sec: f64,
    results: Vec<SlaveReport>,
}

fn run_slave(
    node: LocalNode,
    session: Session,
    frame_id: ObjectId,
    barrier_id: ObjectId,
    frames: u64,
) -> Result<SlaveReport, Box<dyn std::error::Error + Send + Sync>> {
    let frame = Object::new(Frame::default());
    session.map_object(&frame, frame_id, Version::OLDEST)?;
    let barrier = Barrier::new(1)?;
    session.map_object(&barrier, barrier_id, Version::OLDEST)?;
    barrier.enter(TIMEOUT)?;

    let mut corrupt = 0;
    let mut last_version = frame.version();
    for _ in 0..frames {
        last_version = frame.sync(Version::NEXT, TIMEOUT)?;
        if !frame.lock().is_intact() {
            corrupt += 1;
        }
        barrier.enter(TIMEOUT)?;
    }

    let report = SlaveReport {
        node: node.node_id().to_string(),
        frames: frame.lock().number,
        last_version: last_version.to_string(),
        corrupt,
    };
    node.close();
    Ok(report)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let slaves: usize = env::args().nth(1).map_or(Ok(3), |s| s.parse())?;
    let frames: u64 = env::args().nth(2).map_or(Ok(100), |s| s.parse())?;

    let mut config = NodeConfig::from_env()?;
    init_tracing(&config.log);
    if config.listeners.is_empty() {
        config.listeners = vec![ConnectionDescription::tcp("127.0.0.1", 0)];
    }

    let master = LocalNode::new(config)?;
    master.listen()?;
    let address = master
        .listener_descriptions()
        .into_iter()
        .next()
        .ok_or("master has no listener")?;
    println!("master {} listening on {}", master.node_id(), address);

    let session = master.create_session()?;
    let frame = Object::new(Frame::default());
    let frame_id = session.register_object(&frame)?;
    let barrier = Barrier::new(slaves as u32 + 1)?;
    let barrier_id = session.register_object(&barrier)?;

    let mut handles = Vec::with_capacity(slaves);
    for _ in 0..slaves {
        let node = LocalNode::new(NodeConfig::from_env()?)?;
        node.listen()?;
        node.connect(&address)?;
        let mapped = node.map_session(master.node_id(), session.id())?;
        handles.push(thread::spawn(move || {
            run_slave(node, mapped, frame_id, barrier_id, frames)
        }));
    }

    barrier.enter(TIMEOUT)?;
    let start = Instant::now();
    for _ in 0..frames {
        frame.lock().advance();
        frame.commit(TIMEOUT)?;
        barrier.enter(TIMEOUT)?;
    }
    let elapsed = start.elapsed();

    let mut results = Vec::with_capacity(slaves);
    for handle in handles {
        match handle.join() {
            Ok(Ok(report)) => results.push(report),
            Ok(Err(e)) => return Err(format!("slave failed: {}", e).into()),
            Err(_) => return Err("slave thread panicked".into()),
        }
    }

    let report = Report {
        slaves,
        frames,
        elapsed_ms: elapsed.as_millis(),
        frames_per_sec: frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        results,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    master.close();
    Ok(())
}
