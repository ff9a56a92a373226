//! In-process cluster used by the integration tests.

#![allow(dead_code)]

use std::time::Duration;
use versync::{
    ChangeType, DataIStream, DataOStream, Distributable, LocalNode, NodeConfig, Session,
    StreamError,
};

pub const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// Nodes joined pairwise by in-process connection pairs. `sessions[i]` is
/// node `i`'s view of one session mastered by node 0.
pub struct Cluster {
    pub nodes: Vec<LocalNode>,
    pub sessions: Vec<Session>,
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        Self::with_config(size, NodeConfig::test())
    }

    pub fn with_config(size: usize, config: NodeConfig) -> Self {
        let nodes: Vec<LocalNode> = (0..size)
            .map(|_| {
                let node = LocalNode::new(config.clone()).unwrap();
                node.listen().unwrap();
                node
            })
            .collect();
        for i in 0..size {
            for j in i + 1..size {
                LocalNode::connect_pair(&nodes[i], &nodes[j]).unwrap();
            }
        }

        let master = nodes[0].create_session().unwrap();
        let mut sessions = vec![master.clone()];
        for node in &nodes[1..] {
            sessions.push(node.map_session(nodes[0].node_id(), master.id()).unwrap());
        }
        Cluster { nodes, sessions }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.close();
        }
    }
}

/// Snapshot-replicated value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Counter {
    pub value: u64,
    pub label: String,
    pub change_type: Option<ChangeType>,
}

impl Counter {
    pub fn new(change_type: ChangeType) -> Self {
        Counter {
            change_type: Some(change_type),
            ..Counter::default()
        }
    }
}

impl Distributable for Counter {
    fn change_type(&self) -> ChangeType {
        self.change_type.unwrap_or(ChangeType::Instance)
    }

    fn get_instance_data(&self, os: &mut DataOStream) -> Result<(), StreamError> {
        os.write_u64(self.value)?;
        os.write_str(&self.label)
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<(), StreamError> {
        self.value = is.read_u64()?;
        self.label = is.read_string()?;
        Ok(())
    }
}

/// Append-only log replicated as deltas.
#[derive(Debug, Default)]
pub struct Log {
    pub entries: Vec<u32>,
    pending: usize,
}

impl Log {
    pub fn push(&mut self, value: u32) {
        self.entries.push(value);
        self.pending += 1;
    }
}

impl Distributable for Log {
    fn change_type(&self) -> ChangeType {
        ChangeType::Delta
    }

    fn get_instance_data(&self, os: &mut DataOStream) -> Result<(), StreamError> {
        os.write_value(&self.entries)
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<(), StreamError> {
        self.entries = is.read_value()?;
        self.pending = 0;
        Ok(())
    }

    fn pack(&mut self, os: &mut DataOStream) -> Result<(), StreamError> {
        let start = self.entries.len() - self.pending;
        os.write_value(&self.entries[start..].to_vec())?;
        self.pending = 0;
        Ok(())
    }

    fn unpack(&mut self, is: &mut DataIStream) -> Result<(), StreamError> {
        let added: Vec<u32> = is.read_value()?;
        self.entries.extend(added);
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.pending > 0
    }
}
