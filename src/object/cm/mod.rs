//! Change managers
//!
//! Every attached object owns exactly one change manager, which decides how
//! versions are produced, retained and replicated:
//!
//! ```text
//!                      ┌─► StaticMaster / StaticSlave    (never changes)
//!   Null ──attach──────┼─► FullMaster ─┐                 (snapshots)
//!     ▲                ├─► DeltaMaster ├─► VersionedSlave (deltas + snapshots)
//!     │                └─► Unbuffered ─┘                 (head only)
//!     └──── master detach
//! ```
//!
//! The set of strategies is closed, so [`ChangeManager`] is an enum; the
//! shared [`ObjectCm`] trait keeps each strategy in its own module.

mod delta_master;
mod full_master;
mod null;
mod static_cm;
mod unbuffered_master;
mod versioned_slave;

pub(crate) use delta_master::DeltaMasterCm;
pub(crate) use full_master::FullMasterCm;
pub(crate) use null::NullCm;
pub(crate) use static_cm::{StaticMasterCm, StaticSlaveCm};
pub(crate) use unbuffered_master::UnbufferedMasterCm;
pub(crate) use versioned_slave::VersionedSlaveCm;

use super::inbox::{ReadyVersion, VersionInbox};
use super::link::ObjectLink;
use super::{ChangeType, ObjectError, Serializer};
use crate::protocol::DataKind;
use crate::stream::DataIStream;
use crate::types::{InstanceId, NodeId, Version};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// What a change manager may touch while running an operation.
pub(crate) struct CmContext<'a> {
    pub serializer: &'a dyn Serializer,
    pub inbox: &'a VersionInbox,
    pub link: &'a ObjectLink,
}

pub(crate) trait ObjectCm: Send {
    fn is_master(&self) -> bool;

    /// Current (head) version of this instance.
    fn version(&self) -> Version;

    /// Oldest version a new slave can start from.
    fn oldest_version(&self) -> Version {
        self.version()
    }

    fn set_auto_obsolete(&mut self, _count: u32) {}

    fn slave_count(&self) -> usize {
        0
    }

    /// Produce the first version after the master attaches.
    fn init(&mut self, _ctx: &CmContext<'_>) -> Result<(), ObjectError> {
        Ok(())
    }

    /// Record one commit. `publish` is false for commits of clean objects,
    /// which only advance the obsoletion count.
    fn commit(&mut self, ctx: &CmContext<'_>, publish: bool) -> Result<Version, ObjectError>;

    /// Subscribe `node`'s `instance_id` and send it the data it needs.
    /// Returns the version the slave starts from.
    fn add_slave(
        &mut self,
        _ctx: &CmContext<'_>,
        _node: NodeId,
        _instance_id: InstanceId,
        _requested: Version,
    ) -> Result<Version, ObjectError> {
        Err(ObjectError::NotMaster)
    }

    /// Drop one subscription of `node`. Returns false if it had none.
    fn remove_slave(&mut self, _node: NodeId) -> bool {
        false
    }

    /// Drop every subscription of `node`.
    fn remove_node(&mut self, _node: NodeId) {}

    /// Bring the instance to `target` and return the version reached.
    fn sync(
        &mut self,
        ctx: &CmContext<'_>,
        target: Version,
        timeout: Option<Duration>,
    ) -> Result<Version, ObjectError>;

    /// Apply the initial data of a freshly mapped slave.
    fn apply_map_data(
        &mut self,
        _ctx: &CmContext<'_>,
        _start: Version,
        _timeout: Option<Duration>,
    ) -> Result<Version, ObjectError> {
        Err(ObjectError::NotAttached)
    }
}

pub(crate) enum ChangeManager {
    Null(NullCm),
    StaticMaster(StaticMasterCm),
    StaticSlave(StaticSlaveCm),
    FullMaster(FullMasterCm),
    DeltaMaster(DeltaMasterCm),
    UnbufferedMaster(UnbufferedMasterCm),
    VersionedSlave(VersionedSlaveCm),
}

impl Default for ChangeManager {
    fn default() -> Self {
        ChangeManager::Null(NullCm)
    }
}

impl ChangeManager {
    pub fn master(change_type: ChangeType, auto_obsolete: u32) -> Self {
        match change_type {
            ChangeType::Static => ChangeManager::StaticMaster(StaticMasterCm::new()),
            ChangeType::Instance => {
                ChangeManager::FullMaster(FullMasterCm::new(auto_obsolete))
            }
            ChangeType::Delta => ChangeManager::DeltaMaster(DeltaMasterCm::new(auto_obsolete)),
            ChangeType::Unbuffered => {
                ChangeManager::UnbufferedMaster(UnbufferedMasterCm::new())
            }
        }
    }

    pub fn slave(change_type: ChangeType, master_node: NodeId, master_instance_id: InstanceId) -> Self {
        match change_type {
            ChangeType::Static => ChangeManager::StaticSlave(StaticSlaveCm::new()),
            _ => ChangeManager::VersionedSlave(VersionedSlaveCm::new(
                master_node,
                master_instance_id,
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChangeManager::Null(_) => "null",
            ChangeManager::StaticMaster(_) => "static-master",
            ChangeManager::StaticSlave(_) => "static-slave",
            ChangeManager::FullMaster(_) => "full-master",
            ChangeManager::DeltaMaster(_) => "delta-master",
            ChangeManager::UnbufferedMaster(_) => "unbuffered-master",
            ChangeManager::VersionedSlave(_) => "versioned-slave",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ChangeManager::Null(_))
    }

    pub fn as_cm(&self) -> &dyn ObjectCm {
        match self {
            ChangeManager::Null(cm) => cm,
            ChangeManager::StaticMaster(cm) => cm,
            ChangeManager::StaticSlave(cm) => cm,
            ChangeManager::FullMaster(cm) => cm,
            ChangeManager::DeltaMaster(cm) => cm,
            ChangeManager::UnbufferedMaster(cm) => cm,
            ChangeManager::VersionedSlave(cm) => cm,
        }
    }

    pub fn as_cm_mut(&mut self) -> &mut dyn ObjectCm {
        match self {
            ChangeManager::Null(cm) => cm,
            ChangeManager::StaticMaster(cm) => cm,
            ChangeManager::StaticSlave(cm) => cm,
            ChangeManager::FullMaster(cm) => cm,
            ChangeManager::DeltaMaster(cm) => cm,
            ChangeManager::UnbufferedMaster(cm) => cm,
            ChangeManager::VersionedSlave(cm) => cm,
        }
    }
}

/// Subscribed slave nodes with the number of instances each has mapped.
#[derive(Debug, Default)]
pub(crate) struct SlaveSet {
    counts: BTreeMap<NodeId, u32>,
}

impl SlaveSet {
    pub fn add(&mut self, node: NodeId) {
        *self.counts.entry(node).or_insert(0) += 1;
    }

    pub fn remove(&mut self, node: NodeId) -> bool {
        match self.counts.get_mut(&node) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.counts.remove(&node);
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&mut self, node: NodeId) {
        self.counts.remove(&node);
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.counts.keys().copied().collect()
    }

    pub fn instance_count(&self) -> usize {
        self.counts.values().map(|c| *c as usize).sum()
    }
}

/// Resolve a requested start version against a retained range.
pub(crate) fn resolve_start(
    requested: Version,
    oldest: Version,
    head: Version,
) -> Result<Version, ObjectError> {
    let start = match requested {
        Version::OLDEST => oldest,
        Version::HEAD => head,
        v => v,
    };
    if start < oldest || start > head {
        return Err(ObjectError::VersionUnavailable {
            requested,
            oldest,
            head,
        });
    }
    Ok(start)
}

/// Feed one received message to the application object.
pub(crate) fn apply_message(ctx: &CmContext<'_>, item: ReadyVersion) -> Result<(), ObjectError> {
    if item.is_empty() {
        return Ok(());
    }
    let mut is = DataIStream::from_buckets(item.buckets);
    match item.kind {
        DataKind::Instance => ctx.serializer.read_instance(&mut is)?,
        DataKind::Delta | DataKind::SlaveDelta => ctx.serializer.read_delta(&mut is)?,
    }
    Ok(())
}

/// Apply slave commits queued at a master.
pub(crate) fn apply_slave_deltas(ctx: &CmContext<'_>) -> Result<usize, ObjectError> {
    let mut applied = 0;
    while let Some(item) = ctx.inbox.try_pop() {
        if item.kind != DataKind::SlaveDelta {
            warn!(
                "master {} dropped {:?} v{} from {}",
                ctx.link.object_id, item.kind, item.version, item.origin
            );
            continue;
        }
        debug!(
            "master {} applies slave commit from {}",
            ctx.link.object_id, item.origin
        );
        apply_message(ctx, item)?;
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_start() {
        let oldest = Version(2);
        let head = Version(4);
        assert_eq!(resolve_start(Version::OLDEST, oldest, head).unwrap(), Version(2));
        assert_eq!(resolve_start(Version::HEAD, oldest, head).unwrap(), Version(4));
        assert_eq!(resolve_start(Version(3), oldest, head).unwrap(), Version(3));
        assert!(matches!(
            resolve_start(Version(1), oldest, head),
            Err(ObjectError::VersionUnavailable {
                requested: Version(1),
                ..
            })
        ));
        assert!(resolve_start(Version(5), oldest, head).is_err());
    }

    #[test]
    fn test_slave_set_counts_instances() {
        let mut slaves = SlaveSet::default();
        let a = NodeId::generate();
        let b = NodeId::generate();
        slaves.add(a);
        slaves.add(a);
        slaves.add(b);
        assert_eq!(slaves.nodes().len(), 2);
        assert_eq!(slaves.instance_count(), 3);

        assert!(slaves.remove(a));
        assert_eq!(slaves.nodes().len(), 2);
        assert!(slaves.remove(a));
        assert_eq!(slaves.nodes(), vec![b]);
        assert!(!slaves.remove(a));

        slaves.remove_all(b);
        assert!(slaves.nodes().is_empty());
    }
}
