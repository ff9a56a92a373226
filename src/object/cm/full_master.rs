//! Master keeping complete snapshots of recent versions.
//!
//! Every published commit serializes the whole object into a saving stream
//! that is broadcast to subscribed slaves and kept for late subscribers.
//! `auto_obsolete` bounds the history by commit count: a snapshot is dropped
//! once more than `auto_obsolete` commits were recorded after it, but the
//! head snapshot is always kept.

use super::{apply_slave_deltas, resolve_start, CmContext, ObjectCm, SlaveSet};
use crate::object::link::VersionStream;
use crate::object::ObjectError;
use crate::protocol::DataKind;
use crate::types::{InstanceId, NodeId, Version, INSTANCE_ALL};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

struct InstanceData {
    commit_count: u32,
    data: VersionStream,
}

pub(crate) struct FullMasterCm {
    version: Version,
    commit_count: u32,
    auto_obsolete: u32,
    history: VecDeque<InstanceData>,
    slaves: SlaveSet,
}

impl FullMasterCm {
    pub fn new(auto_obsolete: u32) -> Self {
        FullMasterCm {
            version: Version::NONE,
            commit_count: 0,
            auto_obsolete,
            history: VecDeque::new(),
            slaves: SlaveSet::default(),
        }
    }

    fn obsolete(&mut self) {
        while self.history.len() > 1 && self.commit_count > self.auto_obsolete {
            let keep_from = self.commit_count - self.auto_obsolete;
            match self.history.front() {
                Some(front) if front.commit_count < keep_from => {
                    trace!(
                        "obsolete v{} (commit {} of {})",
                        front.data.version,
                        front.commit_count,
                        self.commit_count
                    );
                    self.history.pop_front();
                }
                _ => break,
            }
        }

        #[cfg(debug_assertions)]
        self.verify_invariants();
    }

    /// TigerStyle: Verify all invariants hold
    ///
    /// # Invariants
    /// - History holds consecutive versions ending at the head version
    /// - Every snapshot but the oldest lies within the retention window
    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        if self.version == Version::NONE {
            debug_assert!(self.history.is_empty(), "history without a version");
            return;
        }

        let mut expected = self.version;
        for (index, data) in self.history.iter().enumerate().rev() {
            debug_assert_eq!(
                data.data.version, expected,
                "Invariant violated: history is not consecutive"
            );
            if index > 0 {
                debug_assert!(
                    data.commit_count + self.auto_obsolete >= self.commit_count,
                    "Invariant violated: v{} outlived its retention window",
                    data.data.version
                );
            }
            expected = Version(expected.0.saturating_sub(1));
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn verify_invariants(&self) {}

    fn snapshot(&mut self, ctx: &CmContext<'_>, version: Version) -> Result<Option<VersionStream>, ObjectError> {
        let mut data = ctx.link.stream(DataKind::Instance, version, INSTANCE_ALL, true);
        let targets = ctx.link.connections(&self.slaves.nodes());
        data.stream.enable(&targets);
        if let Err(e) = ctx.serializer.write_instance(&mut data.stream) {
            data.stream.reset();
            return Err(e.into());
        }
        data.stream.disable();
        Ok(data.stream.has_sent_data().then_some(data))
    }
}

impl ObjectCm for FullMasterCm {
    fn is_master(&self) -> bool {
        true
    }

    fn version(&self) -> Version {
        self.version
    }

    fn oldest_version(&self) -> Version {
        self.history
            .front()
            .map(|d| d.data.version)
            .unwrap_or(Version::NONE)
    }

    fn set_auto_obsolete(&mut self, count: u32) {
        self.auto_obsolete = count;
        self.obsolete();
    }

    fn slave_count(&self) -> usize {
        self.slaves.instance_count()
    }

    fn init(&mut self, ctx: &CmContext<'_>) -> Result<(), ObjectError> {
        debug_assert_eq!(self.commit_count, 0, "init on a used change manager");
        let mut data = ctx
            .link
            .stream(DataKind::Instance, Version::FIRST, INSTANCE_ALL, true);
        data.stream.enable(&[]);
        let result = ctx.serializer.write_instance(&mut data.stream);
        data.stream.disable();
        result?;

        self.version = Version::FIRST;
        self.commit_count = 1;
        self.history.push_back(InstanceData {
            commit_count: 1,
            data,
        });
        self.verify_invariants();
        Ok(())
    }

    fn commit(&mut self, ctx: &CmContext<'_>, publish: bool) -> Result<Version, ObjectError> {
        debug_assert_ne!(self.version, Version::NONE, "commit before init");
        self.commit_count += 1;

        if publish {
            let next = self.version.next();
            match self.snapshot(ctx, next) {
                Ok(Some(data)) => {
                    self.version = next;
                    self.history.push_back(InstanceData {
                        commit_count: self.commit_count,
                        data,
                    });
                    debug!(
                        "object {} committed v{} to {} slave nodes",
                        ctx.link.object_id,
                        next,
                        self.slaves.nodes().len()
                    );
                }
                Ok(None) => trace!("object {} commit without data", ctx.link.object_id),
                Err(e) => {
                    self.obsolete();
                    return Err(e);
                }
            }
        }

        self.obsolete();
        Ok(self.version)
    }

    fn add_slave(
        &mut self,
        ctx: &CmContext<'_>,
        node: NodeId,
        instance_id: InstanceId,
        requested: Version,
    ) -> Result<Version, ObjectError> {
        debug_assert_ne!(self.version, Version::NONE, "add_slave before init");
        let connections = ctx.link.connections(&[node]);

        if requested == Version::NONE {
            // No data wanted: an empty instance marks the head version.
            let mut empty = ctx.link.stream(DataKind::Instance, self.version, instance_id, true);
            empty.stream.resend(&connections);
            self.slaves.add(node);
            return Ok(self.version);
        }

        let start = resolve_start(requested, self.oldest_version(), self.version)?;
        for data in self.history.iter_mut().filter(|d| d.data.version >= start) {
            data.data.resend_to(&connections, instance_id);
        }
        self.slaves.add(node);
        debug!(
            "object {} subscribed {}:{} from v{} (head v{})",
            ctx.link.object_id, node, instance_id, start, self.version
        );
        Ok(start)
    }

    fn remove_slave(&mut self, node: NodeId) -> bool {
        self.slaves.remove(node)
    }

    fn remove_node(&mut self, node: NodeId) {
        self.slaves.remove_all(node);
    }

    fn sync(
        &mut self,
        ctx: &CmContext<'_>,
        _target: Version,
        _timeout: Option<Duration>,
    ) -> Result<Version, ObjectError> {
        apply_slave_deltas(ctx)?;
        Ok(self.version)
    }
}
