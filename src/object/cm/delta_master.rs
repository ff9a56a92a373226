//! Master broadcasting deltas.
//!
//! A commit packs only the fields the object reports as changed and
//! broadcasts that delta. For late subscribers each retained version also
//! keeps a full snapshot, so a slave starting at version `v` receives the
//! snapshot of `v` followed by the deltas `v+1..=head`.

use super::{apply_slave_deltas, resolve_start, CmContext, ObjectCm, SlaveSet};
use crate::object::link::VersionStream;
use crate::object::ObjectError;
use crate::protocol::DataKind;
use crate::types::{InstanceId, NodeId, Version, INSTANCE_ALL};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

struct DeltaData {
    commit_count: u32,
    instance: VersionStream,
    /// Changes from the previous version; `None` for the first version
    delta: Option<VersionStream>,
}

pub(crate) struct DeltaMasterCm {
    version: Version,
    commit_count: u32,
    auto_obsolete: u32,
    history: VecDeque<DeltaData>,
    slaves: SlaveSet,
}

impl DeltaMasterCm {
    pub fn new(auto_obsolete: u32) -> Self {
        DeltaMasterCm {
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
                    self.history.pop_front();
                }
                _ => break,
            }
        }
        // The oldest version is served from its snapshot alone.
        if let Some(front) = self.history.front_mut() {
            front.delta = None;
        }
    }

    fn instance_snapshot(
        &self,
        ctx: &CmContext<'_>,
        version: Version,
    ) -> Result<VersionStream, ObjectError> {
        let mut data = ctx.link.stream(DataKind::Instance, version, INSTANCE_ALL, true);
        data.stream.enable(&[]);
        let result = ctx.serializer.write_instance(&mut data.stream);
        data.stream.disable();
        result?;
        Ok(data)
    }
}

impl ObjectCm for DeltaMasterCm {
    fn is_master(&self) -> bool {
        true
    }

    fn version(&self) -> Version {
        self.version
    }

    fn oldest_version(&self) -> Version {
        self.history
            .front()
            .map(|d| d.instance.version)
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
        let instance = self.instance_snapshot(ctx, Version::FIRST)?;
        self.version = Version::FIRST;
        self.commit_count = 1;
        self.history.push_back(DeltaData {
            commit_count: 1,
            instance,
            delta: None,
        });
        Ok(())
    }

    fn commit(&mut self, ctx: &CmContext<'_>, publish: bool) -> Result<Version, ObjectError> {
        self.commit_count += 1;

        if publish {
            let next = self.version.next();
            let mut delta = ctx.link.stream(DataKind::Delta, next, INSTANCE_ALL, true);
            let targets = ctx.link.connections(&self.slaves.nodes());
            delta.stream.enable(&targets);
            if let Err(e) = ctx.serializer.write_delta(&mut delta.stream) {
                delta.stream.reset();
                self.obsolete();
                return Err(e.into());
            }
            delta.stream.disable();

            if delta.stream.has_sent_data() {
                let instance = self.instance_snapshot(ctx, next)?;
                self.version = next;
                self.history.push_back(DeltaData {
                    commit_count: self.commit_count,
                    instance,
                    delta: Some(delta),
                });
                debug!(
                    "object {} committed delta v{} to {} slave nodes",
                    ctx.link.object_id,
                    next,
                    targets.len()
                );
            } else {
                trace!("object {} commit without changes", ctx.link.object_id);
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
        let connections = ctx.link.connections(&[node]);

        if requested == Version::NONE {
            let mut empty = ctx.link.stream(DataKind::Instance, self.version, instance_id, true);
            empty.stream.resend(&connections);
            self.slaves.add(node);
            return Ok(self.version);
        }

        let start = resolve_start(requested, self.oldest_version(), self.version)?;
        let mut entries = self
            .history
            .iter_mut()
            .skip_while(|d| d.instance.version < start);
        if let Some(first) = entries.next() {
            first.instance.resend_to(&connections, instance_id);
        }
        for entry in entries {
            if let Some(delta) = entry.delta.as_mut() {
                delta.resend_to(&connections, instance_id);
            }
        }
        self.slaves.add(node);
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
