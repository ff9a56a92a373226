//! Master broadcasting deltas without history. Late subscribers start at
//! the head version from a freshly serialized instance.

use super::{apply_slave_deltas, resolve_start, CmContext, ObjectCm, SlaveSet};
use crate::object::ObjectError;
use crate::protocol::DataKind;
use crate::types::{InstanceId, NodeId, Version, INSTANCE_ALL};
use std::time::Duration;
use tracing::debug;

pub(crate) struct UnbufferedMasterCm {
    version: Version,
    slaves: SlaveSet,
}

impl UnbufferedMasterCm {
    pub fn new() -> Self {
        UnbufferedMasterCm {
            version: Version::NONE,
            slaves: SlaveSet::default(),
        }
    }
}

impl ObjectCm for UnbufferedMasterCm {
    fn is_master(&self) -> bool {
        true
    }

    fn version(&self) -> Version {
        self.version
    }

    fn slave_count(&self) -> usize {
        self.slaves.instance_count()
    }

    fn init(&mut self, _ctx: &CmContext<'_>) -> Result<(), ObjectError> {
        self.version = Version::FIRST;
        Ok(())
    }

    fn commit(&mut self, ctx: &CmContext<'_>, publish: bool) -> Result<Version, ObjectError> {
        if !publish {
            return Ok(self.version);
        }
        let next = self.version.next();
        let mut delta = ctx.link.stream(DataKind::Delta, next, INSTANCE_ALL, false);
        delta.stream.enable(&ctx.link.connections(&self.slaves.nodes()));
        if let Err(e) = ctx.serializer.write_delta(&mut delta.stream) {
            delta.stream.reset();
            return Err(e.into());
        }
        delta.stream.disable();
        if delta.stream.has_sent_data() {
            self.version = next;
            debug!("object {} broadcast v{}", ctx.link.object_id, next);
        }
        Ok(self.version)
    }

    fn add_slave(
        &mut self,
        ctx: &CmContext<'_>,
        node: NodeId,
        instance_id: InstanceId,
        requested: Version,
    ) -> Result<Version, ObjectError> {
        if requested != Version::NONE {
            resolve_start(requested, self.version, self.version)?;
        }

        let mut instance = ctx.link.stream(DataKind::Instance, self.version, instance_id, true);
        if requested != Version::NONE {
            instance.stream.enable(&[]);
            let result = ctx.serializer.write_instance(&mut instance.stream);
            instance.stream.disable();
            result?;
        }
        instance.stream.resend(&ctx.link.connections(&[node]));
        self.slaves.add(node);
        Ok(self.version)
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
