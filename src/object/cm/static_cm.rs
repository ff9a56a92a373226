//! Objects written once at registration and never changed.

use super::{apply_message, resolve_start, CmContext, ObjectCm, SlaveSet};
use crate::object::link::VersionStream;
use crate::object::ObjectError;
use crate::protocol::DataKind;
use crate::types::{InstanceId, NodeId, Version, INSTANCE_ALL};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub(crate) struct StaticMasterCm {
    instance: Option<VersionStream>,
    slaves: SlaveSet,
}

impl StaticMasterCm {
    pub fn new() -> Self {
        StaticMasterCm {
            instance: None,
            slaves: SlaveSet::default(),
        }
    }
}

impl ObjectCm for StaticMasterCm {
    fn is_master(&self) -> bool {
        true
    }

    fn version(&self) -> Version {
        if self.instance.is_some() {
            Version::FIRST
        } else {
            Version::NONE
        }
    }

    fn slave_count(&self) -> usize {
        self.slaves.instance_count()
    }

    fn init(&mut self, ctx: &CmContext<'_>) -> Result<(), ObjectError> {
        let mut data = ctx
            .link
            .stream(DataKind::Instance, Version::FIRST, INSTANCE_ALL, true);
        data.stream.enable(&[]);
        let result = ctx.serializer.write_instance(&mut data.stream);
        data.stream.disable();
        result?;
        debug!(
            "static object {} holds {} bytes",
            ctx.link.object_id,
            data.saved_len()
        );
        self.instance = Some(data);
        Ok(())
    }

    fn commit(&mut self, _ctx: &CmContext<'_>, _publish: bool) -> Result<Version, ObjectError> {
        Err(ObjectError::NotCommittable)
    }

    fn add_slave(
        &mut self,
        ctx: &CmContext<'_>,
        node: NodeId,
        instance_id: InstanceId,
        requested: Version,
    ) -> Result<Version, ObjectError> {
        let head = self.version();
        let requested_start = if requested == Version::NONE {
            Version::HEAD
        } else {
            requested
        };
        resolve_start(requested_start, head, head)?;
        let instance = self.instance.as_mut().ok_or(ObjectError::NotAttached)?;
        instance.resend_to(&ctx.link.connections(&[node]), instance_id);
        self.slaves.add(node);
        Ok(head)
    }

    fn remove_slave(&mut self, node: NodeId) -> bool {
        self.slaves.remove(node)
    }

    fn remove_node(&mut self, node: NodeId) {
        self.slaves.remove_all(node);
    }

    fn sync(
        &mut self,
        _ctx: &CmContext<'_>,
        _target: Version,
        _timeout: Option<Duration>,
    ) -> Result<Version, ObjectError> {
        Ok(self.version())
    }
}

/// Receives the single instance message once, at map time.
pub(crate) struct StaticSlaveCm {
    version: Version,
}

impl StaticSlaveCm {
    pub fn new() -> Self {
        StaticSlaveCm {
            version: Version::NONE,
        }
    }
}

impl ObjectCm for StaticSlaveCm {
    fn is_master(&self) -> bool {
        false
    }

    fn version(&self) -> Version {
        self.version
    }

    fn commit(&mut self, _ctx: &CmContext<'_>, _publish: bool) -> Result<Version, ObjectError> {
        Err(ObjectError::NotCommittable)
    }

    fn sync(
        &mut self,
        _ctx: &CmContext<'_>,
        _target: Version,
        _timeout: Option<Duration>,
    ) -> Result<Version, ObjectError> {
        Ok(self.version)
    }

    fn apply_map_data(
        &mut self,
        ctx: &CmContext<'_>,
        start: Version,
        timeout: Option<Duration>,
    ) -> Result<Version, ObjectError> {
        if self.version != Version::NONE {
            return Ok(self.version);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let item = ctx.inbox.pop(deadline).ok_or(ObjectError::Timeout)?;
            if item.direct && item.kind == DataKind::Instance && item.version == start {
                apply_message(ctx, item)?;
                self.version = start;
                return Ok(start);
            }
            trace!("static slave {} skips v{}", ctx.link.object_id, item.version);
        }
    }
}
