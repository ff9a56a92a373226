//! Slave following a versioned master.
//!
//! Messages queue in the instance inbox in arrival order. `sync` applies
//! them one version at a time; a message at or below the current version is
//! a duplicate (a broadcast overlapping the map data) and is dropped, while
//! a gap means the stream from the master is corrupt.

use super::{apply_message, CmContext, ObjectCm};
use crate::object::inbox::ReadyVersion;
use crate::object::ObjectError;
use crate::protocol::{DataKind, ProtocolViolation};
use crate::types::{InstanceId, NodeId, Version};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub(crate) struct VersionedSlaveCm {
    version: Version,
    master_node: NodeId,
    master_instance_id: InstanceId,
}

impl VersionedSlaveCm {
    pub fn new(master_node: NodeId, master_instance_id: InstanceId) -> Self {
        VersionedSlaveCm {
            version: Version::NONE,
            master_node,
            master_instance_id,
        }
    }

    fn apply(&mut self, ctx: &CmContext<'_>, item: ReadyVersion) -> Result<(), ObjectError> {
        if item.kind == DataKind::SlaveDelta {
            return Err(ProtocolViolation::UnexpectedPacket(
                "slave commit delivered to a slave".to_string(),
            )
            .into());
        }
        if item.version <= self.version {
            trace!(
                "slave {} drops duplicate v{} (at v{})",
                ctx.link.object_id,
                item.version,
                self.version
            );
            return Ok(());
        }
        let expected = self.version.next();
        if item.version != expected {
            return Err(ProtocolViolation::VersionMismatch {
                expected,
                got: item.version,
            }
            .into());
        }

        let version = item.version;
        apply_message(ctx, item)?;
        self.version = version;
        Ok(())
    }
}

impl ObjectCm for VersionedSlaveCm {
    fn is_master(&self) -> bool {
        false
    }

    fn version(&self) -> Version {
        self.version
    }

    /// Send the object's packed changes to the master, which applies them on
    /// its next `sync`.
    fn commit(&mut self, ctx: &CmContext<'_>, publish: bool) -> Result<Version, ObjectError> {
        if !publish {
            return Ok(self.version);
        }
        let mut delta = ctx.link.stream(
            DataKind::SlaveDelta,
            self.version,
            self.master_instance_id,
            false,
        );
        delta
            .stream
            .enable(&ctx.link.connections(&[self.master_node]));
        if let Err(e) = ctx.serializer.write_delta(&mut delta.stream) {
            delta.stream.reset();
            return Err(e.into());
        }
        delta.stream.disable();
        debug!(
            "slave {} sent commit to {}:{}",
            ctx.link.object_id, self.master_node, self.master_instance_id
        );
        Ok(self.version)
    }

    fn sync(
        &mut self,
        ctx: &CmContext<'_>,
        target: Version,
        timeout: Option<Duration>,
    ) -> Result<Version, ObjectError> {
        let target = match target {
            Version::NEXT => self.version.next(),
            v if v.is_concrete() => v,
            _ => {
                // HEAD: whatever has fully arrived, without waiting.
                while let Some(item) = ctx.inbox.try_pop() {
                    self.apply(ctx, item)?;
                }
                return Ok(self.version);
            }
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        while self.version < target {
            let item = ctx.inbox.pop(deadline).ok_or(ObjectError::Timeout)?;
            self.apply(ctx, item)?;
        }
        Ok(self.version)
    }

    fn apply_map_data(
        &mut self,
        ctx: &CmContext<'_>,
        start: Version,
        timeout: Option<Duration>,
    ) -> Result<Version, ObjectError> {
        debug_assert_eq!(self.version, Version::NONE, "map data applied twice");
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let item = ctx.inbox.pop(deadline).ok_or(ObjectError::Timeout)?;
            if item.direct && item.kind == DataKind::Instance && item.version == start {
                apply_message(ctx, item)?;
                self.version = start;
                debug!("slave {} mapped at v{}", ctx.link.object_id, start);
                return Ok(start);
            }
            trace!(
                "slave {} skips {:?} v{} before its map data",
                ctx.link.object_id,
                item.kind,
                item.version
            );
        }
    }
}
