//! Sessions
//!
//! A session is an id namespace shared by the nodes that map it. The node
//! that created it is the session master and owns the id pool; every other
//! node caches sub-ranges and asks the master for more.
//!
//! Object lifecycle inside a session:
//!
//! ```text
//!   Unattached ──attach_object──► Attached ──install cm──► Mapped(master|slave)
//!       ▲                                                      │
//!       └───────────────────── detach_object ◄─────────────────┘
//! ```
//!
//! Attach and detach are executed by the receiver thread, which owns the
//! object registry; the calling thread waits for the request and then sets
//! up or tears down the change manager.

mod dispatch;
mod error;
mod id_pool;
pub(crate) mod registry;

pub use error::SessionError;

use crate::monitor::Reply;
use crate::node::NodeInner;
use crate::object::cm::ChangeManager;
use crate::object::{Distributed, ObjectCore, ObjectError};
use crate::protocol::{Packet, PacketBody};
use crate::types::{
    InstanceId, NodeId, ObjectId, RequestId, SessionId, Version, INSTANCE_ALL, INSTANCE_INVALID,
};
use ahash::AHashMap;
use id_pool::IdPool;
use parking_lot::{Mutex, RwLock};
use registry::ObjectRegistry;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Object waiting for the receiver thread to attach it.
pub(crate) struct PendingAttach {
    core: Arc<ObjectCore>,
    master_node: NodeId,
}

/// Which node holds the masters of an id range.
#[derive(Debug, Default)]
struct IdMasterMap {
    /// start -> (range, master)
    ranges: BTreeMap<u128, (u32, NodeId)>,
}

impl IdMasterMap {
    /// Whether `start..start + range` stays inside the id space.
    fn is_valid_range(start: ObjectId, range: u32) -> bool {
        start.0.checked_add(range as u128).is_some()
    }

    fn insert(&mut self, start: ObjectId, range: u32, master: NodeId) {
        self.ranges.insert(start.0, (range, master));
    }

    fn lookup(&self, id: ObjectId) -> Option<(ObjectId, u32, NodeId)> {
        let (&start, &(range, master)) = self.ranges.range(..=id.0).next_back()?;
        (id.0 - start < range as u128).then_some((ObjectId(start), range, master))
    }

    fn remove(&mut self, start: ObjectId) {
        self.ranges.remove(&start.0);
    }
}

pub struct SessionInner {
    id: SessionId,
    master_node: NodeId,
    node: Weak<NodeInner>,
    /// Ids owned by the session master
    pool: Mutex<IdPool>,
    /// Ids handed to this node but not yet used
    cache: Mutex<IdPool>,
    id_masters: RwLock<IdMasterMap>,
    pub(crate) registry: RwLock<ObjectRegistry>,
    pending: Mutex<AHashMap<RequestId, PendingAttach>>,
}

impl SessionInner {
    pub(crate) fn new(id: SessionId, master_node: NodeId, node: &Arc<NodeInner>) -> Arc<Self> {
        let pool = if master_node == node.node_id() {
            IdPool::with_capacity(node.config().id_pool_capacity)
        } else {
            IdPool::empty()
        };
        Arc::new(SessionInner {
            id,
            master_node,
            node: Arc::downgrade(node),
            pool: Mutex::new(pool),
            cache: Mutex::new(IdPool::empty()),
            id_masters: RwLock::new(IdMasterMap::default()),
            registry: RwLock::new(ObjectRegistry::new()),
            pending: Mutex::new(AHashMap::new()),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn node(&self) -> Result<Arc<NodeInner>, SessionError> {
        self.node.upgrade().ok_or(SessionError::Closed)
    }

    fn is_master(&self, node: &NodeInner) -> bool {
        self.master_node == node.node_id()
    }

    /// Detach everything; the node is shutting down.
    pub(crate) fn clear(&self) {
        let cores = self.registry.write().drain();
        for core in cores {
            core.detach();
            core.install_cm(ChangeManager::default());
            core.inbox.clear();
        }
        self.pending.lock().clear();
    }

    /// Forget subscriptions of a node that went away. Command thread only.
    pub(crate) fn notify_node_down(&self, node: NodeId) {
        let masters = self.registry.read().masters();
        for core in masters {
            let result = core.with_cm(|cm, _| {
                cm.remove_node(node);
                Ok(())
            });
            if let Err(e) = result {
                debug!("node down cleanup of {}: {}", core.id(), e);
            }
        }
    }
}

/// Handle returned by [`Session::map_object_nb`].
#[derive(Debug, Clone, Copy)]
pub struct MapRequest {
    request_id: RequestId,
    requested: Version,
}

/// Application handle to a session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("master_node", &self.inner.master_node)
            .finish()
    }
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Session { inner }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn master_node(&self) -> NodeId {
        self.inner.master_node
    }

    pub fn is_master(&self) -> Result<bool, SessionError> {
        let node = self.inner.node()?;
        Ok(self.inner.is_master(&node))
    }

    /// Number of locally attached object instances.
    pub fn object_count(&self) -> usize {
        self.inner.registry.read().len()
    }

    fn request(
        &self,
        node: &NodeInner,
        to: NodeId,
        packet: impl FnOnce(RequestId) -> Packet,
    ) -> Result<Reply, SessionError> {
        let requests = node.requests();
        let request_id = requests.register();
        if let Err(e) = node.send(to, &packet(request_id)) {
            requests.unregister(request_id);
            return Err(e.into());
        }
        self.wait(node, request_id, Some(node.config().request_timeout))
    }

    fn wait(
        &self,
        node: &NodeInner,
        request_id: RequestId,
        timeout: Option<Duration>,
    ) -> Result<Reply, SessionError> {
        let requests = node.requests();
        requests.wait(request_id, timeout).map_err(|e| {
            requests.unregister(request_id);
            SessionError::Request(e)
        })
    }

    // ------------------------------------------------------------------
    // Identifiers
    // ------------------------------------------------------------------

    /// Allocate `range` consecutive object ids.
    pub fn gen_ids(&self, range: u32) -> Result<ObjectId, SessionError> {
        let node = self.inner.node()?;
        if self.inner.is_master(&node) {
            return self
                .inner
                .pool
                .lock()
                .alloc(range)
                .ok_or(SessionError::IdsExhausted { requested: range });
        }

        if let Some(id) = self.inner.cache.lock().alloc(range) {
            return Ok(id);
        }

        let ask = range.max(node.config().min_id_range);
        let session_id = self.inner.id;
        let reply = self.request(&node, self.inner.master_node, |request_id| {
            Packet::session(session_id, PacketBody::GenIds {
                request_id,
                range: ask,
            })
        })?;
        match reply {
            Reply::Id(id) if id.is_valid() => {
                // Keep the surplus of the minimum range for later calls.
                if ask > range {
                    self.inner.cache.lock().release(id.offset(range), ask - range);
                }
                Ok(id)
            }
            Reply::Id(_) => Err(SessionError::IdsExhausted { requested: range }),
            other => Err(SessionError::BadReply(format!("{:?}", other))),
        }
    }

    /// Return ids to the pool they came from.
    pub fn free_ids(&self, start: ObjectId, range: u32) -> Result<(), SessionError> {
        let node = self.inner.node()?;
        if self.inner.is_master(&node) {
            self.inner.pool.lock().release(start, range);
        } else {
            self.inner.cache.lock().release(start, range);
        }
        Ok(())
    }

    /// Record `master` as the owner of `range` ids from `start` and tell the
    /// session master.
    pub fn set_id_master(
        &self,
        start: ObjectId,
        range: u32,
        master: NodeId,
    ) -> Result<(), SessionError> {
        if !IdMasterMap::is_valid_range(start, range) {
            return Err(SessionError::InvalidRange { start, range });
        }
        self.inner.id_masters.write().insert(start, range, master);
        let node = self.inner.node()?;
        if self.inner.is_master(&node) {
            return Ok(());
        }

        let session_id = self.inner.id;
        match self.request(&node, self.inner.master_node, |request_id| {
            Packet::session(session_id, PacketBody::SetIdMaster {
                request_id,
                start,
                range,
                master,
            })
        })? {
            Reply::None => Ok(()),
            other => Err(SessionError::BadReply(format!("{:?}", other))),
        }
    }

    /// Node holding the master instance of `id`.
    pub fn get_id_master(&self, id: ObjectId) -> Result<NodeId, SessionError> {
        if let Some((_, _, master)) = self.inner.id_masters.read().lookup(id) {
            return Ok(master);
        }
        let node = self.inner.node()?;
        if self.inner.is_master(&node) {
            return Err(SessionError::UnknownMaster(id));
        }

        let session_id = self.inner.id;
        match self.request(&node, self.inner.master_node, |request_id| {
            Packet::session(session_id, PacketBody::GetIdMaster { request_id, id })
        })? {
            Reply::Node(master) if !master.is_zero() => Ok(master),
            Reply::Node(_) => Err(SessionError::UnknownMaster(id)),
            other => Err(SessionError::BadReply(format!("{:?}", other))),
        }
    }

    fn unset_id_master(&self, start: ObjectId) {
        self.inner.id_masters.write().remove(start);
    }

    // ------------------------------------------------------------------
    // Attach / detach
    // ------------------------------------------------------------------

    fn attach_via_receiver(
        &self,
        core: &Arc<ObjectCore>,
        id: ObjectId,
        master_node: NodeId,
        body: impl FnOnce(RequestId) -> PacketBody,
    ) -> Result<InstanceId, SessionError> {
        if core.is_attached() {
            return Err(SessionError::AlreadyAttached);
        }
        let node = self.inner.node()?;
        let requests = node.requests();
        let request_id = requests.register();
        self.inner.pending.lock().insert(
            request_id,
            PendingAttach {
                core: core.clone(),
                master_node,
            },
        );

        let packet = Packet::object(self.inner.id, id, INSTANCE_INVALID, body(request_id));
        if let Err(e) = node.send_self(&packet) {
            self.inner.pending.lock().remove(&request_id);
            requests.unregister(request_id);
            return Err(e.into());
        }
        match self.wait(&node, request_id, Some(node.config().request_timeout))? {
            Reply::Bool(true) => Ok(core.instance_id()),
            other => Err(SessionError::BadReply(format!("{:?}", other))),
        }
    }

    /// Attach `object` under `id` as a local instance.
    pub fn attach_object(
        &self,
        object: &impl Distributed,
        id: ObjectId,
    ) -> Result<InstanceId, SessionError> {
        let node_id = self.inner.node()?.node_id();
        self.attach_via_receiver(object.core(), id, node_id, |request_id| {
            PacketBody::AttachObject { request_id }
        })
    }

    /// Detach `object`. Masters lose their change manager; slaves keep it.
    pub fn detach_object(&self, object: &impl Distributed) -> Result<(), SessionError> {
        let core = object.core();
        let link = core.link()?;
        let node = self.inner.node()?;
        let was_master = core.is_master();

        let packet = |request_id| {
            Packet::object(
                self.inner.id,
                link.object_id,
                link.instance_id,
                PacketBody::DetachObject { request_id },
            )
        };
        match self.request(&node, node.node_id(), packet)? {
            Reply::None => {}
            other => return Err(SessionError::BadReply(format!("{:?}", other))),
        }

        if was_master {
            core.install_cm(ChangeManager::default());
        }
        Ok(())
    }

    /// Detach on a failure path; the original error is what the caller sees.
    fn release_attachment(&self, object: &impl Distributed) {
        if let Err(e) = self.detach_object(object) {
            debug!("detach of {} during rollback failed: {}", object.core().id(), e);
        }
    }

    fn release_ids(&self, start: ObjectId, count: u32) {
        if let Err(e) = self.free_ids(start, count) {
            debug!("returning ids {}+{} failed: {}", start, count, e);
        }
    }

    /// Allocate an id, announce this node as its master and attach `object`
    /// as the master instance with its first version.
    pub fn register_object(&self, object: &impl Distributed) -> Result<ObjectId, SessionError> {
        let core = object.core();
        if core.is_attached() {
            return Err(SessionError::AlreadyAttached);
        }
        let node_id = self.inner.node()?.node_id();
        let id = self.gen_ids(1)?;

        let registered = self
            .set_id_master(id, 1, node_id)
            .and_then(|_| self.attach_object(object, id));
        if let Err(e) = registered {
            self.unset_id_master(id);
            self.release_ids(id, 1);
            return Err(e);
        }

        if let Err(e) = core.install_master_cm() {
            self.release_attachment(object);
            self.unset_id_master(id);
            self.release_ids(id, 1);
            return Err(e.into());
        }
        info!(
            "registered object {} ({:?}) in session {}",
            id,
            core.change_type(),
            self.inner.id
        );
        Ok(id)
    }

    pub fn deregister_object(&self, object: &impl Distributed) -> Result<(), SessionError> {
        let core = object.core();
        if !core.is_master() {
            return Err(ObjectError::NotMaster.into());
        }
        let id = core.id();
        self.detach_object(object)?;
        self.unset_id_master(id);
        self.free_ids(id, 1)?;
        debug!("deregistered object {}", id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Map / unmap
    // ------------------------------------------------------------------

    /// Attach `object` as a slave of `id` and subscribe to its master,
    /// starting at `version` (`Version::OLDEST`, `Version::HEAD`, a concrete
    /// version, or `Version::NONE` for no initial data).
    pub fn map_object_nb(
        &self,
        object: &impl Distributed,
        id: ObjectId,
        version: Version,
    ) -> Result<MapRequest, SessionError> {
        let core = object.core();
        let master = self.get_id_master(id)?;
        let node = self.inner.node()?;
        if !node.is_reachable(master) {
            return Err(SessionError::Unreachable(master));
        }

        self.attach_via_receiver(core, id, master, |request_id| PacketBody::MapObject {
            request_id,
            version,
            master,
        })?;

        let requests = node.requests();
        let request_id = requests.register();
        let packet = Packet::object(
            self.inner.id,
            id,
            INSTANCE_ALL,
            PacketBody::SubscribeObject {
                request_id,
                requested: version,
                slave_instance_id: core.instance_id(),
            },
        );
        if let Err(e) = node.send(master, &packet) {
            requests.unregister(request_id);
            self.release_attachment(object);
            return Err(e.into());
        }
        debug!("map object {} from {} at {}", id, master, version);
        Ok(MapRequest {
            request_id,
            requested: version,
        })
    }

    /// Finish a map: wait for the master, install the slave change manager
    /// and apply the initial data. Returns the version the slave starts at.
    pub fn map_object_sync(
        &self,
        object: &impl Distributed,
        request: MapRequest,
        timeout: Option<Duration>,
    ) -> Result<Version, SessionError> {
        let core = object.core();
        let node = self.inner.node()?;
        let reply = match self.wait(&node, request.request_id, timeout) {
            Ok(reply) => reply,
            Err(e) => {
                self.release_attachment(object);
                return Err(e);
            }
        };

        let Reply::Subscribe {
            ok,
            version,
            master_instance_id,
            oldest,
            head,
        } = reply
        else {
            self.release_attachment(object);
            return Err(SessionError::BadReply(format!("{:?}", reply)));
        };

        if !ok {
            warn!(
                "map of {} at {} refused (retained {}..={})",
                core.id(),
                request.requested,
                oldest,
                head
            );
            self.release_attachment(object);
            return Err(ObjectError::VersionUnavailable {
                requested: request.requested,
                oldest,
                head,
            }
            .into());
        }

        core.set_master_instance_id(master_instance_id);
        core.install_cm(ChangeManager::slave(
            core.change_type(),
            core.master_node(),
            master_instance_id,
        ));
        let start = match core.with_cm(|cm, ctx| cm.apply_map_data(ctx, version, timeout)) {
            Ok(start) => start,
            Err(e) => {
                warn!("initial data of {} failed: {}", core.id(), e);
                if let Err(unmap) = self.unmap_object(object) {
                    debug!("unsubscribe after failed map of {}: {}", core.id(), unmap);
                    self.release_attachment(object);
                }
                return Err(e.into());
            }
        };
        info!("mapped object {} at v{} (master head v{})", core.id(), start, head);
        Ok(start)
    }

    pub fn map_object(
        &self,
        object: &impl Distributed,
        id: ObjectId,
        version: Version,
    ) -> Result<Version, SessionError> {
        let request = self.map_object_nb(object, id, version)?;
        let timeout = self.inner.node()?.config().request_timeout;
        self.map_object_sync(object, request, Some(timeout))
    }

    /// Unsubscribe a slave from its master and detach it.
    pub fn unmap_object(&self, object: &impl Distributed) -> Result<(), SessionError> {
        let core = object.core();
        if core.is_master() {
            return Err(SessionError::NotSlave);
        }
        let link = core.link()?;
        let node = self.inner.node()?;
        let master = core.master_node();
        if !node.is_reachable(master) {
            warn!("master {} of {} gone, detaching locally", master, link.object_id);
            return self.detach_object(object);
        }

        let master_instance_id = core.master_instance_id();
        let packet = |request_id| {
            Packet::object(
                self.inner.id,
                link.object_id,
                master_instance_id,
                PacketBody::UnsubscribeObject {
                    request_id,
                    master_instance_id,
                    slave_instance_id: link.instance_id,
                },
            )
        };
        match self.request(&node, master, packet)? {
            Reply::None => {
                debug!("unmapped object {}", link.object_id);
                Ok(())
            }
            other => Err(SessionError::BadReply(format!("{:?}", other))),
        }
    }
}
