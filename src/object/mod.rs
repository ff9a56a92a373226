//! Distributed objects
//!
//! An [`Object<T>`] wraps application data implementing [`Distributable`].
//! The shared [`ObjectCore`] carries everything the node needs: the session
//! attachment, the change manager and the inbox of received versions.
//!
//! ```text
//!   app thread ──commit_nb──► ObjectCommit ──► command thread ──► cm.commit
//!   app thread ──sync───────► cm.sync ◄── inbox ◄── receiver thread
//! ```
//!
//! Lock order: `cm` before the application data; the receiver thread only
//! touches the inbox and the attachment, never the change manager.

pub(crate) mod cm;
mod error;
pub(crate) mod inbox;
pub(crate) mod link;

pub use error::ObjectError;

use crate::monitor::Reply;
use crate::protocol::{Packet, PacketBody};
use crate::session::registry::ObjectKey;
use crate::session::SessionInner;
use crate::stream::{DataIStream, DataOStream, StreamError};
use crate::types::{
    InstanceId, NodeId, ObjectId, RequestId, Version, INSTANCE_INVALID, REQUEST_INVALID,
};
use cm::{ChangeManager, CmContext, ObjectCm};
use inbox::VersionInbox;
use link::ObjectLink;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// How an object's versions are produced and replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Written once at registration, never committed
    Static,
    /// Every commit sends a full snapshot
    Instance,
    /// Commits send the packed changes; snapshots serve late subscribers
    Delta,
    /// Commits send the packed changes; nothing is retained
    Unbuffered,
}

/// Application data that can be replicated.
///
/// `get_instance_data`/`apply_instance_data` carry the complete state;
/// `pack`/`unpack` carry the changes since the last commit and default to
/// the complete state.
pub trait Distributable: Send + 'static {
    fn change_type(&self) -> ChangeType {
        ChangeType::Instance
    }

    fn get_instance_data(&self, os: &mut DataOStream) -> Result<(), StreamError>;

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<(), StreamError>;

    fn pack(&mut self, os: &mut DataOStream) -> Result<(), StreamError> {
        self.get_instance_data(os)
    }

    fn unpack(&mut self, is: &mut DataIStream) -> Result<(), StreamError> {
        self.apply_instance_data(is)
    }

    /// False when nothing changed since the last commit.
    fn is_dirty(&self) -> bool {
        true
    }
}

/// Type-erased access to the application data.
pub(crate) trait Serializer: Send + Sync {
    fn write_instance(&self, os: &mut DataOStream) -> Result<(), StreamError>;
    fn write_delta(&self, os: &mut DataOStream) -> Result<(), StreamError>;
    fn read_instance(&self, is: &mut DataIStream) -> Result<(), StreamError>;
    fn read_delta(&self, is: &mut DataIStream) -> Result<(), StreamError>;
    fn is_dirty(&self) -> bool;
}

impl<T: Distributable> Serializer for Mutex<T> {
    fn write_instance(&self, os: &mut DataOStream) -> Result<(), StreamError> {
        self.lock().get_instance_data(os)
    }

    fn write_delta(&self, os: &mut DataOStream) -> Result<(), StreamError> {
        self.lock().pack(os)
    }

    fn read_instance(&self, is: &mut DataIStream) -> Result<(), StreamError> {
        self.lock().apply_instance_data(is)
    }

    fn read_delta(&self, is: &mut DataIStream) -> Result<(), StreamError> {
        self.lock().unpack(is)
    }

    fn is_dirty(&self) -> bool {
        self.lock().is_dirty()
    }
}

/// Object-specific packet handling on the command thread.
pub(crate) trait ObjectExtension: Send + Sync {
    fn handle(&self, core: &ObjectCore, packet: &Packet, origin: NodeId)
        -> Result<(), ObjectError>;
}

struct Attachment {
    link: Option<ObjectLink>,
    session: Weak<SessionInner>,
    key: Option<ObjectKey>,
    /// Node holding the master instance (the local node for masters)
    master_node: NodeId,
    master_instance_id: InstanceId,
}

#[derive(Debug, Clone, Copy)]
struct Published {
    version: Version,
    oldest: Version,
    is_master: bool,
}

/// Node-side state of one object instance.
pub struct ObjectCore {
    serializer: Arc<dyn Serializer>,
    change_type: ChangeType,
    attachment: Mutex<Attachment>,
    cm: Mutex<ChangeManager>,
    pub(crate) inbox: VersionInbox,
    extension: OnceLock<Arc<dyn ObjectExtension>>,
    auto_obsolete: AtomicU32,
    published: Mutex<Published>,
}

impl ObjectCore {
    fn new(serializer: Arc<dyn Serializer>, change_type: ChangeType) -> Self {
        ObjectCore {
            serializer,
            change_type,
            attachment: Mutex::new(Attachment {
                link: None,
                session: Weak::new(),
                key: None,
                master_node: NodeId::ZERO,
                master_instance_id: INSTANCE_INVALID,
            }),
            cm: Mutex::new(ChangeManager::default()),
            inbox: VersionInbox::new(),
            extension: OnceLock::new(),
            auto_obsolete: AtomicU32::new(0),
            published: Mutex::new(Published {
                version: Version::NONE,
                oldest: Version::NONE,
                is_master: false,
            }),
        }
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    pub fn id(&self) -> ObjectId {
        self.attachment
            .lock()
            .link
            .as_ref()
            .map(|l| l.object_id)
            .unwrap_or(ObjectId::INVALID)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.attachment
            .lock()
            .link
            .as_ref()
            .map(|l| l.instance_id)
            .unwrap_or(INSTANCE_INVALID)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.lock().link.is_some()
    }

    /// True once a master change manager is installed.
    pub fn is_master(&self) -> bool {
        self.published.lock().is_master
    }

    pub fn version(&self) -> Version {
        self.published.lock().version
    }

    pub fn oldest_version(&self) -> Version {
        self.published.lock().oldest
    }

    /// Latest version known locally, including fully received but not yet
    /// applied versions on slaves.
    pub fn head_version(&self) -> Version {
        let version = self.version();
        if self.is_master() {
            return version;
        }
        self.inbox
            .newest_version()
            .map_or(version, |newest| newest.max(version))
    }

    pub fn master_node(&self) -> NodeId {
        self.attachment.lock().master_node
    }

    pub(crate) fn master_instance_id(&self) -> InstanceId {
        self.attachment.lock().master_instance_id
    }

    pub(crate) fn link(&self) -> Result<ObjectLink, ObjectError> {
        self.attachment
            .lock()
            .link
            .clone()
            .ok_or(ObjectError::NotAttached)
    }

    pub(crate) fn session(&self) -> Option<Arc<SessionInner>> {
        self.attachment.lock().session.upgrade()
    }

    pub(crate) fn key(&self) -> Option<ObjectKey> {
        self.attachment.lock().key
    }

    pub(crate) fn set_extension(&self, extension: Arc<dyn ObjectExtension>) {
        if self.extension.set(extension).is_err() {
            warn!("object extension installed twice");
        }
    }

    pub(crate) fn extension(&self) -> Option<&Arc<dyn ObjectExtension>> {
        self.extension.get()
    }

    /// Bind to a session. Receiver thread only.
    pub(crate) fn attach(
        &self,
        link: ObjectLink,
        session: Weak<SessionInner>,
        key: ObjectKey,
        master_node: NodeId,
        master_instance_id: InstanceId,
    ) {
        let mut attachment = self.attachment.lock();
        debug_assert!(attachment.link.is_none(), "object attached twice");
        debug!(
            "attach object {} instance {} (master {})",
            link.object_id, link.instance_id, master_node
        );
        attachment.link = Some(link);
        attachment.session = session;
        attachment.key = Some(key);
        attachment.master_node = master_node;
        attachment.master_instance_id = master_instance_id;
    }

    /// Unbind from the session. Receiver thread only.
    pub(crate) fn detach(&self) -> Option<ObjectLink> {
        let mut attachment = self.attachment.lock();
        attachment.key = None;
        attachment.session = Weak::new();
        let link = attachment.link.take();
        if let Some(link) = &link {
            debug!("detach object {} instance {}", link.object_id, link.instance_id);
        }
        link
    }

    pub(crate) fn set_master_instance_id(&self, instance_id: InstanceId) {
        self.attachment.lock().master_instance_id = instance_id;
    }

    /// Replace the change manager.
    pub(crate) fn install_cm(&self, cm: ChangeManager) {
        let mut current = self.cm.lock();
        debug!("object cm {} -> {}", current.name(), cm.name());
        *current = cm;
        self.publish(current.as_cm());
    }

    pub(crate) fn install_master_cm(&self) -> Result<(), ObjectError> {
        let auto_obsolete = self.auto_obsolete.load(Ordering::Acquire);
        self.install_cm(ChangeManager::master(self.change_type, auto_obsolete));
        self.with_cm(|cm, ctx| cm.init(ctx))
    }

    pub(crate) fn auto_obsolete(&self) -> u32 {
        self.auto_obsolete.load(Ordering::Acquire)
    }

    pub(crate) fn store_auto_obsolete(&self, count: u32) {
        self.auto_obsolete.store(count, Ordering::Release);
    }

    /// Run `f` on the change manager of the attached object.
    pub(crate) fn with_cm<R>(
        &self,
        f: impl FnOnce(&mut dyn ObjectCm, &CmContext<'_>) -> Result<R, ObjectError>,
    ) -> Result<R, ObjectError> {
        let link = self.link()?;
        let mut cm = self.cm.lock();
        let ctx = CmContext {
            serializer: self.serializer.as_ref(),
            inbox: &self.inbox,
            link: &link,
        };
        let result = f(cm.as_cm_mut(), &ctx);
        self.publish(cm.as_cm());
        result
    }

    pub(crate) fn slave_count(&self) -> usize {
        self.cm.lock().as_cm().slave_count()
    }

    fn publish(&self, cm: &dyn ObjectCm) {
        let mut published = self.published.lock();
        debug_assert!(
            cm.version() >= published.version || cm.version() == Version::NONE,
            "version went backwards: {} -> {}",
            published.version,
            cm.version()
        );
        *published = Published {
            version: cm.version(),
            oldest: cm.oldest_version(),
            is_master: cm.is_master(),
        };
    }

    /// Execute a queued commit. Command thread only.
    pub(crate) fn handle_commit(&self, request_id: RequestId) {
        let publish = request_id != REQUEST_INVALID;
        let result = self.with_cm(|cm, ctx| cm.commit(ctx, publish));
        if let Err(e) = &result {
            warn!("commit of object {} failed: {}", self.id(), e);
        }
        if publish {
            if let Ok(link) = self.link() {
                let reply = match result {
                    Ok(version) => Reply::Version(version),
                    Err(e) => Reply::Failed(e.to_string()),
                };
                link.node.requests().serve(request_id, reply);
            }
        }
    }

    /// Update the retention count. Command thread only.
    pub(crate) fn handle_obsolete(&self, count: u32) {
        self.store_auto_obsolete(count);
        if let Err(e) = self.with_cm(|cm, _| {
            cm.set_auto_obsolete(count);
            Ok(())
        }) {
            debug!("obsolete on object {}: {}", self.id(), e);
        }
    }
}

/// Token of a pending master commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRequest {
    request_id: RequestId,
}

impl CommitRequest {
    pub const INVALID: CommitRequest = CommitRequest {
        request_id: REQUEST_INVALID,
    };

    pub fn is_valid(&self) -> bool {
        self.request_id != REQUEST_INVALID
    }
}

/// Anything backed by an object core; accepted by the session lifecycle calls.
pub trait Distributed {
    fn core(&self) -> &Arc<ObjectCore>;
}

/// Handle to a distributed object. Clones share the same instance.
pub struct Object<T: Distributable> {
    data: Arc<Mutex<T>>,
    core: Arc<ObjectCore>,
}

impl<T: Distributable> Clone for Object<T> {
    fn clone(&self) -> Self {
        Object {
            data: self.data.clone(),
            core: self.core.clone(),
        }
    }
}

impl<T: Distributable> Distributed for Object<T> {
    fn core(&self) -> &Arc<ObjectCore> {
        &self.core
    }
}

impl<T: Distributable> Object<T> {
    pub fn new(value: T) -> Self {
        let change_type = value.change_type();
        let data = Arc::new(Mutex::new(value));
        let serializer: Arc<dyn Serializer> = data.clone();
        Object {
            data,
            core: Arc::new(ObjectCore::new(serializer, change_type)),
        }
    }

    /// Lock the application data. Do not hold the guard across `commit` or
    /// `sync`, which serialize the data on other threads.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.data.lock()
    }

    pub fn id(&self) -> ObjectId {
        self.core.id()
    }

    pub fn instance_id(&self) -> InstanceId {
        self.core.instance_id()
    }

    pub fn is_attached(&self) -> bool {
        self.core.is_attached()
    }

    pub fn is_master(&self) -> bool {
        self.core.is_master()
    }

    pub fn change_type(&self) -> ChangeType {
        self.core.change_type()
    }

    pub fn version(&self) -> Version {
        self.core.version()
    }

    pub fn head_version(&self) -> Version {
        self.core.head_version()
    }

    pub fn oldest_version(&self) -> Version {
        self.core.oldest_version()
    }

    /// Number of slave instances subscribed to this master.
    pub fn slave_count(&self) -> usize {
        self.core.slave_count()
    }

    /// Start a commit.
    ///
    /// On a master the new version is serialized by the command thread; wait
    /// for it with [`commit_sync`](Self::commit_sync). A clean master only
    /// counts the commit and returns [`CommitRequest::INVALID`]. A slave sends
    /// its packed changes to the master right away.
    pub fn commit_nb(&self) -> Result<CommitRequest, ObjectError> {
        let link = self.core.link()?;
        if self.core.change_type == ChangeType::Static {
            return Err(ObjectError::NotCommittable);
        }

        if !self.core.is_master() {
            let dirty = self.core.serializer.is_dirty();
            self.core.with_cm(|cm, ctx| cm.commit(ctx, dirty))?;
            return Ok(CommitRequest::INVALID);
        }

        if !self.core.serializer.is_dirty() {
            link.send_self(PacketBody::ObjectCommit {
                request_id: REQUEST_INVALID,
            })?;
            return Ok(CommitRequest::INVALID);
        }

        let requests = link.node.requests();
        let request_id = requests.register();
        if let Err(e) = link.send_self(PacketBody::ObjectCommit { request_id }) {
            requests.unregister(request_id);
            return Err(e.into());
        }
        Ok(CommitRequest { request_id })
    }

    /// Wait for a commit started by `commit_nb` and return the head version.
    pub fn commit_sync(
        &self,
        request: CommitRequest,
        timeout: Option<Duration>,
    ) -> Result<Version, ObjectError> {
        if !request.is_valid() {
            return Ok(self.version());
        }
        let link = self.core.link()?;
        let requests = link.node.requests();
        match requests.wait(request.request_id, timeout) {
            Ok(Reply::Version(version)) => Ok(version),
            Ok(Reply::Failed(msg)) => Err(ObjectError::Failed(msg)),
            Ok(other) => Err(ObjectError::Failed(format!("unexpected reply {:?}", other))),
            Err(e) => {
                requests.unregister(request.request_id);
                Err(e.into())
            }
        }
    }

    pub fn commit(&self, timeout: Option<Duration>) -> Result<Version, ObjectError> {
        let request = self.commit_nb()?;
        self.commit_sync(request, timeout)
    }

    /// Bring this instance to `target` (a concrete version, `Version::HEAD`
    /// or `Version::NEXT`). Masters apply queued slave commits instead.
    pub fn sync(&self, target: Version, timeout: Option<Duration>) -> Result<Version, ObjectError> {
        self.core.with_cm(|cm, ctx| cm.sync(ctx, target, timeout))
    }

    /// Number of commits after which a master version becomes obsolete.
    pub fn set_auto_obsolete(&self, count: u32) -> Result<(), ObjectError> {
        self.core.store_auto_obsolete(count);
        if !self.core.is_master() {
            return Ok(());
        }
        let link = self.core.link()?;
        link.send_self(PacketBody::ObjectObsolete { count })?;
        Ok(())
    }

    pub fn auto_obsolete(&self) -> u32 {
        self.core.auto_obsolete()
    }
}

impl<T: Distributable + std::fmt::Debug> std::fmt::Debug for Object<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id())
            .field("instance_id", &self.instance_id())
            .field("version", &self.version())
            .field("data", &*self.data.lock())
            .finish()
    }
}
