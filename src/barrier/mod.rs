//! Barrier
//!
//! A distributed object whose master releases `height` entrants per version.
//!
//! ```text
//!   entrant node                          master node
//!   ────────────                          ───────────
//!   enter() ── BarrierEnter{v, inc} ────► EntryBook::enter
//!      │                                      │ height reached
//!      │ wait passed > inc                    ▼
//!      ◄──────────── BarrierEnterReply ◄── release all entrants
//! ```
//!
//! `passed` counts released rounds and doubles as the incarnation sent with
//! each entry. A timed-out entrant keeps its seat at the master; entering
//! again retries the same round, and a late release still counts.
//!
//! The master's own entrant is released directly. Other local instances of
//! the same barrier on the master node are not entrants.

mod entry_book;
mod error;

pub use error::BarrierError;

use crate::monitor::Monitor;
use crate::object::{
    ChangeType, Distributable, Distributed, Object, ObjectCore, ObjectError, ObjectExtension,
};
use crate::protocol::{Packet, PacketBody, ProtocolViolation};
use crate::stream::{DataIStream, DataOStream, StreamError};
use crate::types::{NodeId, Version, INSTANCE_ALL};
use entry_book::{Admission, Entrant, EntryBook};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct BarrierShared {
    height: AtomicU32,
    passed: Monitor<u32>,
    /// Master only
    book: Mutex<EntryBook>,
}

impl BarrierShared {
    /// Release this instance if the reply matches its current round.
    fn release(&self, current: Version, version: Version, incarnation: u32) -> bool {
        if version != current {
            debug!(
                "barrier reply for v{} ignored at v{}",
                version, current
            );
            return false;
        }
        self.passed.update(|passed| {
            if *passed == incarnation {
                *passed = incarnation.wrapping_add(1);
                true
            } else {
                false
            }
        })
    }

    fn handle_enter(
        &self,
        core: &ObjectCore,
        entrant: Entrant,
    ) -> Result<(), ObjectError> {
        if !core.is_master() {
            return Err(ObjectError::NotMaster);
        }
        let link = core.link()?;
        let current = core.version();
        let height = self.height.load(Ordering::Acquire);
        let now = Instant::now();

        let admission = {
            let mut book = self.book.lock();
            book.expire(now, link.node.config().barrier_timeout);
            book.enter(entrant, current, height, now)?
        };

        let local = link.local_node_id();
        let notify = |node: NodeId, version: Version, incarnation: u32| {
            if node == local {
                self.release(current, version, incarnation);
                return;
            }
            let reply = PacketBody::BarrierEnterReply {
                version,
                incarnation,
            };
            if let Err(e) = link.send(node, INSTANCE_ALL, reply) {
                warn!("barrier release of {} failed: {}", node, e);
            }
        };

        match admission {
            Admission::Wait => {}
            Admission::ReplyNow => {
                debug!(
                    "barrier {} releases {} behind at round {} v{}",
                    link.object_id, entrant.node, entrant.incarnation, entrant.version
                );
                notify(entrant.node, entrant.version, entrant.incarnation);
            }
            Admission::Release { version, nodes } => {
                debug!(
                    "barrier {} v{} reached height {}",
                    link.object_id, version, height
                );
                for (node, incarnation) in nodes {
                    notify(node, version, incarnation);
                }
            }
        }
        Ok(())
    }
}

impl ObjectExtension for BarrierShared {
    fn handle(&self, core: &ObjectCore, packet: &Packet, origin: NodeId) -> Result<(), ObjectError> {
        match packet.body {
            PacketBody::BarrierEnter {
                version,
                incarnation,
                timeout_ms,
            } => {
                let entrant = Entrant {
                    node: origin,
                    version,
                    incarnation,
                    timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms as u64)),
                };
                self.handle_enter(core, entrant)
            }
            PacketBody::BarrierEnterReply {
                version,
                incarnation,
            } => {
                self.release(core.version(), version, incarnation);
                Ok(())
            }
            _ => Err(ProtocolViolation::UnexpectedPacket(format!(
                "{:?} for barrier",
                packet.command()
            ))
            .into()),
        }
    }
}

/// Replicated barrier state. Only the height is distributed.
pub struct BarrierData {
    shared: Arc<BarrierShared>,
    dirty: bool,
}

impl Distributable for BarrierData {
    fn change_type(&self) -> ChangeType {
        ChangeType::Delta
    }

    fn get_instance_data(&self, os: &mut DataOStream) -> Result<(), StreamError> {
        os.write_u32(self.shared.height.load(Ordering::Acquire))
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<(), StreamError> {
        let height = is.read_u32()?;
        self.shared.height.store(height, Ordering::Release);
        Ok(())
    }

    fn pack(&mut self, os: &mut DataOStream) -> Result<(), StreamError> {
        self.dirty = false;
        self.get_instance_data(os)
    }

    fn unpack(&mut self, is: &mut DataIStream) -> Result<(), StreamError> {
        self.apply_instance_data(is)
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Rendezvous of `height` participants per barrier version.
///
/// Register it on one node and map it everywhere else; every participant
/// then calls [`Barrier::enter`] once per round.
#[derive(Clone)]
pub struct Barrier {
    object: Object<BarrierData>,
    shared: Arc<BarrierShared>,
}

impl Distributed for Barrier {
    fn core(&self) -> &Arc<ObjectCore> {
        self.object.core()
    }
}

impl Barrier {
    pub fn new(height: u32) -> Result<Self, BarrierError> {
        if height == 0 {
            return Err(BarrierError::InvalidHeight);
        }
        let shared = Arc::new(BarrierShared {
            height: AtomicU32::new(height),
            passed: Monitor::new(0),
            book: Mutex::new(EntryBook::new()),
        });
        let object = Object::new(BarrierData {
            shared: shared.clone(),
            dirty: false,
        });
        object.core().set_extension(shared.clone());
        Ok(Barrier { object, shared })
    }

    pub fn height(&self) -> u32 {
        self.shared.height.load(Ordering::Acquire)
    }

    /// Change the height. Takes effect for entrants once committed.
    pub fn set_height(&self, height: u32) -> Result<(), BarrierError> {
        if height == 0 {
            return Err(BarrierError::InvalidHeight);
        }
        if self.object.is_attached() && !self.object.is_master() {
            return Err(ObjectError::NotMaster.into());
        }
        let mut data = self.object.lock();
        self.shared.height.store(height, Ordering::Release);
        data.dirty = true;
        Ok(())
    }

    pub fn version(&self) -> Version {
        self.object.version()
    }

    /// Rounds this instance was released from.
    pub fn rounds(&self) -> u32 {
        self.shared.passed.get()
    }

    pub fn commit(&self, timeout: Option<Duration>) -> Result<Version, ObjectError> {
        self.object.commit(timeout)
    }

    pub fn sync(&self, target: Version, timeout: Option<Duration>) -> Result<Version, ObjectError> {
        self.object.sync(target, timeout)
    }

    /// Block until `height` participants entered this version. `None` waits
    /// forever. After a timeout the next call retries the same round.
    pub fn enter(&self, timeout: Option<Duration>) -> Result<(), BarrierError> {
        let height = self.height();
        if height == 1 {
            return Ok(());
        }

        let core = self.object.core();
        let link = core.link()?;
        let version = core.version();
        let round = self.shared.passed.get();
        let timeout_ms = timeout.map_or(0, |t| t.as_millis().clamp(1, u32::MAX as u128) as u32);

        debug!(
            "enter barrier {} v{} round {} (height {})",
            link.object_id, version, round, height
        );
        link.send(
            core.master_node(),
            core.master_instance_id(),
            PacketBody::BarrierEnter {
                version,
                incarnation: round,
                timeout_ms,
            },
        )?;

        if self
            .shared
            .passed
            .wait_ge(&round.wrapping_add(1), timeout)
            .is_some()
        {
            debug!("left barrier {} v{}", link.object_id, version);
            return Ok(());
        }
        warn!(
            "barrier {} v{} timed out in round {}",
            link.object_id, version, round
        );
        Err(BarrierError::Timeout { version, height })
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("height", &self.height())
            .field("version", &self.version())
            .field("rounds", &self.rounds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_height_validation() {
        assert!(matches!(Barrier::new(0), Err(BarrierError::InvalidHeight)));
        let barrier = Barrier::new(3).unwrap();
        assert_eq!(barrier.height(), 3);
        assert!(matches!(barrier.set_height(0), Err(BarrierError::InvalidHeight)));
        barrier.set_height(5).unwrap();
        assert_eq!(barrier.height(), 5);
        assert!(barrier.object.lock().is_dirty());
    }

    #[test]
    fn test_single_participant_never_blocks() {
        let barrier = Barrier::new(1).unwrap();
        barrier.enter(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(barrier.rounds(), 0);
    }

    #[test]
    fn test_detached_barrier_cannot_enter() {
        let barrier = Barrier::new(2).unwrap();
        assert!(matches!(
            barrier.enter(None),
            Err(BarrierError::Object(ObjectError::NotAttached))
        ));
    }

    #[test]
    fn test_release_matches_round_and_version() {
        let barrier = Barrier::new(2).unwrap();
        let shared = &barrier.shared;
        assert!(!shared.release(Version(1), Version(2), 0));
        assert!(!shared.release(Version(1), Version(1), 1));
        assert!(shared.release(Version(1), Version(1), 0));
        assert_eq!(barrier.rounds(), 1);
        // The same reply again belongs to a finished round.
        assert!(!shared.release(Version(1), Version(1), 0));
    }
}
