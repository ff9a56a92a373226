//! Reassembly of versioned messages for one object instance.
//!
//! The receiver thread pushes decoded chunks; application threads pop whole
//! messages. Chunks of one message arrive contiguously per origin node since
//! the sender holds the connection's send gate for the whole message, so
//! assembly is keyed by origin alone.

use crate::protocol::{DataKind, ObjectData, ProtocolViolation};
use crate::types::{NodeId, Version};
use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{trace, warn};

/// A complete message ready to be applied.
#[derive(Debug, Clone)]
pub(crate) struct ReadyVersion {
    pub kind: DataKind,
    pub version: Version,
    pub origin: NodeId,
    /// Addressed to this instance rather than to every instance on the node
    pub direct: bool,
    pub buckets: Vec<Bytes>,
}

impl ReadyVersion {
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }
}

struct Assembly {
    kind: DataKind,
    version: Version,
    direct: bool,
    next_sequence: u32,
    buckets: Vec<Bytes>,
}

#[derive(Default)]
struct InboxState {
    assembling: AHashMap<NodeId, Assembly>,
    ready: VecDeque<ReadyVersion>,
}

#[derive(Default)]
pub(crate) struct VersionInbox {
    state: Mutex<InboxState>,
    arrived: Condvar,
}

impl VersionInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one chunk whose payload was already decoded.
    pub fn push(
        &self,
        origin: NodeId,
        direct: bool,
        data: &ObjectData,
        payload: Bytes,
    ) -> Result<(), ProtocolViolation> {
        let mut state = self.state.lock();

        if data.sequence == 0 {
            if let Some(stale) = state.assembling.remove(&origin) {
                warn!(
                    "abandoned incomplete message v{} from {} after {} chunks",
                    stale.version, origin, stale.next_sequence
                );
            }
            state.assembling.insert(
                origin,
                Assembly {
                    kind: data.kind,
                    version: data.version,
                    direct,
                    next_sequence: 0,
                    buckets: Vec::new(),
                },
            );
        }

        let assembly = state
            .assembling
            .get_mut(&origin)
            .ok_or(ProtocolViolation::UnexpectedSequence {
                expected: 0,
                got: data.sequence,
            })?;
        if assembly.next_sequence != data.sequence {
            let expected = assembly.next_sequence;
            state.assembling.remove(&origin);
            return Err(ProtocolViolation::UnexpectedSequence {
                expected,
                got: data.sequence,
            });
        }
        if assembly.version != data.version {
            let expected = assembly.version;
            state.assembling.remove(&origin);
            return Err(ProtocolViolation::VersionMismatch {
                expected,
                got: data.version,
            });
        }
        if assembly.kind != data.kind {
            let expected = assembly.kind;
            state.assembling.remove(&origin);
            return Err(ProtocolViolation::UnexpectedPacket(format!(
                "{:?} chunk inside {:?} message",
                data.kind, expected
            )));
        }

        assembly.buckets.push(payload);
        assembly.next_sequence += 1;

        if data.last {
            if let Some(done) = state.assembling.remove(&origin) {
                trace!(
                    "{:?} v{} from {} complete in {} chunks",
                    done.kind,
                    done.version,
                    origin,
                    done.buckets.len()
                );
                state.ready.push_back(ReadyVersion {
                    kind: done.kind,
                    version: done.version,
                    origin,
                    direct: done.direct,
                    buckets: done.buckets,
                });
                drop(state);
                self.arrived.notify_all();
            }
        }
        Ok(())
    }

    /// Next complete message, waiting until `deadline`. `None` on timeout.
    pub fn pop(&self, deadline: Option<Instant>) -> Option<ReadyVersion> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some(item);
            }
            match deadline {
                Some(deadline) => {
                    if self.arrived.wait_until(&mut state, deadline).timed_out() {
                        return state.ready.pop_front();
                    }
                }
                None => self.arrived.wait(&mut state),
            }
        }
    }

    pub fn try_pop(&self) -> Option<ReadyVersion> {
        self.state.lock().ready.pop_front()
    }

    /// Highest version among complete master messages.
    pub fn newest_version(&self) -> Option<Version> {
        self.state
            .lock()
            .ready
            .iter()
            .filter(|r| r.kind != DataKind::SlaveDelta)
            .map(|r| r.version)
            .max()
    }

    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.assembling.clear();
        state.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::WireChunk;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn chunk(kind: DataKind, version: u128, sequence: u32, last: bool) -> ObjectData {
        ObjectData {
            kind,
            version: Version(version),
            sequence,
            last,
            chunk: WireChunk::raw(b""),
        }
    }

    #[test]
    fn test_assembles_in_order() {
        let inbox = VersionInbox::new();
        let origin = NodeId::generate();
        inbox
            .push(origin, false, &chunk(DataKind::Instance, 3, 0, false), Bytes::from_static(b"ab"))
            .unwrap();
        assert!(inbox.try_pop().is_none());
        inbox
            .push(origin, false, &chunk(DataKind::Instance, 3, 1, true), Bytes::from_static(b"c"))
            .unwrap();

        let ready = inbox.try_pop().unwrap();
        assert_eq!(ready.version, Version(3));
        assert_eq!(ready.buckets.len(), 2);
        assert!(!ready.direct);
    }

    #[test]
    fn test_sequence_gap_is_violation() {
        let inbox = VersionInbox::new();
        let origin = NodeId::generate();
        inbox
            .push(origin, true, &chunk(DataKind::Delta, 2, 0, false), Bytes::new())
            .unwrap();
        let err = inbox
            .push(origin, true, &chunk(DataKind::Delta, 2, 2, true), Bytes::new())
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolViolation::UnexpectedSequence {
                expected: 1,
                got: 2
            }
        );
    }

    #[test]
    fn test_continuation_without_start_is_violation() {
        let inbox = VersionInbox::new();
        let err = inbox
            .push(NodeId::generate(), false, &chunk(DataKind::Delta, 2, 1, true), Bytes::new())
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::UnexpectedSequence { expected: 0, .. }));
    }

    #[test]
    fn test_version_change_mid_message_is_violation() {
        let inbox = VersionInbox::new();
        let origin = NodeId::generate();
        inbox
            .push(origin, false, &chunk(DataKind::Instance, 4, 0, false), Bytes::new())
            .unwrap();
        let err = inbox
            .push(origin, false, &chunk(DataKind::Instance, 5, 1, true), Bytes::new())
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::VersionMismatch { .. }));
    }

    #[test]
    fn test_kind_change_mid_message_is_violation() {
        let inbox = VersionInbox::new();
        let origin = NodeId::generate();
        inbox
            .push(origin, false, &chunk(DataKind::Instance, 4, 0, false), Bytes::new())
            .unwrap();
        let err = inbox
            .push(origin, false, &chunk(DataKind::Delta, 4, 1, true), Bytes::new())
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::UnexpectedPacket(_)));

        // The broken message is abandoned; the next one starts clean.
        inbox
            .push(origin, false, &chunk(DataKind::Delta, 4, 0, true), Bytes::new())
            .unwrap();
        assert_eq!(inbox.try_pop().map(|r| r.kind), Some(DataKind::Delta));
    }

    #[test]
    fn test_origins_assemble_independently() {
        let inbox = VersionInbox::new();
        let a = NodeId::generate();
        let b = NodeId::generate();
        inbox
            .push(a, false, &chunk(DataKind::Instance, 1, 0, false), Bytes::new())
            .unwrap();
        inbox
            .push(b, false, &chunk(DataKind::SlaveDelta, 1, 0, true), Bytes::new())
            .unwrap();
        inbox
            .push(a, false, &chunk(DataKind::Instance, 1, 1, true), Bytes::new())
            .unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.newest_version(), Some(Version(1)));
        assert_eq!(inbox.try_pop().unwrap().origin, b);
    }

    #[test]
    fn test_pop_waits_for_message() {
        let inbox = Arc::new(VersionInbox::new());
        let pusher = {
            let inbox = inbox.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                inbox
                    .push(NodeId::generate(), false, &chunk(DataKind::Delta, 9, 0, true), Bytes::new())
                    .unwrap();
            })
        };
        let ready = inbox.pop(Some(Instant::now() + Duration::from_secs(5)));
        assert_eq!(ready.unwrap().version, Version(9));
        pusher.join().unwrap();

        assert!(inbox
            .pop(Some(Instant::now() + Duration::from_millis(5)))
            .is_none());
    }
}
