//! Master-side barrier bookkeeping: who entered which version.
//!
//! ```text
//!   enter(v, node)
//!      │
//!      ├─ v < current ──► timed: reply at once    untimed: violation
//!      │
//!      ├─ seat node under v (reset on a newer incarnation)
//!      │
//!      ├─ |seats| > height ──► violation, seat dropped
//!      │
//!      ├─ v > current ──► wait (early entry)
//!      │
//!      └─ |seats| == height ──► release every seat, forget v
//! ```
//!
//! An early entry is only noted. It completes when another entry for the
//! same version arrives after the barrier reached it, which holds as long as
//! every contributor to one version also contributes to the next. Early
//! entries that already fill the height wait for no one and stay blocked.

use crate::protocol::ProtocolViolation;
use crate::types::{NodeId, Version};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// One `BarrierEnter` as seen by the master.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entrant {
    pub node: NodeId,
    pub version: Version,
    /// Rounds the entrant has passed
    pub incarnation: u32,
    pub timeout: Option<Duration>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Entrant waits for more nodes
    Wait,
    /// Entrant is behind a round that was released without it
    ReplyNow,
    /// Height reached: release these `(node, incarnation)` pairs
    Release {
        version: Version,
        nodes: Vec<(NodeId, u32)>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Seat {
    node: NodeId,
    incarnation: u32,
    /// The entrant gave a timeout and may enter again for the same round
    timed: bool,
}

#[derive(Debug)]
struct Entry {
    incarnation: u32,
    timeout: Option<Duration>,
    time: Instant,
    seats: Vec<Seat>,
}

#[derive(Debug, Default)]
pub(crate) struct EntryBook {
    entries: BTreeMap<Version, Entry>,
}

impl EntryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(
        &mut self,
        entrant: Entrant,
        current: Version,
        height: u32,
        now: Instant,
    ) -> Result<Admission, ProtocolViolation> {
        let Entrant {
            node,
            version,
            incarnation,
            timeout,
        } = entrant;

        if version < current {
            if timeout.is_some() {
                return Ok(Admission::ReplyNow);
            }
            return Err(ProtocolViolation::StaleBarrierEntry { version, current });
        }

        let entry = self.entries.entry(version).or_insert_with(|| Entry {
            incarnation,
            timeout,
            time: now,
            seats: Vec::new(),
        });
        entry.time = now;

        if entry.seats.is_empty() {
            entry.incarnation = incarnation;
            entry.timeout = timeout;
        } else if entry.timeout.is_some() {
            if incarnation < entry.incarnation {
                return Ok(Admission::ReplyNow);
            }
            if incarnation > entry.incarnation {
                debug!(
                    "barrier v{} restarts at incarnation {} ({} stale seats dropped)",
                    version,
                    incarnation,
                    entry.seats.len()
                );
                entry.seats.clear();
                entry.incarnation = incarnation;
                entry.timeout = timeout;
            }
        }

        match entry.seats.iter_mut().find(|s| s.node == node) {
            Some(seat) if seat.timed && seat.incarnation == incarnation => {
                // Retry after a local timeout: the seat is still held.
                seat.timed = timeout.is_some();
                return Ok(Admission::Wait);
            }
            Some(_) => return Err(ProtocolViolation::DuplicateBarrierEntry { node, version }),
            None => entry.seats.push(Seat {
                node,
                incarnation,
                timed: timeout.is_some(),
            }),
        }

        if entry.seats.len() > height as usize {
            let entrants = entry.seats.len();
            entry.seats.pop();
            return Err(ProtocolViolation::BarrierHeightExceeded {
                version,
                entrants,
                height,
            });
        }

        if version > current || entry.seats.len() < height as usize {
            self.verify_invariants();
            return Ok(Admission::Wait);
        }

        let mut nodes: Vec<(NodeId, u32)> = self
            .entries
            .remove(&version)
            .map(|e| e.seats.iter().map(|s| (s.node, s.incarnation)).collect())
            .unwrap_or_default();
        nodes.sort_unstable_by_key(|(n, _)| *n);
        self.verify_invariants();
        Ok(Admission::Release { version, nodes })
    }

    /// Drop timed entries nobody touched within their timeout, which is at
    /// least `default_timeout`. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant, default_timeout: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|version, entry| {
            let Some(timeout) = entry.timeout else {
                return true;
            };
            let alive = now <= entry.time + timeout.max(default_timeout);
            if !alive {
                debug!(
                    "barrier v{} expired with {} entrants",
                    version,
                    entry.seats.len()
                );
            }
            alive
        });
        before - self.entries.len()
    }

    /// Entrants recorded for `version`.
    pub fn waiting(&self, version: Version) -> usize {
        self.entries.get(&version).map_or(0, |e| e.seats.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        for (version, entry) in &self.entries {
            debug_assert!(!entry.seats.is_empty(), "empty barrier entry for v{}", version);
            for (i, seat) in entry.seats.iter().enumerate() {
                debug_assert!(
                    !entry.seats[i + 1..].iter().any(|s| s.node == seat.node),
                    "node {} seated twice for v{}",
                    seat.node,
                    version
                );
            }
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn verify_invariants(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: Version = Version(1);
    const V2: Version = Version(2);

    fn entrant(node: NodeId, version: Version) -> Entrant {
        Entrant {
            node,
            version,
            incarnation: 0,
            timeout: None,
        }
    }

    fn timed(node: NodeId, version: Version, incarnation: u32) -> Entrant {
        Entrant {
            node,
            version,
            incarnation,
            timeout: Some(Duration::from_millis(100)),
        }
    }

    #[test]
    fn test_release_at_height() {
        let mut book = EntryBook::new();
        let now = Instant::now();
        let nodes: Vec<NodeId> = (0..3).map(|_| NodeId::generate()).collect();

        assert_eq!(book.enter(entrant(nodes[0], V1), V1, 3, now), Ok(Admission::Wait));
        assert_eq!(book.enter(entrant(nodes[1], V1), V1, 3, now), Ok(Admission::Wait));
        assert_eq!(book.waiting(V1), 2);

        let Ok(Admission::Release {
            version,
            nodes: released,
        }) = book.enter(entrant(nodes[2], V1), V1, 3, now)
        else {
            panic!("expected release");
        };
        assert_eq!(version, V1);
        let mut expected = nodes.clone();
        expected.sort();
        assert_eq!(
            released.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            expected
        );
        assert_eq!(book.len(), 0);
    }

    #[test]
    fn test_duplicate_untimed_entry_is_violation() {
        let mut book = EntryBook::new();
        let node = NodeId::generate();
        let now = Instant::now();
        book.enter(entrant(node, V1), V1, 2, now).unwrap();
        assert_eq!(
            book.enter(entrant(node, V1), V1, 2, now),
            Err(ProtocolViolation::DuplicateBarrierEntry { node, version: V1 })
        );
    }

    #[test]
    fn test_timed_retry_keeps_seat() {
        let mut book = EntryBook::new();
        let (a, b) = (NodeId::generate(), NodeId::generate());
        let now = Instant::now();

        assert_eq!(book.enter(timed(a, V1, 0), V1, 2, now), Ok(Admission::Wait));
        assert_eq!(book.enter(timed(a, V1, 0), V1, 2, now), Ok(Admission::Wait));
        assert_eq!(book.waiting(V1), 1);

        let admission = book.enter(timed(b, V1, 0), V1, 2, now).unwrap();
        assert!(matches!(admission, Admission::Release { ref nodes, .. } if nodes.len() == 2));
    }

    #[test]
    fn test_stale_entries() {
        let mut book = EntryBook::new();
        let node = NodeId::generate();
        let now = Instant::now();
        assert_eq!(
            book.enter(entrant(node, V1), V2, 2, now),
            Err(ProtocolViolation::StaleBarrierEntry {
                version: V1,
                current: V2
            })
        );
        assert_eq!(book.enter(timed(node, V1, 0), V2, 2, now), Ok(Admission::ReplyNow));
        assert_eq!(book.len(), 0);
    }

    #[test]
    fn test_incarnation_mismatch() {
        let mut book = EntryBook::new();
        let (a, b) = (NodeId::generate(), NodeId::generate());
        let now = Instant::now();

        assert_eq!(book.enter(timed(a, V1, 0), V1, 2, now), Ok(Admission::Wait));
        // b already passed a round a missed: a's seat is dropped
        assert_eq!(book.enter(timed(b, V1, 1), V1, 2, now), Ok(Admission::Wait));
        assert_eq!(book.waiting(V1), 1);
        // a retrying its old round is released on its own
        assert_eq!(book.enter(timed(a, V1, 0), V1, 2, now), Ok(Admission::ReplyNow));

        let admission = book.enter(timed(a, V1, 1), V1, 2, now).unwrap();
        assert!(matches!(admission, Admission::Release { ref nodes, .. } if nodes.len() == 2));
    }

    #[test]
    fn test_expire_drops_only_timed_entries() {
        let mut book = EntryBook::new();
        let start = Instant::now();
        book.enter(timed(NodeId::generate(), V1, 0), V1, 2, start).unwrap();
        book.enter(entrant(NodeId::generate(), V2), V1, 2, start).unwrap();

        assert_eq!(book.expire(start, Duration::from_millis(10)), 0);
        let later = start + Duration::from_secs(1);
        assert_eq!(book.expire(later, Duration::from_millis(10)), 1);
        assert_eq!(book.waiting(V1), 0);
        assert_eq!(book.waiting(V2), 1);
    }

    /// Early entries only complete when a later entry for the same version
    /// arrives once the barrier is there.
    #[test]
    fn test_early_entry_needs_a_later_contributor() {
        let mut book = EntryBook::new();
        let (a, b, c) = (NodeId::generate(), NodeId::generate(), NodeId::generate());
        let now = Instant::now();

        assert_eq!(book.enter(entrant(a, V2), V1, 3, now), Ok(Admission::Wait));
        assert_eq!(book.enter(entrant(b, V2), V1, 3, now), Ok(Admission::Wait));
        assert_eq!(book.waiting(V2), 2);

        let admission = book.enter(entrant(c, V2), V2, 3, now).unwrap();
        assert!(matches!(admission, Admission::Release { ref nodes, .. } if nodes.len() == 3));
    }

    /// Early entries that fill the height are never released, and a further
    /// node is one entrant too many.
    #[test]
    fn test_entries_beyond_height_are_violation() {
        let mut book = EntryBook::new();
        let (a, b, c) = (NodeId::generate(), NodeId::generate(), NodeId::generate());
        let now = Instant::now();

        assert_eq!(book.enter(entrant(a, V2), V1, 2, now), Ok(Admission::Wait));
        assert_eq!(book.enter(entrant(b, V2), V1, 2, now), Ok(Admission::Wait));
        assert_eq!(
            book.enter(entrant(c, V2), V2, 2, now),
            Err(ProtocolViolation::BarrierHeightExceeded {
                version: V2,
                entrants: 3,
                height: 2
            })
        );
        assert_eq!(book.waiting(V2), 2);
    }
}
