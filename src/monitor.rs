//! Blocking primitives
//!
//! [`Monitor`] is a value guarded by a condition variable; threads wait for
//! it to reach a given state. [`RequestHandler`] hands out numbered request
//! slots that a reply packet later fills, waking the thread that issued the
//! request. Every wait takes an explicit timeout; `None` waits forever.

use crate::types::{InstanceId, NodeId, ObjectId, RequestId, Version, REQUEST_INVALID};
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A value plus a condition variable.
#[derive(Debug, Default)]
pub struct Monitor<T> {
    value: Mutex<T>,
    changed: Condvar,
}

impl<T: Clone> Monitor<T> {
    pub fn new(value: T) -> Self {
        Monitor {
            value: Mutex::new(value),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value.lock().clone()
    }

    pub fn set(&self, value: T) {
        *self.value.lock() = value;
        self.changed.notify_all();
    }

    /// Update in place and wake all waiters.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.value.lock());
        self.changed.notify_all();
        result
    }

    /// Wait until `predicate` holds. Returns the value seen, or `None` on timeout.
    pub fn wait_for(
        &self,
        mut predicate: impl FnMut(&T) -> bool,
        timeout: Option<Duration>,
    ) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut value = self.value.lock();
        while !predicate(&value) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut value, deadline).timed_out()
                        && !predicate(&value)
                    {
                        return None;
                    }
                }
                None => self.changed.wait(&mut value),
            }
        }
        Some(value.clone())
    }
}

impl<T: Clone + PartialEq> Monitor<T> {
    pub fn wait_eq(&self, target: &T, timeout: Option<Duration>) -> bool {
        self.wait_for(|v| v == target, timeout).is_some()
    }
}

impl<T: Clone + PartialOrd> Monitor<T> {
    /// Wait until the value is at least `target`.
    pub fn wait_ge(&self, target: &T, timeout: Option<Duration>) -> Option<T> {
        self.wait_for(|v| v >= target, timeout)
    }
}

impl Monitor<u64> {
    pub fn increment(&self) -> u64 {
        self.update(|v| {
            *v += 1;
            *v
        })
    }
}

/// Payload delivered to a waiting requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    None,
    Bool(bool),
    Node(NodeId),
    Id(ObjectId),
    Version(Version),
    Subscribe {
        ok: bool,
        version: Version,
        master_instance_id: InstanceId,
        oldest: Version,
        head: Version,
    },
    /// The serving side could not complete the request
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No reply within the timeout; the request stays registered
    Timeout(RequestId),
    /// The request id was never registered or already consumed
    Unknown(RequestId),
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Timeout(id) => write!(f, "Request {} timed out", id),
            RequestError::Unknown(id) => write!(f, "Unknown request {}", id),
        }
    }
}

impl std::error::Error for RequestError {}

struct Pending {
    reply: Option<Reply>,
}

struct HandlerState {
    next_id: RequestId,
    pending: AHashMap<RequestId, Pending>,
}

/// Numbered request slots filled by reply handlers.
pub struct RequestHandler {
    state: Mutex<HandlerState>,
    served: Condvar,
}

impl Default for RequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHandler {
    pub fn new() -> Self {
        RequestHandler {
            state: Mutex::new(HandlerState {
                next_id: 1,
                pending: AHashMap::new(),
            }),
            served: Condvar::new(),
        }
    }

    /// Allocate a request slot.
    pub fn register(&self) -> RequestId {
        let mut state = self.state.lock();
        let mut id = state.next_id;
        while id == REQUEST_INVALID || state.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        state.next_id = id.wrapping_add(1);
        state.pending.insert(id, Pending { reply: None });
        id
    }

    /// Fill a slot. Returns false for unknown or already served requests.
    pub fn serve(&self, id: RequestId, reply: Reply) -> bool {
        let mut state = self.state.lock();
        match state.pending.get_mut(&id) {
            Some(pending) if pending.reply.is_none() => {
                pending.reply = Some(reply);
                drop(state);
                self.served.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Block until the request is served, then free the slot.
    pub fn wait(&self, id: RequestId, timeout: Option<Duration>) -> Result<Reply, RequestError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            match state.pending.get(&id) {
                None => return Err(RequestError::Unknown(id)),
                Some(Pending { reply: Some(_) }) => {
                    let pending = state.pending.remove(&id);
                    return pending
                        .and_then(|p| p.reply)
                        .ok_or(RequestError::Unknown(id));
                }
                Some(Pending { reply: None }) => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.served.wait_until(&mut state, deadline).timed_out() {
                        let served = matches!(state.pending.get(&id), Some(Pending { reply: Some(_) }));
                        if !served {
                            return Err(RequestError::Timeout(id));
                        }
                    }
                }
                None => self.served.wait(&mut state),
            }
        }
    }

    /// Served but not yet collected.
    pub fn is_served(&self, id: RequestId) -> bool {
        matches!(
            self.state.lock().pending.get(&id),
            Some(Pending { reply: Some(_) })
        )
    }

    /// Drop a slot without waiting.
    pub fn unregister(&self, id: RequestId) {
        self.state.lock().pending.remove(&id);
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_monitor_wait_ge_across_threads() {
        let monitor = Arc::new(Monitor::new(0u64));
        let waiter = {
            let monitor = monitor.clone();
            thread::spawn(move || monitor.wait_ge(&3, Some(Duration::from_secs(5))))
        };
        for _ in 0..3 {
            monitor.increment();
        }
        assert_eq!(waiter.join().unwrap(), Some(3));
    }

    #[test]
    fn test_monitor_timeout() {
        let monitor = Monitor::new(false);
        assert!(!monitor.wait_eq(&true, Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_request_served_before_wait() {
        let handler = RequestHandler::new();
        let id = handler.register();
        assert!(handler.serve(id, Reply::Bool(true)));
        assert!(!handler.serve(id, Reply::Bool(false)), "served twice");
        assert_eq!(handler.wait(id, None), Ok(Reply::Bool(true)));
        assert_eq!(handler.pending_count(), 0);
        assert_eq!(handler.wait(id, None), Err(RequestError::Unknown(id)));
    }

    #[test]
    fn test_request_served_from_other_thread() {
        let handler = Arc::new(RequestHandler::new());
        let id = handler.register();
        let server = {
            let handler = handler.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                handler.serve(id, Reply::Version(Version(9)))
            })
        };
        assert_eq!(
            handler.wait(id, Some(Duration::from_secs(5))),
            Ok(Reply::Version(Version(9)))
        );
        assert!(server.join().unwrap());
    }

    #[test]
    fn test_request_timeout_keeps_slot() {
        let handler = RequestHandler::new();
        let id = handler.register();
        assert_eq!(
            handler.wait(id, Some(Duration::from_millis(10))),
            Err(RequestError::Timeout(id))
        );
        handler.serve(id, Reply::None);
        assert_eq!(handler.wait(id, Some(Duration::ZERO)), Ok(Reply::None));
    }

    #[test]
    fn test_ids_are_unique() {
        let handler = RequestHandler::new();
        let a = handler.register();
        let b = handler.register();
        assert_ne!(a, b);
        assert_ne!(a, REQUEST_INVALID);
    }
}
