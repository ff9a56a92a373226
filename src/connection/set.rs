//! Connection multiplexer
//!
//! A [`ConnectionSet`] waits on every member connection plus one wake handle
//! and reports exactly one event per `select` call. Membership is changed
//! through a cloneable [`ConnectionSetHandle`] from any thread; each change
//! marks the poll table dirty and wakes a blocked `select`, which returns
//! [`SelectEvent::Interrupt`] and rebuilds the table on the next call.
//!
//! ```text
//!   fds[0]      wake handle   ──► Interrupt
//!   fds[1..n]   connections   ──► Connect | Data | Disconnect | Error
//! ```
//!
//! Ready connections are reported in table order; there is no fairness
//! guarantee between connections.

use super::waker::{SocketWaker, Waker};
use super::{Connection, ConnectionError, ConnectionHandle, ConnectionListener};
use parking_lot::Mutex;
use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Outcome of one `select` call.
#[derive(Debug)]
pub enum SelectEvent {
    /// A listening connection has a pending inbound connection
    Connect(ConnectionHandle),
    /// Bytes are available
    Data(ConnectionHandle),
    /// The peer hung up
    Disconnect(ConnectionHandle),
    /// The timeout elapsed
    Timeout,
    /// The set was woken by a membership change or `interrupt()`
    Interrupt,
    /// Error on a connection, or on the wait itself (`None`)
    Error(Option<ConnectionHandle>),
}

struct SetShared {
    connections: Mutex<Vec<ConnectionHandle>>,
    dirty: AtomicBool,
    waker: Box<dyn Waker>,
}

impl SetShared {
    fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.waker.wake();
    }
}

impl ConnectionListener for SetShared {
    fn notify_state_changed(&self, _connection: &Connection) {
        self.set_dirty();
    }
}

/// Thread-safe membership handle of a [`ConnectionSet`].
#[derive(Clone)]
pub struct ConnectionSetHandle {
    shared: Arc<SetShared>,
}

impl ConnectionSetHandle {
    pub fn add_connection(&self, connection: ConnectionHandle) {
        debug_assert!(
            connection.is_connected() || connection.is_listening(),
            "adding connection {} in state {:?}",
            connection.id(),
            connection.state()
        );
        let listener: Arc<dyn ConnectionListener> = self.shared.clone();
        connection.add_listener(Arc::downgrade(&listener));
        self.shared.connections.lock().push(connection);
        self.shared.set_dirty();
    }

    /// Returns false if the connection was not a member.
    pub fn remove_connection(&self, connection: &Connection) -> bool {
        let removed = {
            let mut connections = self.shared.connections.lock();
            let before = connections.len();
            connections.retain(|c| c.id() != connection.id());
            connections.len() != before
        };
        if removed {
            self.shared.set_dirty();
        }
        removed
    }

    pub fn clear(&self) {
        self.shared.connections.lock().clear();
        self.shared.set_dirty();
    }

    /// Make a blocked `select` return `Interrupt`.
    pub fn interrupt(&self) {
        self.shared.waker.wake();
    }

    pub fn len(&self) -> usize {
        self.shared.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.shared.connections.lock().clone()
    }
}

/// The selecting side. Owned by exactly one thread: `Send` but not `Sync`.
pub struct ConnectionSet {
    shared: Arc<SetShared>,
    fds: Vec<libc::pollfd>,
    table: Vec<ConnectionHandle>,
    _single_selector: PhantomData<Cell<()>>,
}

impl ConnectionSet {
    pub fn new() -> Result<Self, ConnectionError> {
        let waker = SocketWaker::new()?;
        Ok(ConnectionSet {
            shared: Arc::new(SetShared {
                connections: Mutex::new(Vec::new()),
                dirty: AtomicBool::new(true),
                waker: Box::new(waker),
            }),
            fds: Vec::new(),
            table: Vec::new(),
            _single_selector: PhantomData,
        })
    }

    pub fn handle(&self) -> ConnectionSetHandle {
        ConnectionSetHandle {
            shared: self.shared.clone(),
        }
    }

    /// Wait for one event. `None` waits indefinitely.
    pub fn select(&mut self, timeout: Option<Duration>) -> SelectEvent {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.shared.dirty.swap(false, Ordering::AcqRel) {
                self.rebuild();
            }

            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        0
                    } else {
                        (deadline - now).as_millis().clamp(1, i32::MAX as u128) as i32
                    }
                }
            };

            let ret = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };

            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll failed: {}", err);
                return SelectEvent::Error(None);
            }
            if ret == 0 {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return SelectEvent::Timeout;
                }
                continue;
            }

            if let Some(event) = self.scan() {
                trace!("select event: {:?}", event);
                return event;
            }
        }
    }

    fn scan(&mut self) -> Option<SelectEvent> {
        for index in 0..self.fds.len() {
            let revents = self.fds[index].revents;
            if revents == 0 {
                continue;
            }

            if index == 0 {
                self.shared.waker.reset();
                return Some(SelectEvent::Interrupt);
            }

            let connection = self.table[index - 1].clone();
            if revents & libc::POLLNVAL != 0 {
                // Handle closed under us; drop it on the next rebuild.
                self.shared.dirty.store(true, Ordering::Release);
                continue;
            }
            if revents & libc::POLLERR != 0 {
                return Some(SelectEvent::Error(Some(connection)));
            }
            if revents & libc::POLLIN != 0 {
                if connection.is_listening() {
                    return Some(SelectEvent::Connect(connection));
                }
                return Some(SelectEvent::Data(connection));
            }
            if revents & libc::POLLHUP != 0 {
                return Some(SelectEvent::Disconnect(connection));
            }
        }
        None
    }

    fn rebuild(&mut self) {
        let connections = self.shared.connections.lock().clone();
        self.fds.clear();
        self.table.clear();
        self.fds.push(libc::pollfd {
            fd: self.shared.waker.notifier(),
            events: libc::POLLIN,
            revents: 0,
        });
        for connection in connections {
            if let Some(fd) = connection.notifier() {
                self.fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
                self.table.push(connection);
            }
        }
        trace!("connection set rebuilt with {} connections", self.table.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_on_empty_set() {
        let mut set = ConnectionSet::new().unwrap();
        let start = Instant::now();
        let event = set.select(Some(Duration::from_millis(20)));
        assert!(matches!(event, SelectEvent::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_data_event() {
        let mut set = ConnectionSet::new().unwrap();
        let (a, b) = Connection::pair().unwrap();
        set.handle().add_connection(b.clone());
        a.send(b"x", false).unwrap();

        // The first call after adding may report the pending wake-up.
        let mut event = set.select(Some(Duration::from_secs(2)));
        if matches!(event, SelectEvent::Interrupt) {
            event = set.select(Some(Duration::from_secs(2)));
        }
        match event {
            SelectEvent::Data(c) => assert_eq!(c.id(), b.id()),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_reported_as_data_or_hangup() {
        let mut set = ConnectionSet::new().unwrap();
        let (a, b) = Connection::pair().unwrap();
        set.handle().add_connection(b.clone());
        set.select(Some(Duration::from_millis(10)));
        a.close();

        let event = set.select(Some(Duration::from_secs(2)));
        match event {
            SelectEvent::Data(c) | SelectEvent::Disconnect(c) => assert_eq!(c.id(), b.id()),
            other => panic!("expected hangup, got {:?}", other),
        }
    }

    #[test]
    fn test_add_wakes_blocked_select() {
        let mut set = ConnectionSet::new().unwrap();
        let handle = set.handle();
        let (a, b) = Connection::pair().unwrap();

        let selector = std::thread::spawn(move || {
            // Drain the initial rebuild, then block.
            let start = Instant::now();
            let first = set.select(Some(Duration::from_secs(5)));
            let woke_after = start.elapsed();
            let mut next = set.select(Some(Duration::from_secs(5)));
            if matches!(next, SelectEvent::Interrupt) {
                next = set.select(Some(Duration::from_secs(5)));
            }
            (first, woke_after, next)
        });

        std::thread::sleep(Duration::from_millis(50));
        handle.add_connection(b.clone());
        a.send(b"x", false).unwrap();

        let (first, woke_after, next) = selector.join().unwrap();
        assert!(
            matches!(first, SelectEvent::Interrupt | SelectEvent::Data(_)),
            "unexpected {:?}",
            first
        );
        assert!(woke_after < Duration::from_secs(5));
        if !matches!(first, SelectEvent::Data(_)) {
            match next {
                SelectEvent::Data(c) => assert_eq!(c.id(), b.id()),
                other => panic!("expected data, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_remove_connection() {
        let set = ConnectionSet::new().unwrap();
        let handle = set.handle();
        let (_a, b) = Connection::pair().unwrap();
        handle.add_connection(b.clone());
        assert_eq!(handle.len(), 1);
        assert!(handle.remove_connection(&b));
        assert!(!handle.remove_connection(&b));
        assert!(handle.is_empty());
    }
}
