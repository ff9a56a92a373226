//! Connections
//!
//! A [`Connection`] is one bidirectional byte-stream endpoint with an explicit
//! state machine:
//!
//! ```text
//!             connect()            ┌───────────┐
//!   Closed ──────────► Connecting ─►│ Connected │──┐
//!     ▲  │                          └───────────┘  │ close()
//!     │  │ listen()                 ┌───────────┐  ├──► Closing ──► Closed
//!     │  └─────────────────────────►│ Listening │──┘
//!     │                             └───────────┘
//!     └── failure at any step
//! ```
//!
//! `read`/`write` are the raw primitives; `recv`/`send` loop until the full
//! byte count is transferred. `send` serializes writers through the
//! connection's send gate unless the caller already holds it
//! (`lock_send`/`unlock_send`), which is how a data stream keeps the chunks of
//! one logical message contiguous on the wire.

mod description;
mod error;
mod set;
mod waker;

pub use description::{
    ConnectionDescription, ConnectionType, DEFAULT_LOCAL_BANDWIDTH_KBS,
    DEFAULT_SOCKET_BANDWIDTH_KBS,
};
pub use error::ConnectionError;
pub use set::{ConnectionSet, ConnectionSetHandle, SelectEvent};

use parking_lot::{Condvar, Mutex, RwLock};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to a connection.
pub type ConnectionHandle = Arc<Connection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Listening,
    Closing,
}

/// Observer of connection state transitions.
pub trait ConnectionListener: Send + Sync {
    fn notify_state_changed(&self, connection: &Connection);
}

enum Endpoint {
    Tcp(TcpStream),
    TcpListener(TcpListener),
    Unix(UnixStream),
    UnixListener(UnixListener),
}

impl Endpoint {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Endpoint::Tcp(stream) => {
                let mut stream: &TcpStream = stream;
                stream.read(buf)
            }
            Endpoint::Unix(stream) => {
                let mut stream: &UnixStream = stream;
                stream.read(buf)
            }
            Endpoint::TcpListener(_) | Endpoint::UnixListener(_) => Err(not_a_stream()),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Endpoint::Tcp(stream) => {
                let mut stream: &TcpStream = stream;
                stream.write(buf)
            }
            Endpoint::Unix(stream) => {
                let mut stream: &UnixStream = stream;
                stream.write(buf)
            }
            Endpoint::TcpListener(_) | Endpoint::UnixListener(_) => Err(not_a_stream()),
        }
    }

    fn shutdown(&self) {
        let result = match self {
            Endpoint::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Endpoint::Unix(stream) => stream.shutdown(Shutdown::Both),
            Endpoint::TcpListener(_) | Endpoint::UnixListener(_) => Ok(()),
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("shutdown failed: {}", e);
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Endpoint::Tcp(s) => s.as_raw_fd(),
            Endpoint::TcpListener(l) => l.as_raw_fd(),
            Endpoint::Unix(s) => s.as_raw_fd(),
            Endpoint::UnixListener(l) => l.as_raw_fd(),
        }
    }
}

fn not_a_stream() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "listening endpoint carries no data")
}

/// Serializes writers: at most one holder at a time, across calls.
struct SendGate {
    locked: Mutex<bool>,
    released: Condvar,
}

impl SendGate {
    fn new() -> Self {
        SendGate {
            locked: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.released.wait(&mut locked);
        }
        *locked = true;
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock();
        debug_assert!(*locked, "send gate unlocked while not held");
        *locked = false;
        drop(locked);
        self.released.notify_one();
    }
}

pub struct Connection {
    id: u64,
    description: RwLock<ConnectionDescription>,
    state: Mutex<ConnectionState>,
    endpoint: RwLock<Option<Endpoint>>,
    send_gate: SendGate,
    listeners: Mutex<Vec<Weak<dyn ConnectionListener>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("description", &*self.description.read())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a closed connection for `description`.
    pub fn create(description: ConnectionDescription) -> ConnectionHandle {
        Arc::new(Self::with_state(description, None, ConnectionState::Closed))
    }

    fn with_state(
        description: ConnectionDescription,
        endpoint: Option<Endpoint>,
        state: ConnectionState,
    ) -> Self {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            description: RwLock::new(description),
            state: Mutex::new(state),
            endpoint: RwLock::new(endpoint),
            send_gate: SendGate::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Two connected ends of an in-process pipe.
    pub fn pair() -> Result<(ConnectionHandle, ConnectionHandle), ConnectionError> {
        let (a, b) = UnixStream::pair()?;
        let description = ConnectionDescription::new(ConnectionType::ConnectionPair);
        let first = Arc::new(Self::with_state(
            description.clone(),
            Some(Endpoint::Unix(a)),
            ConnectionState::Connected,
        ));
        let second = Arc::new(Self::with_state(
            description,
            Some(Endpoint::Unix(b)),
            ConnectionState::Connected,
        ));
        Ok((first, second))
    }

    /// Process-unique connection number.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn description(&self) -> ConnectionDescription {
        self.description.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ConnectionState::Listening
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Register a state-change observer. Dead observers are pruned lazily.
    pub fn add_listener(&self, listener: Weak<dyn ConnectionListener>) {
        self.listeners.lock().push(listener);
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }

        let listeners: Vec<Arc<dyn ConnectionListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.notify_state_changed(self);
        }
    }

    fn expect_state(&self, expected: ConnectionState) -> Result<(), ConnectionError> {
        let actual = self.state();
        if actual != expected {
            return Err(ConnectionError::InvalidState { expected, actual });
        }
        Ok(())
    }

    /// Connect to the endpoint named by the description.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        self.expect_state(ConnectionState::Closed)?;
        let description = self.description();
        let endpoint = match description.connection_type {
            ConnectionType::StreamSocket => {
                self.set_state(ConnectionState::Connecting);
                TcpStream::connect((description.hostname.as_str(), description.port))
                    .and_then(|stream| {
                        stream.set_nodelay(true)?;
                        Ok(Endpoint::Tcp(stream))
                    })
            }
            ConnectionType::LocalPipe => {
                self.set_state(ConnectionState::Connecting);
                UnixStream::connect(&description.filename).map(Endpoint::Unix)
            }
            other => return Err(ConnectionError::Unsupported(other)),
        };

        match endpoint {
            Ok(endpoint) => {
                *self.endpoint.write() = Some(endpoint);
                self.set_state(ConnectionState::Connected);
                debug!("connection {} connected to {}", self.id, description);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Closed);
                warn!("connect to {} failed: {}", description, e);
                Err(e.into())
            }
        }
    }

    /// Bind and listen. A TCP description with port 0 records the bound port.
    pub fn listen(&self) -> Result<(), ConnectionError> {
        self.expect_state(ConnectionState::Closed)?;
        let description = self.description();
        let endpoint = match description.connection_type {
            ConnectionType::StreamSocket => {
                let listener =
                    TcpListener::bind((description.hostname.as_str(), description.port))?;
                let port = listener.local_addr()?.port();
                self.description.write().port = port;
                Endpoint::TcpListener(listener)
            }
            ConnectionType::LocalPipe => {
                Endpoint::UnixListener(UnixListener::bind(&description.filename)?)
            }
            other => return Err(ConnectionError::Unsupported(other)),
        };

        *self.endpoint.write() = Some(endpoint);
        self.set_state(ConnectionState::Listening);
        info!("listening on {}", self.description());
        Ok(())
    }

    /// Accept one pending inbound connection.
    pub fn accept(&self) -> Result<ConnectionHandle, ConnectionError> {
        self.expect_state(ConnectionState::Listening)?;
        let listener_description = self.description();
        let guard = self.endpoint.read();
        let (endpoint, description) = match guard.as_ref() {
            Some(Endpoint::TcpListener(listener)) => {
                let (stream, addr) = listener.accept()?;
                stream.set_nodelay(true)?;
                let description = ConnectionDescription {
                    hostname: addr.ip().to_string(),
                    port: addr.port(),
                    ..listener_description
                };
                (Endpoint::Tcp(stream), description)
            }
            Some(Endpoint::UnixListener(listener)) => {
                let (stream, _) = listener.accept()?;
                (Endpoint::Unix(stream), listener_description)
            }
            _ => {
                return Err(ConnectionError::InvalidState {
                    expected: ConnectionState::Listening,
                    actual: self.state(),
                })
            }
        };
        debug!("connection {} accepted {}", self.id, description);
        Ok(Arc::new(Self::with_state(
            description,
            Some(endpoint),
            ConnectionState::Connected,
        )))
    }

    /// Close the connection; blocked readers and writers are released.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closing;
        }

        if let Some(endpoint) = self.endpoint.read().as_ref() {
            endpoint.shutdown();
        }
        let endpoint = self.endpoint.write().take();
        if let Some(Endpoint::UnixListener(listener)) = &endpoint {
            if let Ok(addr) = listener.local_addr() {
                if let Some(path) = addr.as_pathname() {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        drop(endpoint);

        self.set_state(ConnectionState::Closed);
        debug!("connection {} closed", self.id);
    }

    /// OS handle the multiplexer polls on.
    pub fn notifier(&self) -> Option<RawFd> {
        self.endpoint.read().as_ref().map(Endpoint::raw_fd)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let guard = self.endpoint.read();
        let endpoint = guard.as_ref().ok_or(ConnectionError::Closed)?;
        Ok(endpoint.read(buf)?)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, ConnectionError> {
        let guard = self.endpoint.read();
        let endpoint = guard.as_ref().ok_or(ConnectionError::Closed)?;
        Ok(endpoint.write(buf)?)
    }

    /// Read exactly `buf.len()` bytes.
    pub fn recv(&self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => filled += n,
                Err(ConnectionError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write all of `data`. Takes the send gate unless `is_locked`.
    pub fn send(&self, data: &[u8], is_locked: bool) -> Result<(), ConnectionError> {
        if !is_locked {
            self.send_gate.lock();
        }
        let result = self.write_all(data);
        if !is_locked {
            self.send_gate.unlock();
        }
        result
    }

    fn write_all(&self, mut data: &[u8]) -> Result<(), ConnectionError> {
        while !data.is_empty() {
            match self.write(data) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => data = &data[n..],
                Err(ConnectionError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Hold the send gate across several `send(.., true)` calls.
    pub fn lock_send(&self) {
        self.send_gate.lock();
    }

    pub fn unlock_send(&self) {
        self.send_gate.unlock();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(Endpoint::UnixListener(listener)) = self.endpoint.get_mut().as_ref() {
            if let Ok(addr) = listener.local_addr() {
                if let Some(path) = addr.as_pathname() {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pair_send_recv() {
        let (a, b) = Connection::pair().unwrap();
        assert!(a.is_connected());
        a.send(b"hello", false).unwrap();
        let mut buf = [0u8; 5];
        b.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_recv_after_close_reports_closed() {
        let (a, b) = Connection::pair().unwrap();
        a.close();
        assert!(a.is_closed());
        let mut buf = [0u8; 4];
        assert!(matches!(b.recv(&mut buf), Err(ConnectionError::Closed)));
    }

    #[test]
    fn test_unsupported_types() {
        let rdma = Connection::create(ConnectionDescription::new(ConnectionType::Rdma));
        assert!(matches!(
            rdma.connect(),
            Err(ConnectionError::Unsupported(ConnectionType::Rdma))
        ));
        let mc = Connection::create(ConnectionDescription::new(ConnectionType::MulticastGroup));
        assert!(matches!(mc.listen(), Err(ConnectionError::Unsupported(_))));
        assert!(mc.is_closed());
    }

    #[test]
    fn test_tcp_listen_accept_connect() {
        let listener = Connection::create(ConnectionDescription::tcp("127.0.0.1", 0));
        listener.listen().unwrap();
        let port = listener.description().port;
        assert_ne!(port, 0);

        let client = Connection::create(ConnectionDescription::tcp("127.0.0.1", port));
        client.connect().unwrap();
        let server = listener.accept().unwrap();

        client.send(&[1, 2, 3], false).unwrap();
        let mut buf = [0u8; 3];
        server.recv(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_local_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.sock");
        let desc = ConnectionDescription::pipe(path.to_string_lossy().to_string());

        let listener = Connection::create(desc.clone());
        listener.listen().unwrap();
        let client = Connection::create(desc);
        client.connect().unwrap();
        let server = listener.accept().unwrap();

        server.send(b"pipe", false).unwrap();
        let mut buf = [0u8; 4];
        client.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"pipe");
    }

    #[test]
    fn test_locked_sends_are_not_interleaved() {
        let (a, b) = Connection::pair().unwrap();
        let writer = a.clone();

        a.lock_send();
        let handle = thread::spawn(move || {
            // Blocks on the gate until the first message is complete.
            writer.send(&[9u8; 4], false).unwrap();
        });
        a.send(&[1u8; 4], true).unwrap();
        a.send(&[2u8; 4], true).unwrap();
        a.unlock_send();
        handle.join().unwrap();

        let mut buf = [0u8; 12];
        b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..8], &[1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(&buf[8..], &[9, 9, 9, 9]);
    }

    struct CountingListener(AtomicU64);

    impl ConnectionListener for CountingListener {
        fn notify_state_changed(&self, _connection: &Connection) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_state_listener_fires_on_close() {
        let (a, _b) = Connection::pair().unwrap();
        let listener = Arc::new(CountingListener(AtomicU64::new(0)));
        let dyn_listener: Arc<dyn ConnectionListener> = listener.clone();
        a.add_listener(Arc::downgrade(&dyn_listener));
        a.close();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        a.close();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }
}
