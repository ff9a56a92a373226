//! Wake primitive used to interrupt a blocked multiplexed wait.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::debug;

/// A pollable handle that other threads can make readable.
pub(crate) trait Waker: Send + Sync {
    /// Handle included in the poll table.
    fn notifier(&self) -> RawFd;
    /// Make the notifier readable. Idempotent while un-drained.
    fn wake(&self);
    /// Drain pending wake-ups.
    fn reset(&self);
}

/// Waker backed by a non-blocking socket pair.
pub(crate) struct SocketWaker {
    sender: UnixStream,
    receiver: UnixStream,
}

impl SocketWaker {
    pub(crate) fn new() -> io::Result<Self> {
        let (sender, receiver) = UnixStream::pair()?;
        sender.set_nonblocking(true)?;
        receiver.set_nonblocking(true)?;
        Ok(SocketWaker { sender, receiver })
    }
}

impl Waker for SocketWaker {
    fn notifier(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }

    fn wake(&self) {
        let mut sender: &UnixStream = &self.sender;
        match sender.write(&[1u8]) {
            Ok(_) => {}
            // A full buffer already means a wake-up is pending.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!("connection set wake-up failed: {}", e),
        }
    }

    fn reset(&self) {
        let mut receiver: &UnixStream = &self.receiver;
        let mut buf = [0u8; 64];
        loop {
            match receiver.read(&mut buf) {
                Ok(n) if n == buf.len() => continue,
                _ => break,
            }
        }
    }
}
