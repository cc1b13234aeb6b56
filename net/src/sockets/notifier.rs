use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use super::buffer_pool::BufferPool;
use crate::packet::Packet;

/// Largest payload a single datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65536;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The I/O facility a UDP socket runs its requests against. `poll_receive` is
/// called from the socket's completion thread and `send` from its scheduler
/// thread, possibly at the same time.
pub trait CompletionNotifier: Send + Sync {
    /// Sends one datagram, returning the number of bytes written
    fn send(&self, payload: &[u8]) -> io::Result<usize>;

    /// Waits up to `timeout` for a datagram. `Ok(None)` means nothing arrived.
    fn poll_receive(&self, timeout: Duration, buffer_pool: &Arc<BufferPool>) -> io::Result<Option<Packet>>;

    /// Makes further calls fail. Called once when the socket is killed.
    fn close(&self);
}

/// Notifier over a connected OS datagram socket
pub struct UdpNotifier {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpNotifier {
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            closed: AtomicBool::new(false),
        }
    }

    /// Binds an ephemeral local port of the same family and connects it to `peer`
    pub fn bind_connected(peer: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = match peer {
            SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
            SocketAddr::V6(_) => ([0u16; 8], 0).into(),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        Ok(Self::from_socket(socket))
    }

    pub fn local_addr(self: &Self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn check_open(self: &Self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
        } else {
            Ok(())
        }
    }
}

impl CompletionNotifier for UdpNotifier {
    fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} byte payload does not fit in a datagram", payload.len()),
            ));
        }
        self.socket.send(payload)
    }

    fn poll_receive(&self, timeout: Duration, buffer_pool: &Arc<BufferPool>) -> io::Result<Option<Packet>> {
        self.check_open()?;
        self.socket.set_read_timeout(Some(timeout.max(MIN_POLL_INTERVAL)))?;

        let packet = Packet::from_pool(buffer_pool, MAX_DATAGRAM_SIZE);
        match packet.with_payload_mut(|buffer| self.socket.recv(buffer)) {
            Ok(byte_count) => {
                packet.set_size(byte_count);
                Ok(Some(packet))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
