/*
Socket endpoints built on the standard library. Each connection owns a receive
thread and a processor pool; the UDP path adds a priority ordered request
scheduler in front of the socket.
*/
pub mod buffer_pool;
pub mod callbacks;
pub mod completion;
pub mod framing;
pub mod io_scheduler;
pub mod lifecycle;
pub mod notifier;
pub mod priority_queue;
mod processing_thread;
pub mod processor_pool;
mod receive_thread;
pub mod resolver;
pub mod tcp_client;
pub mod tcp_connection;
pub mod tcp_socket;
pub mod udp_socket;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}
