/*
Threaded network I/O engine. TCP endpoints read length prefixed frames on a
dedicated thread and dispatch them to application callbacks through a
bounded processor pool. UDP endpoints run sends and receives through a
priority ordered request queue with event or callback completion.
*/
pub mod data_types;
pub mod errors;
pub mod lock_policy;
pub mod packet;
pub mod serialization;
pub mod settings;
pub mod sockets;

pub use data_types::{ProcessorCount, WaitTime, PROCESSOR_LIMIT_INFINITE};
pub use errors::{EngineError, EngineResult};
pub use lock_policy::LockPolicy;
pub use packet::Packet;
pub use serialization::PacketSerializer;
pub use settings::EndpointSettings;
pub use sockets::{
    buffer_pool::BufferPool,
    callbacks::{ConnectionCallback, NullCallback},
    completion::{Completion, CompletionEvent, IoCompletionCallback, IoOutcome, ReceiveStatus, SendStatus},
    io_scheduler::RequestId,
    notifier::{CompletionNotifier, UdpNotifier},
    priority_queue::Priority,
    processor_pool::{PacketProcessor, ProcessorPool},
    resolver::{AddressResolver, SystemResolver},
    tcp_client::TcpClient,
    tcp_connection::{TcpCallback, TcpConnection},
    tcp_socket::TcpSocket,
    udp_socket::{UdpCallback, UdpConnection, UdpSocket},
    ConnectionState,
};
