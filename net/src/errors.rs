use std::{error::Error, fmt, io};

use crate::sockets::ConnectionState;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The operation is not valid in the connection's current state
    InvalidState { operation: &'static str, state: ConnectionState },
    /// Name resolution or the TCP handshake failed
    ConnectFailed { msg: String },
    SendFailed { msg: String },
    ReceiveFailed { msg: String },
    TimedOut,
    ConnectionClosed,
    /// The processor pool had no free slot within the wait time
    PoolSaturated,
    /// An application callback panicked while handling a packet
    CallbackFailed { msg: String },
    /// The connection cannot continue, for example a frame too large to allocate
    Fatal { msg: String },
    Config { msg: String },
    Serialize { msg: String },
}

impl EngineError {
    pub(crate) fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Maps a socket error raised while writing. Timeouts are expected under load so
    /// they keep their own variant.
    pub(crate) fn from_send(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut,
            _ => Self::SendFailed { msg: err.to_string() },
        }
    }

    pub(crate) fn from_receive(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            io::ErrorKind::OutOfMemory => Self::Fatal { msg: err.to_string() },
            _ => Self::ReceiveFailed { msg: err.to_string() },
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState { operation, state } => {
                write!(f, "{operation} is not valid while {state:?}")
            }
            Self::ConnectFailed { msg } => write!(f, "connect failed: {msg}"),
            Self::SendFailed { msg } => write!(f, "send failed: {msg}"),
            Self::ReceiveFailed { msg } => write!(f, "receive failed: {msg}"),
            Self::TimedOut => write!(f, "timed out"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::PoolSaturated => write!(f, "processor pool saturated"),
            Self::CallbackFailed { msg } => write!(f, "callback failed: {msg}"),
            Self::Fatal { msg } => write!(f, "fatal: {msg}"),
            Self::Config { msg } => write!(f, "configuration error: {msg}"),
            Self::Serialize { msg } => write!(f, "serialization error: {msg}"),
        }
    }
}

impl Error for EngineError {}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config { msg: err.to_string() }
    }
}
