use std::{net::TcpStream, ops::Deref, sync::Arc};

use super::{
    resolver::SystemResolver,
    tcp_connection::{TcpCallback, TcpConnection},
};
use crate::{errors::EngineResult, settings::EndpointSettings};

/// Server side of a TCP connection, wrapping a stream accepted by a listener.
/// Starts connected; the host name and port reflect the peer. Dropping the
/// socket kills the connection without calling `on_disconnect`.
pub struct TcpSocket {
    connection: TcpConnection,
}

impl TcpSocket {
    pub fn new(stream: TcpStream, settings: &EndpointSettings, callback: TcpCallback) -> EngineResult<Self> {
        let connection = TcpConnection::new("TcpSocket", settings, callback, Arc::new(SystemResolver));
        connection.attach(stream)?;
        Ok(Self { connection })
    }

    pub fn connection(self: &Self) -> &TcpConnection {
        &self.connection
    }
}

impl Deref for TcpSocket {
    type Target = TcpConnection;

    fn deref(&self) -> &TcpConnection {
        &self.connection
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.connection.kill_connection_no_callback();
    }
}
