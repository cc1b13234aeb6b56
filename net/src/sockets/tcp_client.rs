use std::{ops::Deref, sync::Arc};

use super::{
    callbacks::NullCallback,
    resolver::{AddressResolver, SystemResolver},
    tcp_connection::{TcpCallback, TcpConnection},
};
use crate::{errors::EngineResult, settings::EndpointSettings};

/// Client side of a TCP connection. Dereferences to its `TcpConnection` for
/// sending and configuration. Dropping the client disconnects without calling
/// `on_disconnect`.
pub struct TcpClient {
    connection: TcpConnection,
}

impl TcpClient {
    pub fn new(settings: &EndpointSettings, callback: TcpCallback) -> Self {
        Self::with_resolver(settings, callback, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        settings: &EndpointSettings,
        callback: TcpCallback,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            connection: TcpConnection::new("TcpClient", settings, callback, resolver),
        }
    }

    /// A client that ignores every notification
    pub fn without_callback(settings: &EndpointSettings) -> Self {
        Self::new(settings, Arc::new(NullCallback))
    }

    /// Connects to `host_name:port`, or to the stored values for arguments that are
    /// `None`. Fails with `InvalidState` unless disconnected, in which case the
    /// existing connection is left untouched.
    pub fn connect(self: &Self, host_name: Option<&str>, port: Option<&str>) -> EngineResult<()> {
        self.connection.connect(host_name, port)
    }

    pub fn disconnect(self: &Self) {
        self.connection.disconnect();
    }

    pub fn connection(self: &Self) -> &TcpConnection {
        &self.connection
    }
}

impl Deref for TcpClient {
    type Target = TcpConnection;

    fn deref(&self) -> &TcpConnection {
        &self.connection
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.connection.disconnect_no_callback();
    }
}
