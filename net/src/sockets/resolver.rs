use std::net::{SocketAddr, ToSocketAddrs};

use crate::errors::{EngineError, EngineResult};

/// Turns a host and port into connectable addresses. Called on the thread that
/// invoked connect and allowed to block.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, host_name: &str, port: &str) -> EngineResult<Vec<SocketAddr>>;
}

/// Resolves through the operating system
pub struct SystemResolver;

impl AddressResolver for SystemResolver {
    fn resolve(&self, host_name: &str, port: &str) -> EngineResult<Vec<SocketAddr>> {
        let port: u16 = port.parse().map_err(|_| EngineError::ConnectFailed {
            msg: format!("'{port}' is not a valid port number"),
        })?;

        let addresses: Vec<SocketAddr> = (host_name, port)
            .to_socket_addrs()
            .map_err(|e| EngineError::ConnectFailed {
                msg: format!("Failed to resolve {host_name}: {e}"),
            })?
            .collect();

        if addresses.is_empty() {
            Err(EngineError::ConnectFailed {
                msg: format!("{host_name} did not resolve to any address"),
            })
        } else {
            Ok(addresses)
        }
    }
}
