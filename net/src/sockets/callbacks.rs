use crate::{errors::EngineError, packet::Packet};

/// Notifications an endpoint delivers to the application. Every method has an
/// empty default so implementations only override what they use. The packet
/// passed to `on_receive` is released when the implementation drops it.
pub trait ConnectionCallback<E>: Send + Sync {
    fn on_connect(&self, _endpoint: &E) {}
    fn on_receive(&self, _endpoint: &E, _packet: Packet) {}
    fn on_disconnect(&self, _endpoint: &E) {}
    fn on_error(&self, _endpoint: &E, _error: &EngineError) {}
}

/// Callback for endpoints constructed without one
pub struct NullCallback;

impl<E> ConnectionCallback<E> for NullCallback {}
