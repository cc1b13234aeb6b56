use log::{info, warn};
use std::{
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicU8, Ordering},
        mpsc::{channel, Sender},
        Arc, Mutex, MutexGuard, RwLock,
    },
    time::Duration,
};

use super::{
    buffer_pool::BufferPool,
    callbacks::ConnectionCallback,
    framing::write_frame,
    lifecycle::{StopSignal, WorkerThread},
    processor_pool::ProcessorPool,
    receive_thread::ReceiveThread,
    resolver::AddressResolver,
    ConnectionState,
};
use crate::{
    data_types::{ProcessorCount, WaitTime},
    errors::{EngineError, EngineResult},
    lock_policy::{LockPolicy, PolicyLock},
    packet::Packet,
    settings::EndpointSettings,
};

pub type TcpCallback = Arc<dyn ConnectionCallback<TcpConnection>>;

const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Delivers packets already read and waits up to the wait time for the
    /// receive thread and running callbacks
    Graceful,
    /// Closes the handle and returns without waiting
    Kill,
}

struct ConnectionConfig {
    host_name: String,
    port: String,
    asynchronous_receive: bool,
    wait_time: WaitTime,
    maximum_processor_count: ProcessorCount,
}

/// Resources that exist only while connected
struct ConnectionIo {
    stream: Arc<TcpStream>,
    peer_addr: Option<SocketAddr>,
    pool: Arc<ProcessorPool>,
    stop_signal: StopSignal,
    receive_thread: Option<WorkerThread>,
}

struct ConnectionCore {
    name: &'static str,
    state: AtomicU8,
    config: Mutex<ConnectionConfig>,
    general_lock: PolicyLock,
    send_lock: PolicyLock,
    callback: RwLock<TcpCallback>,
    resolver: Arc<dyn AddressResolver>,
    buffer_pool: Arc<BufferPool>,
    io: Mutex<Option<ConnectionIo>>,
}

/// Shared handle to one TCP connection. Owned by `TcpClient` or `TcpSocket` and
/// passed to every callback. Moves through
/// `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`.
#[derive(Clone)]
pub struct TcpConnection {
    core: Arc<ConnectionCore>,
}

impl TcpConnection {
    pub(crate) fn new(
        name: &'static str,
        settings: &EndpointSettings,
        callback: TcpCallback,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            core: Arc::new(ConnectionCore {
                name,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                config: Mutex::new(ConnectionConfig {
                    host_name: settings.host_name.clone(),
                    port: settings.port.clone(),
                    asynchronous_receive: settings.asynchronous_receive,
                    wait_time: settings.wait_time(),
                    maximum_processor_count: settings.maximum_processor_count,
                }),
                general_lock: PolicyLock::new(settings.lock_policy),
                send_lock: PolicyLock::new(settings.lock_policy),
                callback: RwLock::new(callback),
                resolver,
                buffer_pool: Arc::new(BufferPool::new()),
                io: Mutex::new(None),
            }),
        }
    }

    pub fn state(self: &Self) -> ConnectionState {
        ConnectionState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    pub fn is_connected(self: &Self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn host_name(self: &Self) -> String {
        self.config().host_name.clone()
    }

    pub fn port(self: &Self) -> String {
        self.config().port.clone()
    }

    pub fn peer_addr(self: &Self) -> Option<SocketAddr> {
        self.io().as_ref().and_then(|io| io.peer_addr)
    }

    /// Rejected with `InvalidState` unless disconnected
    pub fn set_host_name(self: &Self, host_name: &str) -> EngineResult<()> {
        let _guard = self.core.general_lock.lock();
        match self.state() {
            ConnectionState::Disconnected => {
                self.config().host_name = host_name.to_owned();
                Ok(())
            }
            state => Err(EngineError::invalid_state("set_host_name", state)),
        }
    }

    /// Rejected with `InvalidState` unless disconnected
    pub fn set_port(self: &Self, port: &str) -> EngineResult<()> {
        let _guard = self.core.general_lock.lock();
        match self.state() {
            ConnectionState::Disconnected => {
                self.config().port = port.to_owned();
                Ok(())
            }
            state => Err(EngineError::invalid_state("set_port", state)),
        }
    }

    pub fn is_asynchronous_receive(self: &Self) -> bool {
        self.config().asynchronous_receive
    }

    /// Takes effect the next time the connection is established
    pub fn set_asynchronous_receive(self: &Self, asynchronous_receive: bool) {
        self.config().asynchronous_receive = asynchronous_receive;
    }

    pub fn wait_time(self: &Self) -> WaitTime {
        self.config().wait_time
    }

    pub fn set_wait_time(self: &Self, wait_time: WaitTime) {
        self.config().wait_time = wait_time;
    }

    pub fn maximum_processor_count(self: &Self) -> ProcessorCount {
        self.config().maximum_processor_count
    }

    pub fn set_maximum_processor_count(self: &Self, maximum: ProcessorCount) {
        self.config().maximum_processor_count = maximum;
        if let Some(io) = self.io().as_ref() {
            io.pool.set_maximum_processor_count(maximum);
        }
    }

    pub fn callback(self: &Self) -> TcpCallback {
        self.core
            .callback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_callback(self: &Self, callback: TcpCallback) {
        *self
            .core
            .callback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback;
    }

    pub fn lock_policy(self: &Self) -> LockPolicy {
        self.core.general_lock.policy()
    }

    pub fn buffer_pool(self: &Self) -> &Arc<BufferPool> {
        &self.core.buffer_pool
    }

    /// The processor pool of the current connection, if connected
    pub fn processor_pool(self: &Self) -> Option<Arc<ProcessorPool>> {
        self.io().as_ref().map(|io| io.pool.clone())
    }

    /// Writes one frame. Returns the number of payload bytes sent. Socket failures
    /// come back as `SendFailed` or `TimedOut` and leave the connection to the
    /// receive thread, which notices a dead peer on its next read.
    pub fn send(self: &Self, packet: &Packet, wait_time: WaitTime) -> EngineResult<usize> {
        let _guard = self.core.send_lock.lock();
        let stream = match (self.state(), self.io().as_ref()) {
            (ConnectionState::Connected, Some(io)) => io.stream.clone(),
            (state, _) => return Err(EngineError::invalid_state("send", state)),
        };

        if let Err(e) = stream.set_write_timeout(wait_time.duration().map(|d| d.max(MIN_SOCKET_TIMEOUT))) {
            warn!("{}: Failed to set write timeout: {e}", self.core.name);
        }

        match write_frame(&mut &*stream, packet) {
            Ok(byte_count) => Ok(byte_count),
            Err(e) => {
                warn!("{}: Failed to send {} byte packet: {e}", self.core.name, packet.size());
                Err(EngineError::from_send(&e))
            }
        }
    }

    /// Closes the connection. Packets already read are still delivered, waiting up
    /// to the wait time for them and for the receive thread. Does nothing unless
    /// connected.
    pub fn disconnect(self: &Self) {
        self.teardown(Teardown::Graceful, true);
    }

    /// Forces the connection closed without waiting for running callbacks
    pub fn kill_connection(self: &Self) {
        self.teardown(Teardown::Kill, true);
    }

    /// Kills the connection without calling `on_disconnect`, for cleanup paths that
    /// must not re-enter application code
    pub(crate) fn kill_connection_no_callback(self: &Self) {
        self.teardown(Teardown::Kill, false);
    }

    pub(crate) fn disconnect_no_callback(self: &Self) {
        self.teardown(Teardown::Graceful, false);
    }

    pub(crate) fn connect(self: &Self, host_name: Option<&str>, port: Option<&str>) -> EngineResult<()> {
        let start_gate = {
            let _guard = self.core.general_lock.lock();
            self.transition(ConnectionState::Disconnected, ConnectionState::Connecting)
                .map_err(|state| EngineError::invalid_state("connect", state))?;

            let (host_name, port, wait_time) = {
                let mut config = self.config();
                if let Some(host_name) = host_name {
                    config.host_name = host_name.to_owned();
                }
                if let Some(port) = port {
                    config.port = port.to_owned();
                }
                (config.host_name.clone(), config.port.clone(), config.wait_time)
            };

            info!("{}: Connecting to {host_name}:{port}", self.core.name);
            let started = self
                .core
                .resolver
                .resolve(&host_name, &port)
                .and_then(|addresses| open_stream(&addresses, wait_time))
                .and_then(|stream| self.start_io(stream));

            match started {
                Ok(start_gate) => {
                    self.set_state(ConnectionState::Connected);
                    info!("{}: Connected to {host_name}:{port}", self.core.name);
                    start_gate
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!("{}: Failed to connect to {host_name}:{port}: {e}", self.core.name);
                    return Err(e);
                }
            }
        };

        self.callback().on_connect(self);
        drop(start_gate);
        Ok(())
    }

    /// Adopts a stream accepted by a listener
    pub(crate) fn attach(self: &Self, stream: TcpStream) -> EngineResult<()> {
        let start_gate = {
            let _guard = self.core.general_lock.lock();
            self.transition(ConnectionState::Disconnected, ConnectionState::Connecting)
                .map_err(|state| EngineError::invalid_state("attach", state))?;

            if let Ok(peer_addr) = stream.peer_addr() {
                let mut config = self.config();
                config.host_name = peer_addr.ip().to_string();
                config.port = peer_addr.port().to_string();
            }

            match self.start_io(stream) {
                Ok(start_gate) => {
                    self.set_state(ConnectionState::Connected);
                    info!("{}: Accepted connection from {}:{}", self.core.name, self.host_name(), self.port());
                    start_gate
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        };

        self.callback().on_connect(self);
        drop(start_gate);
        Ok(())
    }

    pub(crate) fn report_error(self: &Self, error: &EngineError) {
        self.callback().on_error(self, error);
    }

    pub(crate) fn name(self: &Self) -> &'static str {
        self.core.name
    }

    /// Returns false when the connection was not connected
    pub(crate) fn teardown(self: &Self, mode: Teardown, notify: bool) -> bool {
        let (io, wait_time) = {
            let _guard = self.core.general_lock.lock();
            if self
                .transition(ConnectionState::Connected, ConnectionState::Disconnecting)
                .is_err()
            {
                return false;
            }
            (self.io().take(), self.wait_time())
        };

        if let Some(io) = io {
            io.stop_signal.stop();

            // Shutting the socket down unblocks the receive thread's pending read
            if let Err(e) = io.stream.shutdown(Shutdown::Both) {
                info!("{}: Socket already closed: {e}", self.core.name);
            }

            // Either way a receive thread blocked on a full pool is released
            match mode {
                Teardown::Graceful => {
                    io.pool.close();
                    if let Some(thread) = io.receive_thread {
                        thread.join(wait_time);
                    }
                    io.pool.drain(wait_time);
                }
                Teardown::Kill => io.pool.halt(),
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("{}: Disconnected", self.core.name);

        if notify {
            self.callback().on_disconnect(self);
        }
        true
    }

    fn start_io(self: &Self, stream: TcpStream) -> EngineResult<Sender<()>> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("{}: Failed to disable Nagle: {e}", self.core.name);
        }
        let peer_addr = stream.peer_addr().ok();
        let reader = stream.try_clone().map_err(|e| EngineError::Fatal {
            msg: format!("Failed to duplicate socket handle: {e}"),
        })?;

        let (asynchronous_receive, wait_time, maximum) = {
            let config = self.config();
            (config.asynchronous_receive, config.wait_time, config.maximum_processor_count)
        };

        let stream = Arc::new(stream);
        let pool = Arc::new(ProcessorPool::new(self.core.name, maximum));
        let stop_signal = StopSignal::new();
        let (start_sender, start_receiver) = channel::<()>();

        let receive = ReceiveThread::new(
            self,
            reader,
            &pool,
            &stop_signal,
            asynchronous_receive,
            wait_time,
            start_receiver,
        );
        let receive_thread = WorkerThread::spawn(&format!("{}-receive", self.core.name), move || receive.run())
            .map_err(|e| {
                let _ = stream.shutdown(Shutdown::Both);
                EngineError::Fatal {
                    msg: format!("Failed to start receive thread: {e}"),
                }
            })?;

        *self.io() = Some(ConnectionIo {
            stream,
            peer_addr,
            pool,
            stop_signal,
            receive_thread: Some(receive_thread),
        });
        Ok(start_sender)
    }

    fn transition(self: &Self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectionState> {
        self.core
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    fn set_state(self: &Self, state: ConnectionState) {
        self.core.state.store(state as u8, Ordering::Release);
    }

    fn config(self: &Self) -> MutexGuard<'_, ConnectionConfig> {
        self.core.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn io(self: &Self) -> MutexGuard<'_, Option<ConnectionIo>> {
        self.core.io.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn open_stream(addresses: &[SocketAddr], wait_time: WaitTime) -> EngineResult<TcpStream> {
    let mut last_error = None;
    for address in addresses {
        let result = match wait_time.duration() {
            Some(limit) => TcpStream::connect_timeout(address, limit.max(MIN_SOCKET_TIMEOUT)),
            None => TcpStream::connect(address),
        };
        match result {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(EngineError::ConnectFailed {
        msg: match last_error {
            Some(e) => e.to_string(),
            None => "no addresses to connect to".to_owned(),
        },
    })
}
