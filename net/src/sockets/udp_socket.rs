/*
UDP endpoint. Sends, receives and queued kills go through a priority ordered
request queue drained by a dedicated scheduler thread, while a completion
thread polls the notifier for datagrams and hands each one to the highest
priority receive that is waiting. Every request is resolved exactly once,
through the `Completion` the caller supplied.
*/
#[cfg(debug_assertions)]
use log::debug;
use log::{error, info, warn};
use std::{
    net::UdpSocket as StdUdpSocket,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use super::{
    buffer_pool::BufferPool,
    callbacks::ConnectionCallback,
    completion::{Completion, CompletionEvent, IoOutcome, ReceiveStatus, SendStatus},
    io_scheduler::{IoScheduler, PendingRequest, RequestId, RequestKind},
    lifecycle::{StopSignal, WorkerThread},
    notifier::{CompletionNotifier, UdpNotifier},
    priority_queue::Priority,
    resolver::{AddressResolver, SystemResolver},
};
use crate::{
    data_types::WaitTime,
    errors::{EngineError, EngineResult},
    lock_policy::{LockPolicy, PolicyLock},
    packet::Packet,
    settings::EndpointSettings,
};

pub type UdpCallback = Arc<dyn ConnectionCallback<UdpConnection>>;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct UdpCore {
    name: String,
    alive: AtomicBool,
    lifecycle_lock: PolicyLock,
    wait_time: WaitTime,
    callback: RwLock<UdpCallback>,
    notifier: Arc<dyn CompletionNotifier>,
    scheduler: IoScheduler,
    buffer_pool: Arc<BufferPool>,
    stop_signal: StopSignal,
    threads: Mutex<Vec<WorkerThread>>,
}

/// Shared handle to a UDP endpoint, passed to every callback. Owned by a
/// `UdpSocket`.
#[derive(Clone)]
pub struct UdpConnection {
    core: Arc<UdpCore>,
}

impl UdpConnection {
    fn open(
        name: String,
        notifier: Arc<dyn CompletionNotifier>,
        settings: &EndpointSettings,
        callback: UdpCallback,
    ) -> EngineResult<Self> {
        let connection = Self {
            core: Arc::new(UdpCore {
                scheduler: IoScheduler::new(&name),
                name,
                alive: AtomicBool::new(true),
                lifecycle_lock: PolicyLock::new(settings.lock_policy),
                wait_time: settings.wait_time(),
                callback: RwLock::new(callback),
                notifier,
                buffer_pool: Arc::new(BufferPool::new()),
                stop_signal: StopSignal::new(),
                threads: Mutex::new(Vec::new()),
            }),
        };

        if let Err(e) = connection.start_threads() {
            connection.kill(false);
            return Err(EngineError::Fatal {
                msg: format!("Failed to start UDP threads: {e}"),
            });
        }

        info!("{}: Opened", connection.core.name);
        connection.callback().on_connect(&connection);
        Ok(connection)
    }

    pub fn name(self: &Self) -> &str {
        &self.core.name
    }

    pub fn is_connection_alive(self: &Self) -> bool {
        self.core.alive.load(Ordering::Acquire)
    }

    pub fn wait_time(self: &Self) -> WaitTime {
        self.core.wait_time
    }

    pub fn lock_policy(self: &Self) -> LockPolicy {
        self.core.lifecycle_lock.policy()
    }

    pub fn buffer_pool(self: &Self) -> &Arc<BufferPool> {
        &self.core.buffer_pool
    }

    pub fn callback(self: &Self) -> UdpCallback {
        self.core
            .callback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_callback(self: &Self, callback: UdpCallback) {
        *self
            .core
            .callback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback;
    }

    /// Requests queued or parked and not yet resolved
    pub fn pending_request_count(self: &Self) -> usize {
        self.core.scheduler.pending_count()
    }

    /// Datagrams received while no receive was waiting for them
    pub fn unclaimed_packet_count(self: &Self) -> usize {
        self.core.scheduler.unclaimed_count()
    }

    /// Queues the packet as one datagram. The completion is signalled with a
    /// `SendStatus` once the datagram is written, or with `Failed` if the socket is
    /// killed first. On a dead socket the completion is failed at once and
    /// `ConnectionClosed` is returned.
    pub fn send(self: &Self, packet: &Packet, completion: Completion, priority: Priority) -> EngineResult<RequestId> {
        self.core
            .scheduler
            .enqueue(priority, RequestKind::Send, Some(packet.acquire()), completion)
            .ok_or(EngineError::ConnectionClosed)
    }

    /// Queues a receive. The completion gets the next datagram not claimed by a
    /// higher priority receive, or `ConnectionClosed` if the socket is killed first.
    pub fn receive(self: &Self, completion: Completion, priority: Priority) -> EngineResult<RequestId> {
        self.core
            .scheduler
            .enqueue(priority, RequestKind::Receive, None, completion)
            .ok_or(EngineError::ConnectionClosed)
    }

    /// Sends at normal priority and blocks until the datagram is written or the
    /// wait time expires
    pub fn send_blocking(self: &Self, packet: &Packet, wait_time: WaitTime) -> (SendStatus, usize) {
        let event = CompletionEvent::new();
        let outcome = self
            .send(packet, Completion::Event(event.clone()), Priority::Normal)
            .ok()
            .and_then(|id| self.wait_for(&event, id, wait_time));

        match outcome {
            Some(IoOutcome::Sent { status, byte_count }) => (status, byte_count),
            Some(_) => (SendStatus::Failed, 0),
            None if self.is_connection_alive() => (SendStatus::TimedOut, 0),
            None => (SendStatus::Failed, 0),
        }
    }

    /// Receives at normal priority, blocking until a datagram arrives or the wait
    /// time expires
    pub fn receive_blocking(self: &Self, wait_time: WaitTime) -> (ReceiveStatus, Option<Packet>) {
        let event = CompletionEvent::new();
        let outcome = self
            .receive(Completion::Event(event.clone()), Priority::Normal)
            .ok()
            .and_then(|id| self.wait_for(&event, id, wait_time));

        match outcome {
            Some(IoOutcome::Received { status, packet }) => (status, packet),
            Some(_) => (ReceiveStatus::Failed, None),
            None if self.is_connection_alive() => (ReceiveStatus::TimedOut, None),
            None => (ReceiveStatus::ConnectionClosed, None),
        }
    }

    /// Entry point for received datagrams. Satisfies the highest priority waiting
    /// receive, or holds the packet for the next one. Returns false once the
    /// socket is dead.
    pub fn add_packet(self: &Self, packet: Packet) -> bool {
        self.core.scheduler.add_packet(packet)
    }

    /// Kills the socket now. Every pending request is failed and `on_disconnect`
    /// is called.
    pub fn kill_connection(self: &Self) {
        self.kill(true);
    }

    /// Queues a kill behind higher priority requests. The completion is signalled
    /// once the socket is dead.
    pub fn kill_connection_with(self: &Self, completion: Completion, priority: Priority) -> EngineResult<RequestId> {
        self.core
            .scheduler
            .enqueue(priority, RequestKind::Kill { notify: true }, None, completion)
            .ok_or(EngineError::ConnectionClosed)
    }

    pub(crate) fn kill_connection_no_callback(self: &Self) {
        self.kill(false);
    }

    /// Returns false when the socket was already dead
    fn kill(self: &Self, notify: bool) -> bool {
        let pending = {
            let _guard = self.core.lifecycle_lock.lock();
            if !self.core.alive.swap(false, Ordering::AcqRel) {
                return false;
            }
            self.core.stop_signal.stop();
            self.core.notifier.close();
            self.core.scheduler.close()
        };

        let pending_count = pending.len();
        drop(pending);
        if pending_count > 0 {
            info!("{}: Failed {pending_count} pending requests", self.core.name);
        }

        let threads: Vec<WorkerThread> = self
            .core
            .threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for thread in threads {
            thread.join(self.core.wait_time);
        }

        info!("{}: Killed", self.core.name);
        if notify {
            self.callback().on_disconnect(self);
        }
        true
    }

    /// Waits for a request this thread issued. On timeout the request is withdrawn,
    /// or abandoned when the scheduler is already running it so that its late
    /// resolution goes nowhere.
    fn wait_for(self: &Self, event: &CompletionEvent, id: RequestId, wait_time: WaitTime) -> Option<IoOutcome> {
        if let Some(outcome) = event.wait(wait_time) {
            return Some(outcome);
        }
        match self.core.scheduler.withdraw(id) {
            Some(request) => {
                request.disarm();
                None
            }
            None => event.abandon(),
        }
    }

    fn report_error(self: &Self, error: &EngineError) {
        if self.is_connection_alive() {
            self.callback().on_error(self, error);
        }
    }

    fn start_threads(self: &Self) -> std::io::Result<()> {
        let scheduler = self.clone();
        let scheduler_thread =
            WorkerThread::spawn(&format!("{}-scheduler", self.core.name), move || scheduler.run_scheduler())?;
        self.push_thread(scheduler_thread);

        let completion = self.clone();
        let completion_thread =
            WorkerThread::spawn(&format!("{}-completion", self.core.name), move || completion.run_completion())?;
        self.push_thread(completion_thread);
        Ok(())
    }

    fn push_thread(self: &Self, thread: WorkerThread) {
        self.core
            .threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(thread);
    }

    fn run_scheduler(self: &Self) {
        info!("{}: Scheduler thread started", self.core.name);
        while let Some(request) = self.core.scheduler.next() {
            self.execute(request);
        }
        info!("{}: Scheduler thread stopped", self.core.name);
    }

    fn execute(self: &Self, request: PendingRequest) {
        #[cfg(debug_assertions)]
        debug!(
            "{}: Executing {:?} request {} at {:?} priority",
            self.core.name,
            request.kind(),
            request.id(),
            request.priority()
        );

        match request.kind() {
            RequestKind::Send => {
                let result = match request.packet() {
                    Some(packet) => packet.with_payload(|payload| self.core.notifier.send(payload)),
                    None => Ok(0),
                };
                let outcome = match result {
                    Ok(byte_count) => IoOutcome::Sent {
                        status: SendStatus::Success,
                        byte_count,
                    },
                    Err(e) => {
                        let status = match EngineError::from_send(&e) {
                            EngineError::TimedOut => SendStatus::TimedOut,
                            error => {
                                warn!("{}: Failed to send datagram: {e}", self.core.name);
                                self.report_error(&error);
                                SendStatus::Failed
                            }
                        };
                        IoOutcome::Sent { status, byte_count: 0 }
                    }
                };
                request.resolve(outcome);
            }
            RequestKind::Receive => self.core.scheduler.park_or_complete_receive(request),
            RequestKind::Kill { notify } => {
                self.kill(notify);
                request.resolve(IoOutcome::Killed);
            }
        }
    }

    fn run_completion(self: &Self) {
        info!("{}: Completion thread started", self.core.name);
        while !self.core.stop_signal.is_stopped() {
            match self.core.notifier.poll_receive(POLL_INTERVAL, &self.core.buffer_pool) {
                Ok(Some(packet)) => {
                    self.add_packet(packet);
                }
                Ok(None) => {}
                Err(e) => {
                    if self.core.stop_signal.is_stopped() {
                        break;
                    }
                    let error = EngineError::from_receive(&e);
                    error!("{}: Failed to receive datagram: {e}", self.core.name);
                    self.report_error(&error);
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
        info!("{}: Completion thread stopped", self.core.name);
    }
}

/// Owner of a UDP endpoint. Dereferences to its `UdpConnection`. Dropping the
/// socket kills it without calling `on_disconnect`.
pub struct UdpSocket {
    connection: UdpConnection,
}

impl UdpSocket {
    /// Resolves the settings' host and port and connects a new datagram socket to it
    pub fn connect(settings: &EndpointSettings, callback: UdpCallback) -> EngineResult<Self> {
        Self::with_resolver(settings, callback, &SystemResolver)
    }

    pub fn with_resolver(
        settings: &EndpointSettings,
        callback: UdpCallback,
        resolver: &dyn AddressResolver,
    ) -> EngineResult<Self> {
        let addresses = resolver.resolve(&settings.host_name, &settings.port)?;
        let mut last_error = None;
        for address in addresses {
            match UdpNotifier::bind_connected(address) {
                Ok(notifier) => {
                    let name = format!("UdpSocket({address})");
                    return Self::with_notifier(name, Arc::new(notifier), settings, callback);
                }
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

    /// Adopts a datagram socket that is already bound and connected
    pub fn from_socket(socket: StdUdpSocket, settings: &EndpointSettings, callback: UdpCallback) -> EngineResult<Self> {
        let name = match socket.peer_addr() {
            Ok(peer) => format!("UdpSocket({peer})"),
            Err(_) => "UdpSocket".to_owned(),
        };
        Self::with_notifier(name, Arc::new(UdpNotifier::from_socket(socket)), settings, callback)
    }

    /// Runs the socket against any completion notifier
    pub fn with_notifier(
        name: String,
        notifier: Arc<dyn CompletionNotifier>,
        settings: &EndpointSettings,
        callback: UdpCallback,
    ) -> EngineResult<Self> {
        Ok(Self {
            connection: UdpConnection::open(name, notifier, settings, callback)?,
        })
    }

    pub fn connection(self: &Self) -> &UdpConnection {
        &self.connection
    }
}

impl Deref for UdpSocket {
    type Target = UdpConnection;

    fn deref(&self) -> &UdpConnection {
        &self.connection
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.connection.kill_connection_no_callback();
    }
}

