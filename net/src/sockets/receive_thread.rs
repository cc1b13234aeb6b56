use log::{error, info, warn};
use std::{
    net::TcpStream,
    panic::{self, AssertUnwindSafe},
    sync::{mpsc::Receiver, Arc},
};

use super::{
    framing::read_frame,
    lifecycle::StopSignal,
    processing_thread::panic_message,
    processor_pool::{PacketProcessor, ProcessorPool},
    tcp_connection::{TcpConnection, Teardown},
};
use crate::{data_types::WaitTime, errors::EngineError, packet::Packet};

/// Delivers packets from one connection to its callback
struct ReceiveDispatcher {
    connection: TcpConnection,
}

impl PacketProcessor for ReceiveDispatcher {
    fn process(&self, packet: Packet) {
        self.connection.callback().on_receive(&self.connection, packet);
    }

    fn on_failure(&self, error: EngineError) {
        self.connection.report_error(&error);
    }
}

/// A thread that reads frames from a Tcp stream in wire order. In asynchronous
/// mode each frame is handed to the processor pool, otherwise the callback runs
/// on this thread before the next frame is read.
pub(crate) struct ReceiveThread {
    connection: TcpConnection,
    stream: TcpStream,
    pool: Arc<ProcessorPool>,
    dispatcher: Arc<dyn PacketProcessor>,
    stop_signal: StopSignal,
    asynchronous_receive: bool,
    wait_time: WaitTime,
    start_gate: Receiver<()>,
}

impl ReceiveThread {
    pub(crate) fn new(
        connection: &TcpConnection,
        stream: TcpStream,
        pool: &Arc<ProcessorPool>,
        stop_signal: &StopSignal,
        asynchronous_receive: bool,
        wait_time: WaitTime,
        start_gate: Receiver<()>,
    ) -> Self {
        Self {
            connection: connection.clone(),
            stream,
            pool: pool.clone(),
            dispatcher: Arc::new(ReceiveDispatcher {
                connection: connection.clone(),
            }),
            stop_signal: stop_signal.clone(),
            asynchronous_receive,
            wait_time,
            start_gate,
        }
    }

    pub(crate) fn run(mut self: Self) {
        // Released once on_connect has returned. The sender is dropped rather than
        // sent on, so the disconnected error is the expected wake-up.
        let _ = self.start_gate.recv();

        let name = self.connection.name();
        info!("{name}: Receive thread started");
        let buffer_pool = self.connection.buffer_pool().clone();

        while !self.stop_signal.is_stopped() {
            match read_frame(&mut self.stream, &buffer_pool) {
                Ok(packet) => self.dispatch(packet),
                Err(err) => {
                    if self.stop_signal.is_stopped() {
                        break;
                    }
                    match EngineError::from_receive(&err) {
                        EngineError::ConnectionClosed => {
                            info!("{name}: Connection closed by peer");
                            self.connection.teardown(Teardown::Graceful, true);
                        }
                        error => {
                            error!("{name}: Failed to read from Tcp stream: {err}");
                            self.connection.report_error(&error);
                            self.connection.teardown(Teardown::Kill, true);
                        }
                    }
                    break;
                }
            }
        }
        info!("{name}: Receive thread stopped");
    }

    fn dispatch(self: &Self, packet: Packet) {
        if self.asynchronous_receive {
            match self.pool.submit(packet, &self.dispatcher, self.wait_time) {
                Ok(()) => {}
                Err(EngineError::ConnectionClosed) => {}
                Err(error) => {
                    warn!("{}: Dropped received packet: {error}", self.connection.name());
                    self.connection.report_error(&error);
                }
            }
        } else {
            let dispatcher = &self.dispatcher;
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.process(packet))) {
                let msg = panic_message(&panic);
                error!("{}: Callback panicked: {msg}", self.connection.name());
                dispatcher.on_failure(EngineError::CallbackFailed { msg });
            }
        }
    }
}
