/*
How the result of a queued UDP request reaches the caller. A request carries
exactly one `Completion` and signals it exactly once, either when the
scheduler finishes the request or when the socket is killed.
*/
use log::error;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    time::Instant,
};

use super::processing_thread::panic_message;
use crate::{data_types::WaitTime, packet::Packet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    TimedOut,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveStatus {
    Success,
    TimedOut,
    Failed,
    ConnectionClosed,
}

/// The resolution of one request
#[derive(Debug)]
pub enum IoOutcome {
    Sent { status: SendStatus, byte_count: usize },
    Received { status: ReceiveStatus, packet: Option<Packet> },
    Killed,
}

/// Completion handler for queued requests. Methods run on the socket's scheduler
/// thread, or on whichever thread kills the socket.
pub trait IoCompletionCallback: Send + Sync {
    fn on_send_completed(&self, _status: SendStatus, _byte_count: usize) {}
    fn on_receive_completed(&self, _packet: Option<Packet>, _status: ReceiveStatus) {}
    fn on_kill_completed(&self) {}
}

#[derive(Default)]
struct EventSlot {
    outcome: Option<IoOutcome>,
    abandoned: bool,
}

/// A one-shot event that a caller can block on until a request resolves
#[derive(Clone, Default)]
pub struct CompletionEvent {
    inner: Arc<(Mutex<EventSlot>, Condvar)>,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the outcome and wakes waiters. Discarded once the event is abandoned.
    pub(crate) fn set(self: &Self, outcome: IoOutcome) {
        let (slot, signalled) = &*self.inner;
        let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.abandoned {
            return;
        }
        slot.outcome = Some(outcome);
        signalled.notify_all();
    }

    /// Gives up on the event. Returns an outcome that arrived before the call,
    /// otherwise every later outcome is dropped.
    pub(crate) fn abandon(self: &Self) -> Option<IoOutcome> {
        let (slot, _) = &*self.inner;
        let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.abandoned = true;
        slot.outcome.take()
    }

    pub fn is_set(self: &Self) -> bool {
        let (slot, _) = &*self.inner;
        slot.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .outcome
            .is_some()
    }

    /// Waits for the outcome and takes it. Returns `None` if the wait time expires
    /// first; the outcome can still be collected by a later wait.
    pub fn wait(self: &Self, wait_time: WaitTime) -> Option<IoOutcome> {
        let (slot, signalled) = &*self.inner;
        let start = Instant::now();
        let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(resolved) = slot.outcome.take() {
                return Some(resolved);
            }
            slot = match wait_time.remaining(start) {
                None => signalled.wait(slot).unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(remaining) if remaining.is_zero() => return None,
                Some(remaining) => {
                    signalled
                        .wait_timeout(slot, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }
}

/// Where a request's outcome is delivered
#[derive(Clone, Default)]
pub enum Completion {
    /// Fire and forget. A received packet is dropped.
    #[default]
    None,
    Event(CompletionEvent),
    Callback(Arc<dyn IoCompletionCallback>),
}

impl Completion {
    pub fn callback(callback: Arc<dyn IoCompletionCallback>) -> Self {
        Self::Callback(callback)
    }

    pub(crate) fn signal(self: Self, outcome: IoOutcome) {
        match self {
            Completion::None => {}
            Completion::Event(event) => event.set(outcome),
            Completion::Callback(callback) => {
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| match outcome {
                    IoOutcome::Sent { status, byte_count } => callback.on_send_completed(status, byte_count),
                    IoOutcome::Received { status, packet } => callback.on_receive_completed(packet, status),
                    IoOutcome::Killed => callback.on_kill_completed(),
                }));
                if let Err(panic) = delivered {
                    error!("Completion: Callback panicked: {}", panic_message(&panic));
                }
            }
        }
    }
}

impl From<CompletionEvent> for Completion {
    fn from(event: CompletionEvent) -> Self {
        Completion::Event(event)
    }
}
