use core::time::Duration;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{error, info};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use super::processor_pool::{Job, PoolShared, CURRENT_POOL};
use crate::errors::EngineError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RETIRE_AFTER_IDLE: Duration = Duration::from_secs(5);

/// One worker of a processor pool. Takes jobs from the pool's queue until the
/// pool stops or it has been idle long enough to retire.
pub(crate) struct ProcessingThread {
    shared: Arc<PoolShared>,
    receiver: Receiver<Job>,
}

impl ProcessingThread {
    pub(crate) fn new(shared: &Arc<PoolShared>, receiver: &Receiver<Job>) -> Self {
        Self {
            shared: shared.clone(),
            receiver: receiver.clone(),
        }
    }

    pub(crate) fn run(self: Self) {
        info!("ProcessingThread {}: Starting", self.shared.name);
        let mut idle_since = Instant::now();

        loop {
            if self.shared.stop_signal.is_stopped() {
                break;
            }
            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(job) => {
                    if self.shared.stop_signal.is_stopped() {
                        self.discard(job);
                        break;
                    }
                    self.process(job);
                    idle_since = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if idle_since.elapsed() > RETIRE_AFTER_IDLE && self.try_retire() {
                        info!("ProcessingThread {}: Retiring after idle period", self.shared.name);
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut state = self.shared.lock();
        state.workers -= 1;
        self.shared.slot_freed.notify_all();
        info!("ProcessingThread {}: Stopping", self.shared.name);
    }

    fn process(self: &Self, job: Job) {
        {
            let mut state = self.shared.lock();
            state.busy += 1;
            state.peak_busy = state.peak_busy.max(state.busy);
        }

        CURRENT_POOL.with(|current| current.set(self.shared.id()));
        let Job { packet, processor } = job;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(packet)));
        CURRENT_POOL.with(|current| current.set(0));

        if let Err(panic) = outcome {
            let msg = panic_message(&panic);
            error!("ProcessingThread {}: Callback panicked: {msg}", self.shared.name);
            let report = panic::catch_unwind(AssertUnwindSafe(|| {
                processor.on_failure(EngineError::CallbackFailed { msg })
            }));
            if report.is_err() {
                error!("ProcessingThread {}: Error callback panicked", self.shared.name);
            }
        }

        let mut state = self.shared.lock();
        state.busy -= 1;
        state.admitted -= 1;
        state.idle_workers += 1;
        self.shared.slot_freed.notify_all();
    }

    fn discard(self: &Self, job: Job) {
        let mut state = self.shared.lock();
        state.admitted -= 1;
        drop(job);
        self.shared.slot_freed.notify_all();
    }

    // Only an unclaimed worker may leave, otherwise a queued job could lose its worker
    fn try_retire(self: &Self) -> bool {
        let mut state = self.shared.lock();
        if state.idle_workers > 0 && self.receiver.is_empty() {
            state.idle_workers -= 1;
            state.workers -= 1;
            self.shared.slot_freed.notify_all();
            true
        } else {
            false
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
