/*
Cooperative shutdown for the threads an endpoint owns. Threads poll a shared
stop signal and their owner waits for them with a time limit. A thread that
outlives the wait keeps only reference counted state alive and exits on its
own once its current callback returns.
*/
use log::{info, warn};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
};

use crate::data_types::WaitTime;

#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(self: &Self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(self: &Self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A named thread that can be joined with a time limit
pub struct WorkerThread {
    name: String,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl WorkerThread {
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        // The sender is dropped when the body returns or unwinds
        let (done_sender, done) = channel::<()>();
        let handle = thread::Builder::new().name(name.to_owned()).spawn(move || {
            let _done_sender = done_sender;
            body();
        })?;

        Ok(Self {
            name: name.to_owned(),
            thread_id: handle.thread().id(),
            handle: Some(handle),
            done,
        })
    }

    pub fn name(self: &Self) -> &str {
        &self.name
    }

    pub fn is_current(self: &Self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Waits for the thread to finish. Returns false when the wait time expired first,
    /// or when called from the thread itself.
    pub fn join(mut self: Self, wait_time: WaitTime) -> bool {
        if self.is_current() {
            return false;
        }

        let finished = match wait_time.duration() {
            None => {
                let _ = self.done.recv();
                true
            }
            Some(limit) => matches!(
                self.done.recv_timeout(limit),
                Err(RecvTimeoutError::Disconnected) | Ok(())
            ),
        };

        if finished {
            if let Some(handle) = self.handle.take() {
                if handle.join().is_err() {
                    warn!("WorkerThread: {} panicked", self.name);
                }
            }
            info!("WorkerThread: {} joined", self.name);
        } else {
            warn!(
                "WorkerThread: {} still running after {:?}, it will exit when it next checks its stop signal",
                self.name,
                wait_time.duration()
            );
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn should_join_finished_thread() {
        let stop_signal = StopSignal::new();
        let signal = stop_signal.clone();
        let thread = WorkerThread::spawn("test-worker", move || {
            while !signal.is_stopped() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        stop_signal.stop();
        assert!(thread.join(WaitTime::INFINITE));
    }

    #[test]
    fn should_give_up_after_wait_time() {
        let stop_signal = StopSignal::new();
        let signal = stop_signal.clone();
        let thread = WorkerThread::spawn("slow-worker", move || {
            while !signal.is_stopped() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        let start = Instant::now();
        assert!(!thread.join(WaitTime::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        stop_signal.stop();
    }

    #[test]
    fn should_survive_panicking_body() {
        let thread = WorkerThread::spawn("panicking-worker", || panic!("boom")).unwrap();
        assert!(thread.join(WaitTime::from_millis(1000)));
    }
}
