use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{info, warn};
use std::{
    cell::Cell,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Instant,
};

#[cfg(debug_assertions)]
use log::debug;

use super::{
    lifecycle::{StopSignal, WorkerThread},
    processing_thread::ProcessingThread,
};
use crate::{
    data_types::{ProcessorCount, WaitTime},
    errors::{EngineError, EngineResult},
    packet::Packet,
};

/// Worker threads created for a pool with no processor limit never exceed this
pub const UNLIMITED_PROCESSOR_CEILING: usize = 256;

/// Handles packets on pool threads
pub trait PacketProcessor: Send + Sync {
    fn process(&self, packet: Packet);

    /// Called when `process` panicked
    fn on_failure(&self, error: EngineError);
}

pub(crate) struct Job {
    pub(crate) packet: Packet,
    pub(crate) processor: Arc<dyn PacketProcessor>,
}

pub(crate) struct PoolState {
    pub(crate) maximum: ProcessorCount,
    /// Jobs accepted by submit and not yet finished
    pub(crate) admitted: usize,
    pub(crate) busy: usize,
    pub(crate) peak_busy: usize,
    pub(crate) workers: usize,
    /// Workers waiting for a job that no submitter has claimed
    pub(crate) idle_workers: usize,
    pub(crate) accepting: bool,
}

pub(crate) struct PoolShared {
    pub(crate) name: String,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) slot_freed: Condvar,
    pub(crate) stop_signal: StopSignal,
}

thread_local! {
    // Identifies the pool whose callback this thread is currently running
    pub(crate) static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

impl PoolShared {
    pub(crate) fn lock(self: &Self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// A bounded set of worker threads that turn received packets into application
/// callbacks. At most `maximum` callbacks run at once; zero means no limit.
/// Workers are created on demand and retire after a period of idleness.
pub struct ProcessorPool {
    shared: Arc<PoolShared>,
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    next_worker_index: Mutex<usize>,
}

impl ProcessorPool {
    pub fn new(name: &str, maximum: ProcessorCount) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        Self {
            shared: Arc::new(PoolShared {
                name: name.to_owned(),
                state: Mutex::new(PoolState {
                    maximum,
                    admitted: 0,
                    busy: 0,
                    peak_busy: 0,
                    workers: 0,
                    idle_workers: 0,
                    accepting: true,
                }),
                slot_freed: Condvar::new(),
                stop_signal: StopSignal::new(),
            }),
            sender,
            receiver,
            next_worker_index: Mutex::new(0),
        }
    }

    /// Queues a packet for processing. Blocks while every slot is busy, for up to
    /// `wait_time`, then gives up with `PoolSaturated`. The packet is released
    /// if the call fails.
    pub fn submit(
        self: &Self,
        packet: Packet,
        processor: &Arc<dyn PacketProcessor>,
        wait_time: WaitTime,
    ) -> EngineResult<()> {
        let start = Instant::now();
        let mut state = self.shared.lock();
        loop {
            if !state.accepting {
                return Err(EngineError::ConnectionClosed);
            }
            if state.maximum == 0 || state.admitted < state.maximum {
                break;
            }
            state = match wait_time.remaining(start) {
                None => self
                    .shared
                    .slot_freed
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(remaining) if remaining.is_zero() => {
                    warn!(
                        "ProcessorPool {}: all {} processors busy, packet dropped",
                        self.shared.name, state.maximum
                    );
                    return Err(EngineError::PoolSaturated);
                }
                Some(remaining) => {
                    self.shared
                        .slot_freed
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }

        state.admitted += 1;
        let ceiling = if state.maximum == 0 {
            UNLIMITED_PROCESSOR_CEILING
        } else {
            state.maximum
        };
        let spawn_worker = if state.idle_workers > 0 {
            state.idle_workers -= 1;
            false
        } else if state.workers < ceiling {
            state.workers += 1;
            true
        } else {
            false
        };
        drop(state);

        if spawn_worker {
            if let Err(e) = self.spawn_worker() {
                let mut state = self.shared.lock();
                state.workers -= 1;
                if state.workers == 0 {
                    state.admitted -= 1;
                    self.shared.slot_freed.notify_all();
                    return Err(EngineError::Fatal {
                        msg: format!("Failed to start processor thread: {e}"),
                    });
                }
                warn!("ProcessorPool {}: Failed to add processor thread: {e}", self.shared.name);
            }
        }

        #[cfg(debug_assertions)]
        debug!("ProcessorPool {}: Queued {} byte packet", self.shared.name, packet.size());

        // The pool owns a receiver, so the channel cannot be disconnected here
        let _ = self.sender.send(Job {
            packet,
            processor: processor.clone(),
        });
        Ok(())
    }

    /// Changes the limit for future admissions. Callbacks already running are not affected.
    pub fn set_maximum_processor_count(self: &Self, maximum: ProcessorCount) {
        let mut state = self.shared.lock();
        state.maximum = maximum;
        self.shared.slot_freed.notify_all();
        info!("ProcessorPool {}: Maximum processor count set to {maximum}", self.shared.name);
    }

    pub fn maximum_processor_count(self: &Self) -> ProcessorCount {
        self.shared.lock().maximum
    }

    /// Number of callbacks running right now
    pub fn busy_count(self: &Self) -> usize {
        self.shared.lock().busy
    }

    /// Highest number of callbacks that ever ran at the same time
    pub fn peak_busy_count(self: &Self) -> usize {
        self.shared.lock().peak_busy
    }

    pub fn worker_count(self: &Self) -> usize {
        self.shared.lock().workers
    }

    pub fn is_accepting(self: &Self) -> bool {
        self.shared.lock().accepting
    }

    /// Stops accepting packets, discards queued ones and waits up to `wait_time` for
    /// running callbacks to return. Returns false when some were still running. When
    /// called from inside one of this pool's callbacks that callback is not waited for.
    pub fn stop(self: &Self, wait_time: WaitTime) -> bool {
        let start = Instant::now();
        let own_worker = CURRENT_POOL.with(|current| current.get() == self.shared.id()) as usize;

        let mut state = self.halt_locked();
        while state.workers > own_worker {
            state = match wait_time.remaining(start) {
                None => self
                    .shared
                    .slot_freed
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(remaining) if remaining.is_zero() => {
                    warn!(
                        "ProcessorPool {}: {} processors still busy after {:?}, they will exit when their callbacks return",
                        self.shared.name,
                        state.workers - own_worker,
                        wait_time.duration()
                    );
                    return false;
                }
                Some(remaining) => {
                    self.shared
                        .slot_freed
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
        true
    }

    /// Stops accepting packets. Packets already queued are still processed.
    pub fn close(self: &Self) {
        drop(self.close_locked());
    }

    /// Stops accepting packets and lets the workers finish the queued ones, waiting
    /// up to `wait_time` for them. Packets still queued when the wait expires are
    /// discarded and the workers are stopped as by `stop`. Called from one of this
    /// pool's callbacks it behaves like `stop`, since the queue may depend on the
    /// calling worker.
    pub fn drain(self: &Self, wait_time: WaitTime) -> bool {
        if CURRENT_POOL.with(|current| current.get() == self.shared.id()) {
            return self.stop(wait_time);
        }

        let start = Instant::now();
        let mut state = self.close_locked();
        while state.admitted > 0 {
            state = match wait_time.remaining(start) {
                None => self
                    .shared
                    .slot_freed
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(remaining) if remaining.is_zero() => {
                    warn!(
                        "ProcessorPool {}: {} packets still queued or running after {:?}",
                        self.shared.name,
                        state.admitted,
                        wait_time.duration()
                    );
                    break;
                }
                Some(remaining) => {
                    self.shared
                        .slot_freed
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
        drop(state);

        match wait_time.remaining(start) {
            None => self.stop(WaitTime::INFINITE),
            Some(remaining) => self.stop(WaitTime::from_duration(remaining)),
        }
    }

    /// Stops accepting packets and discards queued ones without waiting for running callbacks
    pub fn halt(self: &Self) {
        drop(self.halt_locked());
    }

    fn close_locked(self: &Self) -> MutexGuard<'_, PoolState> {
        let mut state = self.shared.lock();
        if state.accepting {
            info!("ProcessorPool {}: Closed to new packets", self.shared.name);
        }
        state.accepting = false;
        // Wakes submitters blocked on a full pool
        self.shared.slot_freed.notify_all();
        state
    }

    fn halt_locked(self: &Self) -> MutexGuard<'_, PoolState> {
        let mut state = self.close_locked();
        if !self.shared.stop_signal.is_stopped() {
            info!("ProcessorPool {}: Stopping", self.shared.name);
        }
        self.shared.stop_signal.stop();

        while let Ok(job) = self.receiver.try_recv() {
            state.admitted -= 1;
            drop(job);
        }
        self.shared.slot_freed.notify_all();
        state
    }

    fn spawn_worker(self: &Self) -> std::io::Result<()> {
        let index = {
            let mut next = self
                .next_worker_index
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *next += 1;
            *next
        };
        let thread = ProcessingThread::new(&self.shared, &self.receiver);
        let name = format!("{}-processor-{index}", self.shared.name);

        // Workers report their own exit through the pool state, so the handle is not kept
        WorkerThread::spawn(&name, move || thread.run()).map(|_| ())
    }
}

impl Drop for ProcessorPool {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    struct CountingProcessor {
        processed: AtomicUsize,
        failures: AtomicUsize,
        delay: Duration,
    }

    impl CountingProcessor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                processed: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
                delay,
            })
        }
    }

    impl PacketProcessor for CountingProcessor {
        fn process(&self, packet: Packet) {
            if packet.to_vec() == b"panic" {
                panic!("processor asked to panic");
            }
            thread::sleep(self.delay);
            self.processed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _error: EngineError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(condition());
    }

    #[test]
    fn should_process_every_packet() {
        let pool = ProcessorPool::new("test", 0);
        let counter = CountingProcessor::new(Duration::ZERO);
        let processor: Arc<dyn PacketProcessor> = counter.clone();

        for _ in 0..100 {
            pool.submit(Packet::from("x"), &processor, WaitTime::INFINITE).unwrap();
        }

        wait_for(|| counter.processed.load(Ordering::SeqCst) == 100);
        assert!(pool.worker_count() <= UNLIMITED_PROCESSOR_CEILING);
    }

    #[test]
    fn should_release_packet_after_processing() {
        let pool = ProcessorPool::new("release", 1);
        let counter = CountingProcessor::new(Duration::ZERO);
        let processor: Arc<dyn PacketProcessor> = counter.clone();

        let packet = Packet::from("data");
        pool.submit(packet.acquire(), &processor, WaitTime::INFINITE).unwrap();

        wait_for(|| counter.processed.load(Ordering::SeqCst) == 1);
        wait_for(|| packet.ref_count() == 1);
    }

    #[test]
    fn should_recover_from_panicking_callback() {
        let pool = ProcessorPool::new("panics", 1);
        let counter = CountingProcessor::new(Duration::ZERO);
        let processor: Arc<dyn PacketProcessor> = counter.clone();

        pool.submit(Packet::from("panic"), &processor, WaitTime::INFINITE).unwrap();
        pool.submit(Packet::from("fine"), &processor, WaitTime::INFINITE).unwrap();

        wait_for(|| counter.processed.load(Ordering::SeqCst) == 1);
        assert_eq!(counter.failures.load(Ordering::SeqCst), 1);
        assert!(pool.is_accepting());
    }

    #[test]
    fn should_reject_when_saturated_past_wait_time() {
        let pool = ProcessorPool::new("saturated", 1);
        let counter = CountingProcessor::new(Duration::from_millis(300));
        let processor: Arc<dyn PacketProcessor> = counter.clone();

        pool.submit(Packet::from("slow"), &processor, WaitTime::INFINITE).unwrap();
        let start = Instant::now();
        let result = pool.submit(Packet::from("late"), &processor, WaitTime::from_millis(30));

        assert_eq!(result, Err(EngineError::PoolSaturated));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn should_admit_more_after_raising_maximum() {
        let pool = ProcessorPool::new("raise", 1);
        let counter = CountingProcessor::new(Duration::from_millis(200));
        let processor: Arc<dyn PacketProcessor> = counter.clone();

        pool.submit(Packet::from("a"), &processor, WaitTime::INFINITE).unwrap();
        pool.set_maximum_processor_count(2);
        pool.submit(Packet::from("b"), &processor, WaitTime::from_millis(0)).unwrap();

        assert_eq!(pool.maximum_processor_count(), 2);
        wait_for(|| counter.processed.load(Ordering::SeqCst) == 2);
    }

    #[test]
    fn should_finish_queued_packets_when_drained() {
        let pool = ProcessorPool::new("drained", 0);
        let counter = CountingProcessor::new(Duration::from_millis(2));
        let processor: Arc<dyn PacketProcessor> = counter.clone();

        for _ in 0..300 {
            pool.submit(Packet::from("x"), &processor, WaitTime::INFINITE).unwrap();
        }
        assert!(pool.drain(WaitTime::from_millis(5000)));

        assert_eq!(counter.processed.load(Ordering::SeqCst), 300);
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(
            pool.submit(Packet::from("late"), &processor, WaitTime::INFINITE),
            Err(EngineError::ConnectionClosed)
        );
    }

    #[test]
    fn should_release_blocked_submitter_when_closed() {
        let pool = Arc::new(ProcessorPool::new("closed", 1));
        let counter = CountingProcessor::new(Duration::from_millis(200));
        let processor: Arc<dyn PacketProcessor> = counter.clone();
        pool.submit(Packet::from("slow"), &processor, WaitTime::INFINITE).unwrap();

        let submitter = {
            let pool = pool.clone();
            let processor = processor.clone();
            thread::spawn(move || pool.submit(Packet::from("blocked"), &processor, WaitTime::INFINITE))
        };
        thread::sleep(Duration::from_millis(20));
        pool.close();

        assert_eq!(submitter.join().unwrap(), Err(EngineError::ConnectionClosed));
        wait_for(|| counter.processed.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn should_refuse_packets_after_stop() {
        let pool = ProcessorPool::new("stopped", 2);
        let counter = CountingProcessor::new(Duration::from_millis(50));
        let processor: Arc<dyn PacketProcessor> = counter.clone();

        pool.submit(Packet::from("in flight"), &processor, WaitTime::INFINITE).unwrap();
        assert!(pool.stop(WaitTime::INFINITE));
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(
            pool.submit(Packet::from("late"), &processor, WaitTime::INFINITE),
            Err(EngineError::ConnectionClosed)
        );
    }
}
