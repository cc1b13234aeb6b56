/*
Queue of outstanding UDP requests. Sends, receives and queued kills wait in a
strict priority queue until the scheduler thread takes them. A receive taken
by the scheduler parks until a datagram arrives. Every request is resolved
exactly once: by the scheduler, by a blocking caller withdrawing it, or with
a failure status when the queue is closed or the request is dropped.
*/
#[cfg(debug_assertions)]
use log::debug;
use log::warn;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard,
    },
};

use super::{
    completion::{Completion, IoOutcome, ReceiveStatus, SendStatus},
    priority_queue::{Priority, PriorityQueue},
};
use crate::packet::Packet;

/// Datagrams received while no receive is parked are held up to this limit,
/// after which the oldest is discarded
pub const MAX_UNCLAIMED_PACKETS: usize = 1024;

pub type RequestId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Send,
    Receive,
    Kill { notify: bool },
}

pub(crate) struct PendingRequest {
    id: RequestId,
    priority: Priority,
    kind: RequestKind,
    packet: Option<Packet>,
    completion: Option<Completion>,
}

impl PendingRequest {
    pub(crate) fn id(self: &Self) -> RequestId {
        self.id
    }

    pub(crate) fn priority(self: &Self) -> Priority {
        self.priority
    }

    pub(crate) fn kind(self: &Self) -> RequestKind {
        self.kind
    }

    pub(crate) fn packet(self: &Self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    pub(crate) fn resolve(mut self: Self, outcome: IoOutcome) {
        if let Some(completion) = self.completion.take() {
            completion.signal(outcome);
        }
    }

    /// Marks the request as resolved by its caller so dropping it signals nothing
    pub(crate) fn disarm(mut self: Self) {
        self.completion = None;
    }

    fn failure(self: &Self) -> IoOutcome {
        match self.kind {
            RequestKind::Send => IoOutcome::Sent {
                status: SendStatus::Failed,
                byte_count: 0,
            },
            RequestKind::Receive => IoOutcome::Received {
                status: ReceiveStatus::ConnectionClosed,
                packet: None,
            },
            RequestKind::Kill { .. } => IoOutcome::Killed,
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.signal(self.failure());
        }
    }
}

struct SchedulerState {
    alive: bool,
    requests: PriorityQueue<PendingRequest>,
    parked_receives: PriorityQueue<PendingRequest>,
    unclaimed: VecDeque<Packet>,
}

pub(crate) struct IoScheduler {
    name: String,
    state: Mutex<SchedulerState>,
    work_ready: Condvar,
    next_id: AtomicU64,
}

impl IoScheduler {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: Mutex::new(SchedulerState {
                alive: true,
                requests: PriorityQueue::new(),
                parked_receives: PriorityQueue::new(),
                unclaimed: VecDeque::new(),
            }),
            work_ready: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Queues a request. Once the scheduler is closed the request is failed
    /// immediately and `None` is returned.
    pub(crate) fn enqueue(
        self: &Self,
        priority: Priority,
        kind: RequestKind,
        packet: Option<Packet>,
        completion: Completion,
    ) -> Option<RequestId> {
        let request = PendingRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            priority,
            kind,
            packet,
            completion: Some(completion),
        };
        let id = request.id;

        let mut state = self.lock();
        if !state.alive {
            drop(state);
            #[cfg(debug_assertions)]
            debug!("{}: Rejected {kind:?} request on closed socket", self.name);
            drop(request);
            return None;
        }
        state.requests.push(priority, request);
        drop(state);

        self.work_ready.notify_one();
        Some(id)
    }

    /// Blocks until a request is queued. Returns `None` once the scheduler closes.
    pub(crate) fn next(self: &Self) -> Option<PendingRequest> {
        let mut state = self.lock();
        loop {
            if !state.alive {
                return None;
            }
            if let Some(request) = state.requests.pop() {
                return Some(request);
            }
            state = self
                .work_ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Completes a receive from the oldest unclaimed datagram, or parks it until
    /// one arrives
    pub(crate) fn park_or_complete_receive(self: &Self, request: PendingRequest) {
        let mut state = self.lock();
        if !state.alive {
            drop(state);
            drop(request);
            return;
        }
        match state.unclaimed.pop_front() {
            Some(packet) => {
                drop(state);
                request.resolve(IoOutcome::Received {
                    status: ReceiveStatus::Success,
                    packet: Some(packet),
                });
            }
            None => {
                let priority = request.priority();
                state.parked_receives.push(priority, request);
            }
        }
    }

    /// Hands a datagram to the highest priority parked receive. Returns false when
    /// the scheduler is closed and the packet was discarded.
    pub(crate) fn add_packet(self: &Self, packet: Packet) -> bool {
        let mut state = self.lock();
        if !state.alive {
            return false;
        }
        match state.parked_receives.pop() {
            Some(request) => {
                drop(state);
                request.resolve(IoOutcome::Received {
                    status: ReceiveStatus::Success,
                    packet: Some(packet),
                });
            }
            None => {
                if state.unclaimed.len() >= MAX_UNCLAIMED_PACKETS {
                    state.unclaimed.pop_front();
                    warn!("{}: No receive pending, discarded oldest unclaimed datagram", self.name);
                }
                state.unclaimed.push_back(packet);
            }
        }
        true
    }

    /// Takes a request back before it is resolved
    pub(crate) fn withdraw(self: &Self, id: RequestId) -> Option<PendingRequest> {
        let mut state = self.lock();
        match state.requests.remove_where(|request| request.id == id) {
            Some(request) => Some(request),
            None => state.parked_receives.remove_where(|request| request.id == id),
        }
    }

    /// Stops accepting requests and returns everything still outstanding, queued
    /// requests ahead of parked receives. Unclaimed datagrams are released.
    pub(crate) fn close(self: &Self) -> Vec<PendingRequest> {
        let mut state = self.lock();
        state.alive = false;
        let mut pending = state.requests.drain();
        pending.append(&mut state.parked_receives.drain());
        state.unclaimed.clear();
        drop(state);

        self.work_ready.notify_all();
        pending
    }

    pub(crate) fn pending_count(self: &Self) -> usize {
        let state = self.lock();
        state.requests.len() + state.parked_receives.len()
    }

    pub(crate) fn unclaimed_count(self: &Self) -> usize {
        self.lock().unclaimed.len()
    }

    fn lock(self: &Self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data_types::WaitTime, sockets::completion::CompletionEvent};

    fn event_request(scheduler: &IoScheduler, priority: Priority, kind: RequestKind) -> (RequestId, CompletionEvent) {
        let event = CompletionEvent::new();
        let packet = match kind {
            RequestKind::Send => Some(Packet::from("data")),
            _ => None,
        };
        let id = scheduler
            .enqueue(priority, kind, packet, Completion::Event(event.clone()))
            .unwrap();
        (id, event)
    }

    #[test]
    fn should_hand_out_requests_by_priority() {
        let scheduler = IoScheduler::new("test");
        let (low, _) = event_request(&scheduler, Priority::Low, RequestKind::Send);
        let (normal, _) = event_request(&scheduler, Priority::Normal, RequestKind::Send);
        let (high, _) = event_request(&scheduler, Priority::High, RequestKind::Send);

        let order: Vec<RequestId> = (0..3).map(|_| scheduler.next().unwrap().disarmed_id()).collect();
        assert_eq!(order, vec![high, normal, low]);
    }

    #[test]
    fn should_deliver_unclaimed_packet_to_next_receive() {
        let scheduler = IoScheduler::new("test");
        assert!(scheduler.add_packet(Packet::from("early")));
        assert_eq!(scheduler.unclaimed_count(), 1);

        let (_, event) = event_request(&scheduler, Priority::Normal, RequestKind::Receive);
        let request = scheduler.next().unwrap();
        scheduler.park_or_complete_receive(request);

        match event.wait(WaitTime::from_millis(1000)) {
            Some(IoOutcome::Received { status, packet }) => {
                assert_eq!(status, ReceiveStatus::Success);
                assert_eq!(packet.unwrap().to_vec(), b"early".to_vec());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn should_satisfy_highest_parked_receive_first() {
        let scheduler = IoScheduler::new("test");
        let (_, low) = event_request(&scheduler, Priority::Low, RequestKind::Receive);
        let (_, high) = event_request(&scheduler, Priority::High, RequestKind::Receive);
        for _ in 0..2 {
            let request = scheduler.next().unwrap();
            scheduler.park_or_complete_receive(request);
        }

        scheduler.add_packet(Packet::from("one"));
        assert!(high.is_set());
        assert!(!low.is_set());
    }

    #[test]
    fn should_fail_everything_on_close() {
        let scheduler = IoScheduler::new("test");
        let (_, send) = event_request(&scheduler, Priority::Normal, RequestKind::Send);
        let (_, receive) = event_request(&scheduler, Priority::High, RequestKind::Receive);
        let request = scheduler.next().unwrap();
        scheduler.park_or_complete_receive(request);

        let pending = scheduler.close();
        assert_eq!(pending.len(), 2);
        drop(pending);

        assert!(matches!(
            send.wait(WaitTime::from_millis(0)),
            Some(IoOutcome::Sent { status: SendStatus::Failed, .. })
        ));
        assert!(matches!(
            receive.wait(WaitTime::from_millis(0)),
            Some(IoOutcome::Received { status: ReceiveStatus::ConnectionClosed, packet: None })
        ));
        assert!(scheduler.next().is_none());
    }

    #[test]
    fn should_reject_requests_after_close() {
        let scheduler = IoScheduler::new("test");
        scheduler.close();

        let event = CompletionEvent::new();
        let id = scheduler.enqueue(
            Priority::High,
            RequestKind::Receive,
            None,
            Completion::Event(event.clone()),
        );
        assert!(id.is_none());
        assert!(event.is_set());
        assert!(!scheduler.add_packet(Packet::from("late")));
    }

    #[test]
    fn should_withdraw_without_signalling() {
        let scheduler = IoScheduler::new("test");
        let (id, event) = event_request(&scheduler, Priority::Normal, RequestKind::Receive);

        let request = scheduler.withdraw(id).unwrap();
        request.disarm();
        assert!(!event.is_set());
        assert_eq!(scheduler.pending_count(), 0);
        assert!(scheduler.withdraw(id).is_none());
    }

    impl PendingRequest {
        fn disarmed_id(self: Self) -> RequestId {
            let id = self.id();
            self.disarm();
            id
        }
    }
}
