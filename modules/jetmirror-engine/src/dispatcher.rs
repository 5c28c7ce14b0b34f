//! Key-ordered dispatch over a bounded worker pool.
//!
//! Each key with pending work has exactly one worker draining its FIFO queue,
//! so events for the same key never apply concurrently and apply in arrival
//! order. Different keys proceed in parallel up to `worker_slots`.
//!
//! A worker holds one semaphore permit for as long as its key has work. When
//! every slot is busy, dispatching an event for a *new* key waits for a slot;
//! that wait is the backpressure felt by the feed reader. Events for a key
//! that already has a worker are queued without waiting, up to
//! `max_queue_depth`.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::error;

use jetmirror_events::{CommitEvent, Position, RecordKey};

use crate::apply::Applier;
use crate::config::EngineConfig;
use crate::counters::EngineCounters;
use crate::error::DispatchError;
use crate::watermark::LowWaterMark;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub worker_slots: usize,
    /// Events allowed to wait behind the one currently applying, per key.
    pub max_queue_depth: usize,
}

impl From<&EngineConfig> for DispatcherConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            worker_slots: config.worker_slots,
            max_queue_depth: config.max_queue_depth,
        }
    }
}

pub struct KeyOrderedDispatcher<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for KeyOrderedDispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<A> {
    applier: A,
    counters: Arc<EngineCounters>,
    config: DispatcherConfig,
    slots: Arc<Semaphore>,
    /// Queues and watermark share one lock: an event's registration in the
    /// watermark and its place in a queue must change together.
    state: Mutex<DispatchState>,
    idle: Notify,
}

#[derive(Default)]
struct DispatchState {
    /// Present while the key has an active worker. Holds the events waiting
    /// behind the one being applied; may be empty.
    queues: HashMap<RecordKey, VecDeque<CommitEvent>>,
    watermark: LowWaterMark,
}

enum Admission {
    Queued,
    Overflow(DispatchError),
    NoWorker(CommitEvent),
}

impl<A: Applier> KeyOrderedDispatcher<A> {
    pub fn new(applier: A, counters: Arc<EngineCounters>, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                applier,
                counters,
                slots: Arc::new(Semaphore::new(config.worker_slots)),
                config,
                state: Mutex::new(DispatchState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Hand an event to its key's worker, starting one if needed.
    ///
    /// Returns once the event is queued. Waits only when the key has no
    /// worker and every slot is taken. On overflow the event is dropped,
    /// counted, and treated as complete for cursor purposes.
    pub async fn dispatch(&self, event: CommitEvent) -> Result<(), DispatchError> {
        let event = match self.inner.admit_to_existing(event) {
            Admission::Queued => return Ok(()),
            Admission::Overflow(e) => return Err(e),
            Admission::NoWorker(event) => event,
        };

        let position = event.position;
        let Ok(permit) = self.inner.slots.clone().acquire_owned().await else {
            return Err(DispatchError::Closed(position));
        };

        // A worker for this key may have started while we waited.
        let event = match self.inner.admit_to_existing(event) {
            Admission::Queued => return Ok(()),
            Admission::Overflow(e) => return Err(e),
            Admission::NoWorker(event) => event,
        };

        {
            let mut state = self.inner.lock_state();
            state.watermark.begin(event.position);
            state.queues.insert(event.key.clone(), VecDeque::new());
        }
        tokio::spawn(self.inner.clone().run_worker(event, permit));
        Ok(())
    }

    /// Record a position that completed on receipt (ignored or undecodable).
    pub fn observe(&self, position: Position) {
        self.inner.lock_state().watermark.observe(position);
    }

    /// Keep the cursor at or below `position` for an event that was read but
    /// never accepted. Nothing completes it.
    pub fn hold(&self, position: Position) {
        self.inner.lock_state().watermark.begin(position);
    }

    pub fn raise_floor(&self, floor: Position) {
        self.inner.lock_state().watermark.raise_floor(floor);
    }

    /// The position it is safe to resume from right now.
    pub fn low_water_mark(&self) -> Option<Position> {
        self.inner.lock_state().watermark.cursor()
    }

    /// Keys with an active worker.
    pub fn active_keys(&self) -> usize {
        self.inner.lock_state().queues.len()
    }

    /// Events accepted but not yet complete, across all keys.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_state().watermark.in_flight()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock_state().queues.is_empty()
    }

    /// Resolves once every accepted event has completed.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.inner.idle.notified());
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work. Pending `dispatch` calls waiting for a slot fail
    /// with `DispatchError::Closed`; active workers finish their queues.
    pub fn close(&self) {
        self.inner.slots.close();
    }
}

impl<A: Applier> Inner<A> {
    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit_to_existing(&self, event: CommitEvent) -> Admission {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(queue) = state.queues.get_mut(&event.key) else {
            return Admission::NoWorker(event);
        };

        if queue.len() >= self.config.max_queue_depth {
            state.watermark.observe(event.position);
            self.counters.record_overflow();
            return Admission::Overflow(DispatchError::QueueOverflow {
                key: event.key,
                position: event.position,
                depth: queue.len(),
            });
        }

        state.watermark.begin(event.position);
        queue.push_back(event);
        Admission::Queued
    }

    /// Apply `first`, then everything queued behind it for the same key,
    /// releasing the slot only when the queue is empty.
    async fn run_worker(self: Arc<Self>, first: CommitEvent, _permit: OwnedSemaphorePermit) {
        let key = first.key.clone();
        let mut next = Some(first);

        while let Some(event) = next {
            let applied = AssertUnwindSafe(self.applier.apply_event(&event))
                .catch_unwind()
                .await;
            if applied.is_err() {
                self.counters.record_failed();
                error!(
                    key = %event.key,
                    position = %event.position,
                    "Apply panicked; event treated as failed"
                );
            }

            let mut guard = self.lock_state();
            let state = &mut *guard;
            state.watermark.complete(event.position);
            next = state.queues.get_mut(&key).and_then(VecDeque::pop_front);
            if next.is_none() {
                state.queues.remove(&key);
                if state.queues.is_empty() {
                    self.idle.notify_waiters();
                }
            }
        }
    }
}
