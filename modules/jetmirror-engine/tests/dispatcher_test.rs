//! KeyOrderedDispatcher: per-key ordering and exclusivity, the worker-slot
//! bound, backpressure, overflow, and convergence of a reordered, duplicated
//! feed through the real ApplyEngine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jetmirror_engine::{
    Applier, ApplyEngine, ApplyError, ApplyOutcome, DispatchError, DispatcherConfig,
    EngineCounters, KeyOrderedDispatcher, RetryPolicy,
};
use jetmirror_events::{CommitEvent, Operation, Position, RecordKey};
use jetmirror_store::{MemoryRecordStore, RecordStore, WriteOutcome};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::Semaphore;

// =========================================================================
// Recording applier
// =========================================================================

/// Records apply order per key and detects overlapping applies. Applies
/// block on `gate` until the test hands out permits.
struct Recorder {
    log: Mutex<Vec<(RecordKey, Position)>>,
    active: Mutex<HashSet<RecordKey>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    overlapped: AtomicBool,
    gate: Semaphore,
    delay: Duration,
}

impl Recorder {
    fn open(delay: Duration) -> Arc<Self> {
        Self::build(Semaphore::MAX_PERMITS, delay)
    }

    fn gated() -> Arc<Self> {
        Self::build(0, Duration::ZERO)
    }

    fn build(permits: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            active: Mutex::new(HashSet::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            gate: Semaphore::new(permits),
            delay,
        })
    }

    fn release(&self) {
        self.gate.add_permits(10_000);
    }

    fn order_for(&self, key: &RecordKey) -> Vec<i64> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, p)| p.as_i64())
            .collect()
    }
}

#[async_trait]
impl Applier for Recorder {
    async fn apply_event(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        if !self.active.lock().unwrap().insert(event.key.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        self.gate.acquire().await.unwrap().forget();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.active.lock().unwrap().remove(&event.key);
        self.log.lock().unwrap().push((event.key.clone(), event.position));
        Ok(ApplyOutcome::Applied {
            key: event.key.clone(),
            position: event.position,
            effect: WriteOutcome::Inserted,
        })
    }
}

fn key(n: usize) -> RecordKey {
    RecordKey::new(format!("did:plc:{n}"), "app.bsky.feed.like", "self")
}

fn ev(n: usize, pos: i64) -> CommitEvent {
    CommitEvent::create(key(n), pos, format!("cid-{pos}"), json!({ "n": n }))
}

fn dispatcher<A: Applier>(
    applier: A,
    worker_slots: usize,
    max_queue_depth: usize,
) -> (KeyOrderedDispatcher<A>, Arc<EngineCounters>) {
    let counters = Arc::new(EngineCounters::new());
    let config = DispatcherConfig { worker_slots, max_queue_depth };
    (KeyOrderedDispatcher::new(applier, counters.clone(), config), counters)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// =========================================================================
// Ordering and exclusivity
// =========================================================================

#[tokio::test]
async fn same_key_events_apply_in_arrival_order_never_concurrently() {
    let recorder = Recorder::open(Duration::from_millis(1));
    let (dispatcher, _) = dispatcher(recorder.clone(), 3, 1024);

    let mut expected: HashMap<usize, Vec<i64>> = HashMap::new();
    let mut pos = 0;
    for round in 0..20 {
        for n in 0..5 {
            pos += 1;
            // Within each key, positions arrive slightly out of order.
            let p = if round % 3 == 1 { pos + 100_000 } else { pos };
            expected.entry(n).or_default().push(p);
            dispatcher.dispatch(ev(n, p)).await.unwrap();
        }
    }
    dispatcher.wait_idle().await;

    for n in 0..5 {
        assert_eq!(recorder.order_for(&key(n)), expected[&n], "key {n}");
    }
    assert!(!recorder.overlapped.load(Ordering::SeqCst));
    assert!(recorder.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(dispatcher.active_keys(), 0);
}

// =========================================================================
// Worker slots and backpressure
// =========================================================================

#[tokio::test]
async fn new_keys_wait_for_a_slot_while_active_keys_keep_queueing() {
    let recorder = Recorder::gated();
    let (dispatcher, _) = dispatcher(recorder.clone(), 4, 1024);

    for n in 0..4 {
        dispatcher.dispatch(ev(n, n as i64 + 1)).await.unwrap();
    }
    settle().await;
    assert_eq!(recorder.running.load(Ordering::SeqCst), 4);

    let blocked = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch(ev(9, 100)).await })
    };
    settle().await;
    assert!(!blocked.is_finished(), "fifth key must wait for a free slot");

    // An already-active key does not need a slot.
    tokio::time::timeout(Duration::from_millis(100), dispatcher.dispatch(ev(0, 50)))
        .await
        .expect("active key is not blocked")
        .unwrap();

    recorder.release();
    blocked.await.unwrap().unwrap();
    dispatcher.wait_idle().await;

    assert_eq!(recorder.peak.load(Ordering::SeqCst), 4);
    assert_eq!(recorder.order_for(&key(0)), vec![1, 50]);
    assert_eq!(recorder.order_for(&key(9)), vec![100]);
}

// =========================================================================
// Overflow
// =========================================================================

#[tokio::test]
async fn full_key_queue_rejects_and_completes_the_event() {
    let recorder = Recorder::gated();
    let (dispatcher, counters) = dispatcher(recorder.clone(), 1, 2);

    dispatcher.dispatch(ev(0, 1)).await.unwrap();
    dispatcher.dispatch(ev(0, 2)).await.unwrap();
    dispatcher.dispatch(ev(0, 3)).await.unwrap();

    let err = dispatcher.dispatch(ev(0, 4)).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::QueueOverflow { key: ref k, position: Position(4), depth: 2 } if *k == key(0)
    ));
    assert_eq!(counters.snapshot().overflowed, 1);

    recorder.release();
    dispatcher.wait_idle().await;
    assert_eq!(recorder.order_for(&key(0)), vec![1, 2, 3]);
    assert_eq!(dispatcher.low_water_mark(), Some(Position(5)));
}

// =========================================================================
// Low-water mark
// =========================================================================

#[tokio::test]
async fn low_water_mark_holds_at_incomplete_events() {
    let recorder = Recorder::gated();
    let (dispatcher, _) = dispatcher(recorder.clone(), 2, 16);

    dispatcher.dispatch(ev(0, 10)).await.unwrap();
    dispatcher.dispatch(ev(1, 20)).await.unwrap();
    dispatcher.observe(Position(30));
    assert_eq!(dispatcher.low_water_mark(), Some(Position(10)));
    assert_eq!(dispatcher.in_flight(), 2);

    recorder.release();
    dispatcher.wait_idle().await;
    assert_eq!(dispatcher.low_water_mark(), Some(Position(31)));
}

struct AlwaysRejects;

#[async_trait]
impl Applier for AlwaysRejects {
    async fn apply_event(&self, _event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        Err(ApplyError::Rejected("constraint violation".into()))
    }
}

#[tokio::test]
async fn failed_events_still_advance_the_mark() {
    let (dispatcher, _) = dispatcher(AlwaysRejects, 2, 16);
    for pos in 1..=5 {
        dispatcher.dispatch(ev(pos as usize % 2, pos)).await.unwrap();
    }
    dispatcher.wait_idle().await;
    assert_eq!(dispatcher.low_water_mark(), Some(Position(6)));
}

struct Panics;

#[async_trait]
impl Applier for Panics {
    async fn apply_event(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        panic!("boom at {}", event.position);
    }
}

#[tokio::test]
async fn panicking_apply_is_counted_and_completed() {
    let (dispatcher, counters) = dispatcher(Panics, 1, 16);
    dispatcher.dispatch(ev(0, 1)).await.unwrap();
    dispatcher.dispatch(ev(0, 2)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), dispatcher.wait_idle())
        .await
        .expect("worker survives panics");
    assert_eq!(counters.snapshot().failed, 2);
    assert_eq!(dispatcher.low_water_mark(), Some(Position(3)));
}

// =========================================================================
// Convergence
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reordered_duplicated_feed_converges_to_latest_event_per_key() {
    const EVENTS: usize = 10_000;
    const KEYS: usize = 50;
    const WINDOW: usize = 64;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let keys: Vec<RecordKey> = (0..KEYS)
        .map(|n| RecordKey::new(format!("did:plc:{n}"), "app.bsky.feed.post", format!("r{n}")))
        .collect();

    let mut events = Vec::with_capacity(EVENTS);
    for i in 0..EVENTS {
        let key = keys[rng.random_range(0..KEYS)].clone();
        let pos = i as i64 + 1;
        let payload = json!({ "i": i });
        let event = match rng.random_range(0..10) {
            0..=3 => CommitEvent::create(key, pos, format!("cid-{pos}"), payload),
            4..=7 => CommitEvent::update(key, pos, format!("cid-{pos}"), payload),
            _ => CommitEvent::delete(key, pos),
        };
        events.push(event);
    }

    let mut latest: HashMap<RecordKey, CommitEvent> = HashMap::new();
    for event in &events {
        latest.insert(event.key.clone(), event.clone());
    }

    let mut delivery: Vec<CommitEvent> = events.iter().flat_map(|e| [e.clone(), e.clone()]).collect();
    for window in delivery.chunks_mut(WINDOW) {
        window.shuffle(&mut rng);
    }

    let store = Arc::new(MemoryRecordStore::new());
    let counters = Arc::new(EngineCounters::new());
    let engine = Arc::new(ApplyEngine::new(
        store.clone(),
        counters.clone(),
        RetryPolicy::immediate(3),
        Duration::from_secs(5),
    ));
    let dispatcher = KeyOrderedDispatcher::new(
        engine,
        counters.clone(),
        DispatcherConfig { worker_slots: 8, max_queue_depth: 4096 },
    );

    for event in delivery {
        dispatcher.dispatch(event).await.unwrap();
    }
    dispatcher.wait_idle().await;

    for key in &keys {
        let stored = store.get(key).await.unwrap();
        match latest.get(key) {
            None => assert!(stored.is_none()),
            Some(last) if last.operation == Operation::Delete => {
                assert!(stored.is_none(), "{key} should be deleted");
                assert_eq!(store.floor(key).await.unwrap(), Some(last.position));
            }
            Some(last) => {
                let stored = stored.unwrap_or_else(|| panic!("{key} missing"));
                assert_eq!(stored.last_applied_position, last.position);
                assert_eq!(Some(&stored.payload), last.payload.as_ref());
                assert_eq!(Some(&stored.content_hash), last.content_hash.as_ref());
            }
        }
    }

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.failed, 0);
    assert_eq!(snapshot.applied + snapshot.stale, (EVENTS * 2) as u64);
    assert_eq!(dispatcher.low_water_mark(), Some(Position(EVENTS as i64 + 1)));
}
