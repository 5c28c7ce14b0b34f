//! StreamSupervisor: owns the subscription and the cursor.
//!
//! ```text
//! Disconnected ─► Connecting ─► Streaming ─► Draining ─► Disconnected
//!                    ▲              │
//!                    └── Faulted ◄──┘   (disconnect / transport error)
//! ```
//!
//! Every (re)subscription starts at the last cursor that was durably saved,
//! never at an in-memory position. The cursor is the dispatcher's low-water
//! mark, persisted on a timer rather than per event.

use std::fmt;
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use jetmirror_events::{CommitEvent, Decoded, EventDecoder, Position, RawMessage};
use jetmirror_store::{CursorStore, RecordStore};

use crate::apply::ApplyEngine;
use crate::config::EngineConfig;
use crate::counters::{CounterSnapshot, EngineCounters};
use crate::dispatcher::{DispatcherConfig, KeyOrderedDispatcher};
use crate::error::{DispatchError, SupervisorError};
use crate::transport::{FeedTransport, RawStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
    Draining,
    Faulted,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Draining => write!(f, "draining"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Read-only operator view of a running supervisor.
#[derive(Clone)]
pub struct StatusReader {
    counters: Arc<EngineCounters>,
    cursor: watch::Receiver<Option<Position>>,
    state: watch::Receiver<StreamState>,
}

impl StatusReader {
    /// Last cursor durably saved (or loaded on startup).
    pub fn cursor(&self) -> Option<Position> {
        *self.cursor.borrow()
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Resolves when the supervisor enters `state`. False if it is gone.
    pub async fn wait_for_state(&self, state: StreamState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| *s == state).await.is_ok();
        reached
    }

    /// Resolves once a cursor at or past `position` has been persisted.
    pub async fn wait_for_cursor(&self, position: Position) -> bool {
        let mut rx = self.cursor.clone();
        let reached = rx.wait_for(|c| c.is_some_and(|c| c >= position)).await.is_ok();
        reached
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub final_cursor: Option<Position>,
    pub counters: CounterSnapshot,
}

impl fmt::Display for SupervisorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.final_cursor {
            Some(cursor) => write!(f, "cursor={cursor} {}", self.counters),
            None => write!(f, "cursor=none {}", self.counters),
        }
    }
}

enum StreamEnd {
    Shutdown,
    Disconnected(String),
}

// ---------------------------------------------------------------------------
// StreamSupervisor
// ---------------------------------------------------------------------------

pub struct StreamSupervisor<T, S, C> {
    transport: T,
    cursors: C,
    config: EngineConfig,
    decoder: EventDecoder,
    counters: Arc<EngineCounters>,
    engine: Arc<ApplyEngine<S>>,
    dispatcher: KeyOrderedDispatcher<Arc<ApplyEngine<S>>>,
    cursor_tx: watch::Sender<Option<Position>>,
    state_tx: watch::Sender<StreamState>,
}

impl<T, S, C> StreamSupervisor<T, S, C>
where
    T: FeedTransport,
    S: RecordStore + 'static,
    C: CursorStore,
{
    pub fn new(transport: T, store: S, cursors: C, config: EngineConfig) -> Self {
        let counters = Arc::new(EngineCounters::new());
        let engine = Arc::new(ApplyEngine::from_config(store, counters.clone(), &config));
        let dispatcher = KeyOrderedDispatcher::new(
            engine.clone(),
            counters.clone(),
            DispatcherConfig::from(&config),
        );
        let (cursor_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(StreamState::Disconnected);
        Self {
            transport,
            cursors,
            decoder: EventDecoder::new(config.max_message_bytes),
            config,
            counters,
            engine,
            dispatcher,
            cursor_tx,
            state_tx,
        }
    }

    pub fn status(&self) -> StatusReader {
        StatusReader {
            counters: self.counters.clone(),
            cursor: self.cursor_tx.subscribe(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Run until `shutdown` resolves, then drain and persist the final cursor.
    ///
    /// Only startup problems are returned as errors: invalid config, an
    /// unreadable cursor, or a feed that refuses the very first subscription.
    /// Everything after that is retried, logged and counted.
    pub async fn run<F>(self, shutdown: F) -> Result<SupervisorStats, SupervisorError>
    where
        F: Future<Output = ()> + Send,
    {
        self.config.validate()?;
        let mut shutdown = pin!(shutdown);

        let mut persisted = match self.cursors.load().await {
            Ok(Some(cursor)) => {
                info!(cursor = %cursor, "Resuming from persisted cursor");
                Some(cursor)
            }
            Ok(None) => {
                let initial = self.config.initial_cursor.resolve(Utc::now());
                info!(cursor = ?initial.map(Position::as_i64), "No persisted cursor, starting from initial position");
                initial
            }
            Err(e) => {
                self.set_state(StreamState::Faulted);
                return Err(SupervisorError::CursorLoad(e));
            }
        };
        if let Some(cursor) = persisted {
            self.dispatcher.raise_floor(cursor);
        }
        self.cursor_tx.send_replace(persisted);

        let mut connected_once = false;
        let mut failures = 0u32;

        loop {
            self.set_state(StreamState::Connecting);
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.as_mut() => break,
                subscribed = self.transport.subscribe(persisted) => subscribed,
            };

            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) if !connected_once => {
                    self.set_state(StreamState::Faulted);
                    return Err(SupervisorError::Startup(e));
                }
                Err(e) => {
                    warn!(error = %e, cursor = ?persisted.map(Position::as_i64), "Resubscribe failed");
                    self.set_state(StreamState::Faulted);
                    if self.backoff(&mut failures, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            connected_once = true;
            failures = 0;
            self.set_state(StreamState::Streaming);

            match self.pump(&mut stream, &mut shutdown, &mut persisted).await {
                StreamEnd::Shutdown => break,
                StreamEnd::Disconnected(reason) => {
                    warn!(reason = %reason, "Feed disconnected");
                    self.flush(&mut persisted).await;
                    self.set_state(StreamState::Faulted);
                    if self.backoff(&mut failures, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.drain(&mut persisted).await;
        let stats = SupervisorStats {
            final_cursor: persisted,
            counters: self.counters.snapshot(),
        };
        self.set_state(StreamState::Disconnected);
        info!(stats = %stats, "Supervisor stopped");
        Ok(stats)
    }

    /// Read from one subscription until it ends or shutdown is requested.
    async fn pump<F>(
        &self,
        stream: &mut RawStream,
        shutdown: &mut Pin<&mut F>,
        persisted: &mut Option<Position>,
    ) -> StreamEnd
    where
        F: Future<Output = ()>,
    {
        let mut flush = ticker(self.config.cursor_flush_interval);
        let mut status = ticker(self.config.status_interval);
        let mut gc = ticker(self.config.tombstone_gc_interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.as_mut() => return StreamEnd::Shutdown,
                _ = flush.tick() => self.flush(persisted).await,
                _ = status.tick() => self.log_status(*persisted),
                _ = gc.tick() => self.collect_tombstones().await,
                next = stream.next() => match next {
                    Some(Ok(raw)) => {
                        if let Some(event) = self.screen(raw) {
                            let accepted = self
                                .dispatch(event, shutdown, &mut flush, &mut status, persisted)
                                .await;
                            if !accepted {
                                return StreamEnd::Shutdown;
                            }
                        }
                    }
                    Some(Err(e)) => return StreamEnd::Disconnected(e.to_string()),
                    None => return StreamEnd::Disconnected("stream ended".into()),
                },
            }
        }
    }

    /// Hand a commit to the dispatcher. While the dispatcher waits for a free
    /// worker slot, the cursor keeps flushing and shutdown is still observed.
    /// False if shutdown arrived before the event was accepted.
    async fn dispatch<F>(
        &self,
        event: CommitEvent,
        shutdown: &mut Pin<&mut F>,
        flush: &mut Interval,
        status: &mut Interval,
        persisted: &mut Option<Position>,
    ) -> bool
    where
        F: Future<Output = ()>,
    {
        let position = event.position;
        let mut dispatched = pin!(self.dispatcher.dispatch(event));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.as_mut() => {
                    // Read but never accepted: the cursor must not pass it.
                    self.dispatcher.hold(position);
                    debug!(position = %position, "Shutdown while waiting for a worker slot");
                    return false;
                }
                _ = flush.tick() => self.flush(persisted).await,
                _ = status.tick() => self.log_status(*persisted),
                result = dispatched.as_mut() => {
                    match result {
                        Ok(()) => {}
                        Err(DispatchError::QueueOverflow { key, position, depth }) => {
                            warn!(key = %key, position = %position, depth, "Per-key queue full, event dropped");
                        }
                        Err(e @ DispatchError::Closed(_)) => warn!(error = %e, "Event not dispatched"),
                    }
                    return true;
                }
            }
        }
    }

    /// Decode `raw`. Ignored and undecodable messages are counted and marked
    /// complete here; only commits come back.
    fn screen(&self, raw: RawMessage) -> Option<CommitEvent> {
        match self.decoder.decode(&raw) {
            Ok(Decoded::Commit(event)) => Some(event),
            Ok(Decoded::Ignored { position, reason }) => {
                self.counters.record_ignored();
                debug!(position = ?position.map(Position::as_i64), reason = %reason, "Ignored message");
                if let Some(position) = position {
                    self.dispatcher.observe(position);
                }
                None
            }
            Err(e) => {
                self.counters.record_decode_failed();
                warn!(
                    position = ?e.position.map(Position::as_i64),
                    error = %e.kind,
                    raw = %e.raw,
                    "Dropping undecodable message"
                );
                if let Some(position) = e.position {
                    self.dispatcher.observe(position);
                }
                None
            }
        }
    }

    /// Persist the low-water mark if it moved. Failures are retried on the
    /// next tick.
    async fn flush(&self, persisted: &mut Option<Position>) {
        let Some(mark) = self.dispatcher.low_water_mark() else {
            return;
        };
        if persisted.is_some_and(|p| p >= mark) {
            return;
        }
        match self.cursors.save(mark).await {
            Ok(()) => {
                *persisted = Some(mark);
                self.cursor_tx.send_replace(Some(mark));
                debug!(cursor = %mark, "Cursor persisted");
            }
            Err(e) => warn!(error = %e, cursor = %mark, "Failed to persist cursor"),
        }
    }

    async fn drain(&self, persisted: &mut Option<Position>) {
        self.set_state(StreamState::Draining);
        let grace = self.config.drain_grace;
        match tokio::time::timeout(grace, self.dispatcher.wait_idle()).await {
            Ok(()) => debug!("All in-flight events completed"),
            Err(_) => warn!(
                in_flight = self.dispatcher.in_flight(),
                grace_secs = grace.as_secs(),
                "Drain grace elapsed with applies still in flight"
            ),
        }
        self.dispatcher.close();
        self.flush(persisted).await;
    }

    /// Sleep before the next subscribe attempt. True if shutdown arrived first.
    async fn backoff<F>(&self, failures: &mut u32, shutdown: &mut Pin<&mut F>) -> bool
    where
        F: Future<Output = ()>,
    {
        let delay = self.config.reconnect.delay_for(*failures);
        *failures = failures.saturating_add(1);
        info!(attempt = *failures, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
        tokio::select! {
            biased;
            _ = shutdown.as_mut() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn collect_tombstones(&self) {
        match self
            .engine
            .purge_expired_tombstones(self.config.tombstone_retention)
            .await
        {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Purged expired tombstones"),
            Err(e) => warn!(error = %e, "Tombstone purge failed"),
        }
    }

    fn log_status(&self, persisted: Option<Position>) {
        let state = *self.state_tx.borrow();
        info!(
            state = %state,
            cursor = ?persisted.map(Position::as_i64),
            low_water_mark = ?self.dispatcher.low_water_mark().map(Position::as_i64),
            in_flight = self.dispatcher.in_flight(),
            active_keys = self.dispatcher.active_keys(),
            counters = %self.counters.snapshot(),
            "Stream status"
        );
    }

    fn set_state(&self, state: StreamState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!(state = %state, "Stream state changed");
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
