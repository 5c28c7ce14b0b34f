//! Feed transport seam. The supervisor only sees a stream of raw messages;
//! the stream ending (or yielding an error) is a disconnect.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};

use jetmirror_events::{Position, RawMessage};

use crate::error::TransportError;

pub type RawStream = Pin<Box<dyn Stream<Item = Result<RawMessage, TransportError>> + Send>>;

#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Open a subscription delivering messages at or after `from`, or the
    /// live tail when `from` is `None`.
    async fn subscribe(&self, from: Option<Position>) -> Result<RawStream, TransportError>;
}

#[async_trait]
impl<T: FeedTransport + ?Sized> FeedTransport for Arc<T> {
    async fn subscribe(&self, from: Option<Position>) -> Result<RawStream, TransportError> {
        (**self).subscribe(from).await
    }
}

// ---------------------------------------------------------------------------
// MemoryFeed
// ---------------------------------------------------------------------------

/// How the next subscription behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribePlan {
    /// Deliver everything from the requested position.
    Full,
    /// Fail the subscribe call.
    Refuse,
    /// Deliver `n` messages, then drop the connection.
    DisconnectAfter(usize),
}

/// Replayable in-memory feed. Each subscription replays the log from the
/// requested position; messages without a position are always delivered.
/// Plans are consumed one per subscribe call, falling back to `Full`.
#[derive(Debug, Default)]
pub struct MemoryFeed {
    log: Mutex<Vec<RawMessage>>,
    plans: Mutex<VecDeque<SubscribePlan>>,
    hold_open: AtomicBool,
    subscriptions: Mutex<Vec<Option<Position>>>,
    delivered: Arc<AtomicUsize>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: impl IntoIterator<Item = RawMessage>) -> Self {
        let feed = Self::new();
        lock(&feed.log).extend(messages);
        feed
    }

    pub fn push(&self, message: RawMessage) {
        lock(&self.log).push(message);
    }

    /// Queue a plan for a future subscribe call.
    pub fn plan(&self, plan: SubscribePlan) {
        lock(&self.plans).push_back(plan);
    }

    /// Keep `Full` subscriptions open after the log is exhausted instead of
    /// ending them, like a live feed with nothing new to say.
    pub fn hold_open(&self, hold: bool) {
        self.hold_open.store(hold, Ordering::SeqCst);
    }

    /// The `from` argument of every subscribe call, refused ones included.
    pub fn subscriptions(&self) -> Vec<Option<Position>> {
        lock(&self.subscriptions).clone()
    }

    /// Messages handed out across all subscriptions.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedTransport for MemoryFeed {
    async fn subscribe(&self, from: Option<Position>) -> Result<RawStream, TransportError> {
        lock(&self.subscriptions).push(from);
        let plan = lock(&self.plans).pop_front().unwrap_or(SubscribePlan::Full);

        if plan == SubscribePlan::Refuse {
            return Err(TransportError::Connect("subscription refused".into()));
        }

        let replay: Vec<RawMessage> = lock(&self.log)
            .iter()
            .filter(|m| match (from, m.position) {
                (Some(from), Some(position)) => position >= from,
                _ => true,
            })
            .cloned()
            .collect();

        let delivered = self.delivered.clone();
        let messages = stream::iter(replay).map(move |m| {
            delivered.fetch_add(1, Ordering::SeqCst);
            Ok(m)
        });

        Ok(match plan {
            SubscribePlan::DisconnectAfter(n) => messages
                .take(n)
                .chain(stream::once(async {
                    Err(TransportError::Disconnected("connection dropped".into()))
                }))
                .boxed(),
            _ if self.hold_open.load(Ordering::SeqCst) => {
                messages.chain(stream::pending()).boxed()
            }
            _ => messages.boxed(),
        })
    }
}
