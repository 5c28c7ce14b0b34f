//! Stream materialization engine.
//!
//! raw message → EventDecoder → KeyOrderedDispatcher → ApplyEngine → RecordStore,
//! with the StreamSupervisor owning the subscription and turning per-event
//! completions into a durable low-water-mark cursor.
//!
//! Correctness rests on two properties: the store rejects any write at or
//! below a key's floor, and the cursor never passes an event that has not
//! completed. Everything else (ordering, retries, backpressure) is throughput.

pub mod apply;
pub mod config;
pub mod counters;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod supervisor;
pub mod transport;
pub mod watermark;

pub use apply::{Applier, ApplyEngine, ApplyOutcome};
pub use config::{EngineConfig, InitialCursor};
pub use counters::{CounterSnapshot, EngineCounters};
pub use dispatcher::{DispatcherConfig, KeyOrderedDispatcher};
pub use error::{ApplyError, ConfigError, DispatchError, SupervisorError, TransportError};
pub use retry::RetryPolicy;
pub use supervisor::{StatusReader, StreamState, StreamSupervisor, SupervisorStats};
pub use transport::{FeedTransport, MemoryFeed, RawStream, SubscribePlan};
pub use watermark::LowWaterMark;
