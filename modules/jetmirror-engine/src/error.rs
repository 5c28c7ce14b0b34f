use std::time::Duration;

use thiserror::Error;

use jetmirror_events::{Position, RecordKey};
use jetmirror_store::StoreError;

/// Why applying one event did not succeed.
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("apply attempt timed out after {0:?}")]
    TimedOut(Duration),

    #[error("store rejected write: {0}")]
    Rejected(String),

    /// Create/Update without a body. The decoder prevents this for feed events.
    #[error("{operation} event has no {field}")]
    Incomplete {
        operation: jetmirror_events::Operation,
        field: &'static str,
    },

    /// Terminal: retries exhausted or a non-retryable error. The event is
    /// a materialization gap.
    #[error("apply failed for {key} at {position} after {attempts} attempt(s): {last}")]
    Failed {
        key: RecordKey,
        position: Position,
        attempts: u32,
        last: Box<ApplyError>,
    },
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::StoreUnavailable(_) | ApplyError::TimedOut(_))
    }
}

impl From<StoreError> for ApplyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ApplyError::StoreUnavailable(msg),
            StoreError::Rejected(msg) => ApplyError::Rejected(msg),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// A single key has too many events waiting. The offending event is
    /// dropped and counted as completed.
    #[error("queue for {key} is full ({depth} pending); dropped event at {position}")]
    QueueOverflow {
        key: RecordKey,
        position: Position,
        depth: usize,
    },

    #[error("dispatcher closed; event at {0} not accepted")]
    Closed(Position),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("could not subscribe: {0}")]
    Connect(String),

    #[error("feed disconnected: {0}")]
    Disconnected(String),

    #[error("transport I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid engine configuration: {0}")]
    Invalid(String),

    #[error("{worker_slots} worker slots exceed the store pool capacity of {pool_capacity}")]
    PoolTooSmall {
        worker_slots: usize,
        pool_capacity: u32,
    },
}

/// The only errors that stop the process. Everything in steady state is
/// contained and surfaced through logs and counters.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not load persisted cursor: {0}")]
    CursorLoad(#[source] StoreError),

    #[error("feed unreachable on startup: {0}")]
    Startup(#[source] TransportError),
}
