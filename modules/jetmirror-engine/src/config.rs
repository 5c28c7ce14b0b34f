//! Engine tuning knobs. Defaults keep worst-case memory and backlog bounded.

use std::time::Duration;

use chrono::{DateTime, Utc};

use jetmirror_events::{Position, DEFAULT_MAX_MESSAGE_BYTES};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Where to start when no cursor has ever been persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialCursor {
    /// Subscribe without a position: live tail only.
    Live,
    At(Position),
    /// Rewind this far from now. Positions are feed time in microseconds.
    Lookback(Duration),
}

impl InitialCursor {
    pub fn resolve(self, now: DateTime<Utc>) -> Option<Position> {
        match self {
            InitialCursor::Live => None,
            InitialCursor::At(position) => Some(position),
            InitialCursor::Lookback(window) => {
                let micros = i64::try_from(window.as_micros()).unwrap_or(i64::MAX);
                Some(Position(now.timestamp_micros().saturating_sub(micros).max(0)))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent apply tasks. Must not exceed the store's connection pool.
    pub worker_slots: usize,
    /// Queued events allowed per key before overflow.
    pub max_queue_depth: usize,
    pub max_message_bytes: usize,
    /// Deadline for a single apply attempt.
    pub apply_timeout: Duration,
    pub apply_retry: RetryPolicy,
    /// Backoff between resubscription attempts. `max_attempts` is ignored.
    pub reconnect: RetryPolicy,
    pub cursor_flush_interval: Duration,
    pub status_interval: Duration,
    pub tombstone_retention: Duration,
    pub tombstone_gc_interval: Duration,
    /// How long draining waits for in-flight applies before giving up.
    pub drain_grace: Duration,
    pub initial_cursor: InitialCursor,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_slots: 8,
            max_queue_depth: 1024,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            apply_timeout: Duration::from_secs(10),
            apply_retry: RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(5)),
            reconnect: RetryPolicy::new(u32::MAX, Duration::from_secs(1), Duration::from_secs(60)),
            cursor_flush_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(5),
            tombstone_retention: Duration::from_secs(24 * 60 * 60),
            tombstone_gc_interval: Duration::from_secs(10 * 60),
            drain_grace: Duration::from_secs(30),
            initial_cursor: InitialCursor::Lookback(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_slots == 0 {
            return Err(ConfigError::Invalid("worker_slots must be at least 1".into()));
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::Invalid("max_queue_depth must be at least 1".into()));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid("max_message_bytes must be at least 1".into()));
        }
        if self.apply_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("apply_retry.max_attempts must be at least 1".into()));
        }
        for (name, interval) in [
            ("apply_timeout", self.apply_timeout),
            ("cursor_flush_interval", self.cursor_flush_interval),
            ("status_interval", self.status_interval),
            ("tombstone_gc_interval", self.tombstone_gc_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Workers each hold a store connection while applying; more workers than
    /// connections deadlocks on the pool.
    pub fn validate_against_pool(&self, pool_capacity: u32) -> Result<(), ConfigError> {
        self.validate()?;
        if self.worker_slots > pool_capacity as usize {
            return Err(ConfigError::PoolTooSmall {
                worker_slots: self.worker_slots,
                pool_capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn workers_may_not_outnumber_pool() {
        let config = EngineConfig {
            worker_slots: 16,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate_against_pool(8),
            Err(ConfigError::PoolTooSmall { worker_slots: 16, pool_capacity: 8 })
        ));
        assert!(config.validate_against_pool(16).is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = EngineConfig {
            worker_slots: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn lookback_rewinds_in_microseconds() {
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let cursor = InitialCursor::Lookback(Duration::from_secs(60)).resolve(now);
        assert_eq!(cursor, Some(Position(1_700_000_000_000_000 - 60_000_000)));
        assert_eq!(InitialCursor::Live.resolve(now), None);
    }
}
