//! ApplyEngine: one commit event becomes one conditional store write.
//!
//! The store refuses any write at or below the key's floor, so replaying an
//! event (same key, same position) leaves the same state as applying it once.
//!
//! Create and Update are separate operations. Both resolve to an
//! upsert-if-newer; neither falls through into the other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, warn};

use jetmirror_events::{CommitEvent, Operation, Position, RecordKey};
use jetmirror_store::{RecordStore, RecordWrite, StoreError, WriteOutcome};

use crate::config::EngineConfig;
use crate::counters::EngineCounters;
use crate::error::ApplyError;
use crate::retry::RetryPolicy;

/// Terminal, non-error result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        key: RecordKey,
        position: Position,
        effect: WriteOutcome,
    },
    /// At or below the key's floor. Not an error; nothing changed.
    Stale {
        key: RecordKey,
        position: Position,
        floor: Position,
    },
}

impl ApplyOutcome {
    fn from_write(event: &CommitEvent, effect: WriteOutcome) -> Self {
        match effect {
            WriteOutcome::Stale { floor } => ApplyOutcome::Stale {
                key: event.key.clone(),
                position: event.position,
                floor,
            },
            effect => ApplyOutcome::Applied {
                key: event.key.clone(),
                position: event.position,
                effect,
            },
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }

    pub fn position(&self) -> Position {
        match self {
            ApplyOutcome::Applied { position, .. } | ApplyOutcome::Stale { position, .. } => {
                *position
            }
        }
    }
}

/// What the dispatcher's workers run for each event.
///
/// `apply_event` owns the whole lifecycle of the event including retries;
/// any `Err` it returns is terminal.
#[async_trait]
pub trait Applier: Send + Sync + 'static {
    async fn apply_event(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError>;
}

#[async_trait]
impl<A: Applier + ?Sized> Applier for Arc<A> {
    async fn apply_event(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        (**self).apply_event(event).await
    }
}

// ---------------------------------------------------------------------------
// ApplyEngine
// ---------------------------------------------------------------------------

pub struct ApplyEngine<S> {
    store: S,
    counters: Arc<EngineCounters>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl<S: RecordStore> ApplyEngine<S> {
    pub fn new(
        store: S,
        counters: Arc<EngineCounters>,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            store,
            counters,
            retry,
            attempt_timeout,
        }
    }

    pub fn from_config(store: S, counters: Arc<EngineCounters>, config: &EngineConfig) -> Self {
        Self::new(store, counters, config.apply_retry, config.apply_timeout)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn counters(&self) -> &Arc<EngineCounters> {
        &self.counters
    }

    /// Apply with per-attempt deadline, bounded retries and counting.
    ///
    /// Store unavailability and timeouts are retried with backoff; once
    /// attempts run out the event becomes `ApplyError::Failed`. A stale
    /// outcome is never produced by a failure.
    pub async fn apply(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, self.apply_once(event)).await
            {
                Ok(result) => result,
                Err(_) => Err(ApplyError::TimedOut(self.attempt_timeout)),
            };

            match result {
                Ok(outcome) => {
                    match &outcome {
                        ApplyOutcome::Applied { effect, .. } => {
                            self.counters.record_applied();
                            debug!(
                                key = %event.key,
                                position = %event.position,
                                operation = %event.operation,
                                effect = ?effect,
                                "Applied"
                            );
                        }
                        ApplyOutcome::Stale { floor, .. } => {
                            self.counters.record_stale();
                            debug!(
                                key = %event.key,
                                position = %event.position,
                                floor = %floor,
                                "Stale event ignored"
                            );
                        }
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && self.retry.allows_another(attempts) => {
                    let backoff = self.retry.delay_for(attempts - 1);
                    self.counters.record_retry();
                    warn!(
                        key = %event.key,
                        position = %event.position,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Apply failed, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.counters.record_failed();
                    error!(
                        key = %event.key,
                        position = %event.position,
                        attempts,
                        error = %e,
                        "Apply failed permanently; record not materialized"
                    );
                    return Err(ApplyError::Failed {
                        key: event.key.clone(),
                        position: event.position,
                        attempts,
                        last: Box::new(e),
                    });
                }
            }
        }
    }

    /// One attempt, no retry, no counting.
    pub async fn apply_once(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        match event.operation {
            Operation::Create => self.create(event).await,
            Operation::Update => self.update(event).await,
            Operation::Delete => self.delete(event).await,
        }
    }

    /// Insert the record, or replace one from an earlier lifecycle. A replay
    /// of the same create is stale.
    pub async fn create(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        if let Some(stale) = self.precheck(event).await? {
            return Ok(stale);
        }
        let write = record_write(event)?;
        let effect = self.store.upsert_if_newer(&write).await?;
        if effect == WriteOutcome::Updated {
            debug!(
                key = %event.key,
                position = %event.position,
                "Create replaced a live row; its delete was never observed"
            );
        }
        Ok(ApplyOutcome::from_write(event, effect))
    }

    /// Replace the record in place. An update for a record we never saw
    /// created still materializes it.
    pub async fn update(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        if let Some(stale) = self.precheck(event).await? {
            return Ok(stale);
        }
        let write = record_write(event)?;
        let effect = self.store.upsert_if_newer(&write).await?;
        if effect == WriteOutcome::Inserted {
            debug!(
                key = %event.key,
                position = %event.position,
                "Update materialized a record with no prior create"
            );
        }
        Ok(ApplyOutcome::from_write(event, effect))
    }

    /// Remove the record and leave a tombstone at the event's position.
    /// With no live row the tombstone still raises the key's floor.
    pub async fn delete(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        if let Some(stale) = self.precheck(event).await? {
            return Ok(stale);
        }
        let effect = self
            .store
            .delete_if_newer(&event.key, event.position, Utc::now())
            .await?;
        Ok(ApplyOutcome::from_write(event, effect))
    }

    /// Drop tombstones older than `retention`. Returns how many went.
    pub async fn purge_expired_tombstones(&self, retention: Duration) -> Result<u64, StoreError> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return Ok(0);
        };
        let purged = self.store.purge_tombstones(cutoff).await?;
        self.counters.record_purged(purged);
        Ok(purged)
    }

    /// Cheap read before the conditional write. Saves a write transaction for
    /// the common redelivery case; the write re-checks atomically anyway.
    async fn precheck(&self, event: &CommitEvent) -> Result<Option<ApplyOutcome>, ApplyError> {
        match self.store.floor(&event.key).await? {
            Some(floor) if floor >= event.position => Ok(Some(ApplyOutcome::Stale {
                key: event.key.clone(),
                position: event.position,
                floor,
            })),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl<S: RecordStore + 'static> Applier for ApplyEngine<S> {
    async fn apply_event(&self, event: &CommitEvent) -> Result<ApplyOutcome, ApplyError> {
        self.apply(event).await
    }
}

fn record_write(event: &CommitEvent) -> Result<RecordWrite, ApplyError> {
    let content_hash = event.content_hash.clone().ok_or(ApplyError::Incomplete {
        operation: event.operation,
        field: "content hash",
    })?;
    let payload = event.payload.clone().ok_or(ApplyError::Incomplete {
        operation: event.operation,
        field: "payload",
    })?;
    Ok(RecordWrite {
        key: event.key.clone(),
        content_hash,
        payload,
        position: event.position,
        applied_at: Utc::now(),
    })
}
