//! In-memory stores for tests and replay simulations. No database required.
//!
//! Both support fault injection so the engine's retry and failure paths can
//! be exercised without a flaky network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jetmirror_events::{Position, RecordKey};

use crate::error::StoreError;
use crate::traits::{CursorStore, RecordStore};
use crate::types::{MaterializedRecord, RecordWrite, Tombstone, WriteOutcome};

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Faults {
    fail_next: AtomicU32,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl Faults {
    async fn check(&self) -> Result<(), StoreError> {
        let latency = *lock(&self.latency);
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".into()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Slot {
    Live(MaterializedRecord),
    Deleted(Tombstone),
}

impl Slot {
    fn floor(&self) -> Position {
        match self {
            Slot::Live(record) => record.last_applied_position,
            Slot::Deleted(tombstone) => tombstone.deleted_position,
        }
    }
}

/// Record store backed by a single mutex-guarded map. The mutex makes every
/// conditional write trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    slots: Mutex<HashMap<RecordKey, Slot>>,
    faults: Faults,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` operations with `StoreError::Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// While offline, every operation fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every operation by `latency` before it runs.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.faults.latency) = latency;
    }

    /// All live records, sorted by key.
    pub fn records(&self) -> Vec<MaterializedRecord> {
        let mut records: Vec<_> = lock(&self.slots)
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(record) => Some(record.clone()),
                Slot::Deleted(_) => None,
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn tombstone_count(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| matches!(slot, Slot::Deleted(_)))
            .count()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<MaterializedRecord>, StoreError> {
        self.faults.check().await?;
        Ok(match lock(&self.slots).get(key) {
            Some(Slot::Live(record)) => Some(record.clone()),
            _ => None,
        })
    }

    async fn floor(&self, key: &RecordKey) -> Result<Option<Position>, StoreError> {
        self.faults.check().await?;
        Ok(lock(&self.slots).get(key).map(Slot::floor))
    }

    async fn upsert_if_newer(&self, write: &RecordWrite) -> Result<WriteOutcome, StoreError> {
        self.faults.check().await?;
        let mut slots = lock(&self.slots);

        let existing = slots.get(&write.key);
        if let Some(floor) = existing.map(Slot::floor) {
            if floor >= write.position {
                return Ok(WriteOutcome::Stale { floor });
            }
        }

        let (first_seen_at, outcome) = match existing {
            Some(Slot::Live(record)) => (record.first_seen_at, WriteOutcome::Updated),
            Some(Slot::Deleted(_)) | None => (write.applied_at, WriteOutcome::Inserted),
        };

        slots.insert(
            write.key.clone(),
            Slot::Live(MaterializedRecord {
                key: write.key.clone(),
                content_hash: write.content_hash.clone(),
                payload: write.payload.clone(),
                first_seen_at,
                last_applied_position: write.position,
                last_applied_at: write.applied_at,
            }),
        );
        Ok(outcome)
    }

    async fn delete_if_newer(
        &self,
        key: &RecordKey,
        position: Position,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        self.faults.check().await?;
        let mut slots = lock(&self.slots);

        let existing = slots.get(key);
        if let Some(floor) = existing.map(Slot::floor) {
            if floor >= position {
                return Ok(WriteOutcome::Stale { floor });
            }
        }

        let outcome = match existing {
            Some(Slot::Live(_)) => WriteOutcome::Deleted,
            Some(Slot::Deleted(_)) | None => WriteOutcome::Tombstoned,
        };

        slots.insert(
            key.clone(),
            Slot::Deleted(Tombstone {
                key: key.clone(),
                deleted_position: position,
                deleted_at: at,
            }),
        );
        Ok(outcome)
    }

    async fn tombstone(&self, key: &RecordKey) -> Result<Option<Tombstone>, StoreError> {
        self.faults.check().await?;
        Ok(match lock(&self.slots).get(key) {
            Some(Slot::Deleted(tombstone)) => Some(tombstone.clone()),
            _ => None,
        })
    }

    async fn purge_tombstones(&self, deleted_before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.faults.check().await?;
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Deleted(tombstone) => tombstone.deleted_at >= deleted_before,
            Slot::Live(_) => true,
        });
        Ok((before - slots.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// MemoryCursorStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    position: Mutex<Option<Position>>,
    history: Mutex<Vec<Position>>,
    faults: Faults,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `position`, as if persisted by an earlier run.
    pub fn starting_at(position: impl Into<Position>) -> Self {
        let store = Self::default();
        *lock(&store.position) = Some(position.into());
        store
    }

    pub fn fail_next(&self, n: u32) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<Position> {
        *lock(&self.position)
    }

    /// Every value passed to a successful `save`, in call order.
    pub fn history(&self) -> Vec<Position> {
        lock(&self.history).clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> Result<Option<Position>, StoreError> {
        self.faults.check().await?;
        Ok(self.current())
    }

    async fn save(&self, position: Position) -> Result<(), StoreError> {
        self.faults.check().await?;
        let mut current = lock(&self.position);
        *current = Some(current.map_or(position, |c| c.max(position)));
        lock(&self.history).push(position);
        Ok(())
    }
}
