//! Store contracts consumed by the engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jetmirror_events::{Position, RecordKey};

use crate::error::StoreError;
use crate::types::{MaterializedRecord, RecordWrite, Tombstone, WriteOutcome};

/// Materialized record state keyed by (subject, collection, rkey).
///
/// The floor of a key is the highest position ever applied to it: the live
/// row's `last_applied_position` or its tombstone's `deleted_position`.
/// Writes at or below the floor must be no-ops, and the floor check must be
/// atomic with the write even when two callers race on the same key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<MaterializedRecord>, StoreError>;

    async fn floor(&self, key: &RecordKey) -> Result<Option<Position>, StoreError>;

    /// Insert or replace the record if `write.position` is above the floor.
    /// `first_seen_at` is only set when no live row existed.
    async fn upsert_if_newer(&self, write: &RecordWrite) -> Result<WriteOutcome, StoreError>;

    /// Remove the record if `position` is above the floor, leaving a tombstone.
    async fn delete_if_newer(
        &self,
        key: &RecordKey,
        position: Position,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError>;

    async fn tombstone(&self, key: &RecordKey) -> Result<Option<Tombstone>, StoreError>;

    /// Drop tombstones older than `deleted_before`. Returns how many went.
    async fn purge_tombstones(&self, deleted_before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Durable, monotonic checkpoint for one stream.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> Result<Option<Position>, StoreError>;

    /// Persist `position`. Never moves a stored cursor backwards.
    async fn save(&self, position: Position) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Arc<S> blankets
// ---------------------------------------------------------------------------

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn get(&self, key: &RecordKey) -> Result<Option<MaterializedRecord>, StoreError> {
        (**self).get(key).await
    }

    async fn floor(&self, key: &RecordKey) -> Result<Option<Position>, StoreError> {
        (**self).floor(key).await
    }

    async fn upsert_if_newer(&self, write: &RecordWrite) -> Result<WriteOutcome, StoreError> {
        (**self).upsert_if_newer(write).await
    }

    async fn delete_if_newer(
        &self,
        key: &RecordKey,
        position: Position,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        (**self).delete_if_newer(key, position, at).await
    }

    async fn tombstone(&self, key: &RecordKey) -> Result<Option<Tombstone>, StoreError> {
        (**self).tombstone(key).await
    }

    async fn purge_tombstones(&self, deleted_before: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).purge_tombstones(deleted_before).await
    }
}

#[async_trait]
impl<C: CursorStore + ?Sized> CursorStore for Arc<C> {
    async fn load(&self) -> Result<Option<Position>, StoreError> {
        (**self).load().await
    }

    async fn save(&self, position: Position) -> Result<(), StoreError> {
        (**self).save(position).await
    }
}
