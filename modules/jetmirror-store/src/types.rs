//! Row-level types shared by every store implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jetmirror_events::{Position, RecordKey};

/// Current state of one record, as materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedRecord {
    pub key: RecordKey,
    pub content_hash: String,
    pub payload: serde_json::Value,
    pub first_seen_at: DateTime<Utc>,
    pub last_applied_position: Position,
    pub last_applied_at: DateTime<Utc>,
}

/// Deletion marker kept for the retention window so late stale writes
/// cannot resurrect the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub key: RecordKey,
    pub deleted_position: Position,
    pub deleted_at: DateTime<Utc>,
}

/// Arguments to `upsert_if_newer`.
#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub key: RecordKey,
    pub content_hash: String,
    pub payload: serde_json::Value,
    pub position: Position,
    pub applied_at: DateTime<Utc>,
}

/// What a conditional write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New row (first lifecycle, or recreated after a delete).
    Inserted,
    /// Existing row replaced in place.
    Updated,
    /// Live row removed and tombstone written.
    Deleted,
    /// No live row existed; the tombstone floor was raised.
    Tombstoned,
    /// Position was at or below the key's floor. Nothing changed.
    Stale { floor: Position },
}

impl WriteOutcome {
    pub fn is_stale(&self) -> bool {
        matches!(self, WriteOutcome::Stale { .. })
    }
}
