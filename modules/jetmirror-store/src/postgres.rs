//! Postgres-backed record and cursor stores.
//!
//! Every conditional write runs in its own transaction, serialized per key by
//! a transaction-scoped advisory lock. The `WHERE last_applied_position < …`
//! guard on the upsert is the compare-and-set; the lock makes the tombstone
//! check part of the same atomic step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use jetmirror_events::{Position, RecordKey};

use crate::error::StoreError;
use crate::traits::{CursorStore, RecordStore};
use crate::types::{MaterializedRecord, RecordWrite, Tombstone, WriteOutcome};

// ---------------------------------------------------------------------------
// PgRecordStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<MaterializedRecord>, StoreError> {
        let row = sqlx::query_as::<_, MaterializedRecord>(
            r#"
            SELECT subject, collection, rkey, content_hash, payload,
                   first_seen_at, last_applied_position, last_applied_at
            FROM materialized_records
            WHERE subject = $1 AND collection = $2 AND rkey = $3
            "#,
        )
        .bind(&key.subject)
        .bind(&key.collection)
        .bind(&key.rkey)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn floor(&self, key: &RecordKey) -> Result<Option<Position>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        floor_of(&mut conn, key).await
    }

    async fn upsert_if_newer(&self, write: &RecordWrite) -> Result<WriteOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_key(&mut tx, &write.key).await?;

        if let Some(floor) = floor_of(&mut tx, &write.key).await? {
            if floor >= write.position {
                tx.rollback().await?;
                return Ok(WriteOutcome::Stale { floor });
            }
        }

        // `xmax = 0` is true only for freshly inserted tuples.
        let inserted = sqlx::query_as::<_, (bool,)>(
            r#"
            INSERT INTO materialized_records (
                subject, collection, rkey, content_hash, payload,
                first_seen_at, last_applied_position, last_applied_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $6)
            ON CONFLICT (subject, collection, rkey) DO UPDATE
                SET content_hash = EXCLUDED.content_hash,
                    payload = EXCLUDED.payload,
                    last_applied_position = EXCLUDED.last_applied_position,
                    last_applied_at = EXCLUDED.last_applied_at
                WHERE materialized_records.last_applied_position < EXCLUDED.last_applied_position
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&write.key.subject)
        .bind(&write.key.collection)
        .bind(&write.key.rkey)
        .bind(&write.content_hash)
        .bind(&write.payload)
        .bind(write.applied_at)
        .bind(write.position.as_i64())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((inserted,)) = inserted else {
            // Lost the compare-and-set; report whatever won.
            let floor = floor_of(&mut tx, &write.key).await?.unwrap_or(write.position);
            tx.rollback().await?;
            return Ok(WriteOutcome::Stale { floor });
        };

        // A new lifecycle supersedes any earlier tombstone.
        sqlx::query(
            r#"
            DELETE FROM record_tombstones
            WHERE subject = $1 AND collection = $2 AND rkey = $3
            "#,
        )
        .bind(&write.key.subject)
        .bind(&write.key.collection)
        .bind(&write.key.rkey)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(if inserted {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Updated
        })
    }

    async fn delete_if_newer(
        &self,
        key: &RecordKey,
        position: Position,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_key(&mut tx, key).await?;

        if let Some(floor) = floor_of(&mut tx, key).await? {
            if floor >= position {
                tx.rollback().await?;
                return Ok(WriteOutcome::Stale { floor });
            }
        }

        let removed = sqlx::query(
            r#"
            DELETE FROM materialized_records
            WHERE subject = $1 AND collection = $2 AND rkey = $3
              AND last_applied_position < $4
            "#,
        )
        .bind(&key.subject)
        .bind(&key.collection)
        .bind(&key.rkey)
        .bind(position.as_i64())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            INSERT INTO record_tombstones (subject, collection, rkey, deleted_position, deleted_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (subject, collection, rkey) DO UPDATE
                SET deleted_position = EXCLUDED.deleted_position,
                    deleted_at = EXCLUDED.deleted_at
                WHERE record_tombstones.deleted_position < EXCLUDED.deleted_position
            "#,
        )
        .bind(&key.subject)
        .bind(&key.collection)
        .bind(&key.rkey)
        .bind(position.as_i64())
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(if removed > 0 {
            WriteOutcome::Deleted
        } else {
            WriteOutcome::Tombstoned
        })
    }

    async fn tombstone(&self, key: &RecordKey) -> Result<Option<Tombstone>, StoreError> {
        let row = sqlx::query_as::<_, (String, String, String, i64, DateTime<Utc>)>(
            r#"
            SELECT subject, collection, rkey, deleted_position, deleted_at
            FROM record_tombstones
            WHERE subject = $1 AND collection = $2 AND rkey = $3
            "#,
        )
        .bind(&key.subject)
        .bind(&key.collection)
        .bind(&key.rkey)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(subject, collection, rkey, deleted_position, deleted_at)| Tombstone {
                key: RecordKey {
                    subject,
                    collection,
                    rkey,
                },
                deleted_position: Position(deleted_position),
                deleted_at,
            },
        ))
    }

    async fn purge_tombstones(&self, deleted_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let purged = sqlx::query("DELETE FROM record_tombstones WHERE deleted_at < $1")
            .bind(deleted_before)
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(purged, cutoff = %deleted_before, "Purged expired tombstones");
        Ok(purged)
    }
}

// ---------------------------------------------------------------------------
// PgCursorStore
// ---------------------------------------------------------------------------

/// Cursor for one named stream, stored in `stream_cursors`.
#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
    stream: String,
}

impl PgCursorStore {
    pub fn new(pool: PgPool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn load(&self) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT position FROM stream_cursors WHERE stream = $1")
            .bind(&self.stream)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(p,)| Position(p)))
    }

    async fn save(&self, position: Position) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stream_cursors (stream, position, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (stream) DO UPDATE
                SET position = GREATEST(stream_cursors.position, EXCLUDED.position),
                    updated_at = now()
            "#,
        )
        .bind(&self.stream)
        .bind(position.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Serialize writers of one key for the rest of the transaction.
async fn lock_key(tx: &mut Transaction<'_, Postgres>, key: &RecordKey) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Highest position applied to `key`, counting tombstones. NULL when unseen.
async fn floor_of(conn: &mut sqlx::PgConnection, key: &RecordKey) -> Result<Option<Position>, StoreError> {
    let row = sqlx::query_as::<_, (Option<i64>,)>(
        r#"
        SELECT GREATEST(
            (SELECT last_applied_position FROM materialized_records
              WHERE subject = $1 AND collection = $2 AND rkey = $3),
            (SELECT deleted_position FROM record_tombstones
              WHERE subject = $1 AND collection = $2 AND rkey = $3)
        )
        "#,
    )
    .bind(&key.subject)
    .bind(&key.collection)
    .bind(&key.rkey)
    .fetch_one(conn)
    .await?;

    Ok(row.0.map(Position))
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for MaterializedRecord
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for MaterializedRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(MaterializedRecord {
            key: RecordKey {
                subject: row.try_get("subject")?,
                collection: row.try_get("collection")?,
                rkey: row.try_get("rkey")?,
            },
            content_hash: row.try_get("content_hash")?,
            payload: row.try_get("payload")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_applied_position: Position(row.try_get("last_applied_position")?),
            last_applied_at: row.try_get("last_applied_at")?,
        })
    }
}
