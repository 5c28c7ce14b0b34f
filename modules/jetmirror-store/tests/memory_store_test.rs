//! MemoryRecordStore / MemoryCursorStore semantics. No database required.

use chrono::{Duration, Utc};
use jetmirror_events::{Position, RecordKey};
use jetmirror_store::{
    CursorStore, MemoryCursorStore, MemoryRecordStore, RecordStore, RecordWrite, StoreError,
    WriteOutcome,
};
use serde_json::json;

fn key() -> RecordKey {
    RecordKey::new("did:plc:alice", "app.bsky.feed.post", "k1")
}

fn write(position: i64, text: &str) -> RecordWrite {
    RecordWrite {
        key: key(),
        content_hash: format!("cid-{position}"),
        payload: json!({ "text": text }),
        position: Position(position),
        applied_at: Utc::now(),
    }
}

// =========================================================================
// Conditional writes
// =========================================================================

#[tokio::test]
async fn first_write_inserts_then_newer_write_updates() {
    let store = MemoryRecordStore::new();

    assert_eq!(store.upsert_if_newer(&write(10, "a")).await.unwrap(), WriteOutcome::Inserted);
    let first = store.get(&key()).await.unwrap().unwrap();

    assert_eq!(store.upsert_if_newer(&write(15, "b")).await.unwrap(), WriteOutcome::Updated);
    let second = store.get(&key()).await.unwrap().unwrap();

    assert_eq!(second.payload["text"], "b");
    assert_eq!(second.last_applied_position, Position(15));
    assert_eq!(second.first_seen_at, first.first_seen_at, "first_seen_at is sticky");
}

#[tokio::test]
async fn write_at_or_below_floor_is_stale() {
    let store = MemoryRecordStore::new();
    store.upsert_if_newer(&write(10, "a")).await.unwrap();

    for pos in [10, 9] {
        assert_eq!(
            store.upsert_if_newer(&write(pos, "old")).await.unwrap(),
            WriteOutcome::Stale { floor: Position(10) }
        );
    }
    assert_eq!(store.get(&key()).await.unwrap().unwrap().payload["text"], "a");
}

#[tokio::test]
async fn delete_leaves_tombstone_that_blocks_older_writes() {
    let store = MemoryRecordStore::new();
    store.upsert_if_newer(&write(10, "a")).await.unwrap();

    let outcome = store.delete_if_newer(&key(), Position(12), Utc::now()).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Deleted);
    assert!(store.get(&key()).await.unwrap().is_none());
    assert_eq!(store.floor(&key()).await.unwrap(), Some(Position(12)));

    let stale = store.upsert_if_newer(&write(11, "zombie")).await.unwrap();
    assert_eq!(stale, WriteOutcome::Stale { floor: Position(12) });
    assert!(store.get(&key()).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_without_row_raises_floor() {
    let store = MemoryRecordStore::new();

    let outcome = store.delete_if_newer(&key(), Position(20), Utc::now()).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Tombstoned);
    assert_eq!(
        store.upsert_if_newer(&write(5, "late")).await.unwrap(),
        WriteOutcome::Stale { floor: Position(20) }
    );
}

#[tokio::test]
async fn newer_create_after_delete_starts_new_lifecycle() {
    let store = MemoryRecordStore::new();
    let early = Utc::now() - Duration::hours(1);
    store
        .upsert_if_newer(&RecordWrite { applied_at: early, ..write(1, "v1") })
        .await
        .unwrap();
    store.delete_if_newer(&key(), Position(2), Utc::now()).await.unwrap();

    assert_eq!(store.upsert_if_newer(&write(3, "v2")).await.unwrap(), WriteOutcome::Inserted);
    let record = store.get(&key()).await.unwrap().unwrap();
    assert!(record.first_seen_at > early);
    assert!(store.tombstone(&key()).await.unwrap().is_none());
}

// =========================================================================
// Tombstone GC
// =========================================================================

#[tokio::test]
async fn purge_drops_only_expired_tombstones() {
    let store = MemoryRecordStore::new();
    let old = RecordKey::new("did:plc:bob", "app.bsky.feed.like", "old");
    let fresh = RecordKey::new("did:plc:bob", "app.bsky.feed.like", "fresh");

    store
        .delete_if_newer(&old, Position(1), Utc::now() - Duration::hours(48))
        .await
        .unwrap();
    store.delete_if_newer(&fresh, Position(2), Utc::now()).await.unwrap();

    let purged = store
        .purge_tombstones(Utc::now() - Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(store.tombstone(&old).await.unwrap().is_none());
    assert!(store.tombstone(&fresh).await.unwrap().is_some());
}

// =========================================================================
// Fault injection
// =========================================================================

#[tokio::test]
async fn injected_failures_are_retryable_and_consumed() {
    let store = MemoryRecordStore::new();
    store.fail_next(2);

    for _ in 0..2 {
        let err = store.upsert_if_newer(&write(1, "a")).await.unwrap_err();
        assert!(err.is_retryable());
    }
    assert_eq!(store.upsert_if_newer(&write(1, "a")).await.unwrap(), WriteOutcome::Inserted);
}

#[tokio::test]
async fn offline_store_fails_everything() {
    let store = MemoryRecordStore::new();
    store.set_offline(true);
    assert!(matches!(store.get(&key()).await, Err(StoreError::Unavailable(_))));
    store.set_offline(false);
    assert!(store.get(&key()).await.unwrap().is_none());
}

// =========================================================================
// Cursor store
// =========================================================================

#[tokio::test]
async fn cursor_saves_are_monotonic() {
    let cursors = MemoryCursorStore::new();
    assert_eq!(cursors.load().await.unwrap(), None);

    cursors.save(Position(100)).await.unwrap();
    cursors.save(Position(50)).await.unwrap();
    assert_eq!(cursors.load().await.unwrap(), Some(Position(100)));

    cursors.save(Position(150)).await.unwrap();
    assert_eq!(cursors.load().await.unwrap(), Some(Position(150)));
    assert_eq!(cursors.history(), vec![Position(100), Position(50), Position(150)]);
}

#[tokio::test]
async fn cursor_can_be_seeded() {
    let cursors = MemoryCursorStore::starting_at(Position(42));
    assert_eq!(cursors.load().await.unwrap(), Some(Position(42)));
}
