//! Persistent side of the materializer: the record store and the cursor store.
//!
//! Both are traits so the engine can run against Postgres in production and
//! against the in-memory implementations in tests. Every write is a
//! compare-and-set on the key's position floor.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;
pub mod types;

pub use error::StoreError;
pub use memory::{MemoryCursorStore, MemoryRecordStore};
pub use postgres::{PgCursorStore, PgRecordStore};
pub use traits::{CursorStore, RecordStore};
pub use types::{MaterializedRecord, RecordWrite, Tombstone, WriteOutcome};
