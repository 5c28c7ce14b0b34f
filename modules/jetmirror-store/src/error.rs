use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Transient: connection lost, pool exhausted, serialization conflict.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the write. Retrying won't help.
    #[error("store rejected operation: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Postgres SQLSTATEs worth retrying: serialization_failure, deadlock_detected.
const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01"];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&&*code)) =>
            {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Rejected(err.to_string()),
        }
    }
}
