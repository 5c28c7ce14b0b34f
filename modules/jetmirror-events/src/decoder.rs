//! EventDecoder: raw feed message to CommitEvent.
//!
//! Three outcomes: a well-formed commit, an ignored message (non-commit kinds,
//! operations we don't materialize), or a DecodeError that keeps the raw body
//! for diagnostics. None of them stop the stream.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::types::{CommitEvent, Operation, Position, RawMessage, RecordKey};

/// Default upper bound on a raw message body (2 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;

/// How much of an offending body is kept on a DecodeError.
const RAW_PREVIEW_BYTES: usize = 4096;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Commit(CommitEvent),
    /// Valid message the materializer has no use for.
    Ignored {
        position: Option<Position>,
        reason: IgnoreReason,
    },
}

impl Decoded {
    pub fn position(&self) -> Option<Position> {
        match self {
            Decoded::Commit(event) => Some(event.position),
            Decoded::Ignored { position, .. } => *position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// `identity`, `account`, or any other non-commit kind.
    NonCommitKind(String),
    UnsupportedOperation(String),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonCommitKind(kind) => write!(f, "non-commit kind '{kind}'"),
            Self::UnsupportedOperation(op) => write!(f, "unsupported operation '{op}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("message is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),
}

/// A message that could not be decoded. Carries the raw body (truncated) so
/// the failure can be diagnosed from logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("undecodable message (position {position:?}): {kind}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub position: Option<Position>,
    pub raw: String,
}

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    did: Option<String>,
    time_us: Option<i64>,
    kind: Option<String>,
    commit: Option<CommitBody>,
}

#[derive(Debug, Deserialize)]
struct CommitBody {
    operation: Option<String>,
    collection: Option<String>,
    rkey: Option<String>,
    cid: Option<String>,
    record: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// EventDecoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EventDecoder {
    max_message_bytes: usize,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl EventDecoder {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    pub fn decode(&self, raw: &RawMessage) -> Result<Decoded, DecodeError> {
        let size = raw.body.len();
        if size > self.max_message_bytes {
            return Err(self.reject(
                raw,
                raw.position,
                DecodeErrorKind::TooLarge {
                    size,
                    limit: self.max_message_bytes,
                },
            ));
        }

        let envelope: Envelope = serde_json::from_str(&raw.body).map_err(|e| {
            self.reject(raw, raw.position, DecodeErrorKind::Malformed(e.to_string()))
        })?;

        // A transport-supplied position wins over the body's.
        let position = raw.position.or(envelope.time_us.map(Position));

        match envelope.kind.as_deref() {
            Some("commit") => {}
            None if envelope.commit.is_some() => {}
            Some(other) => {
                return Ok(Decoded::Ignored {
                    position,
                    reason: IgnoreReason::NonCommitKind(other.to_string()),
                })
            }
            None => {
                return Err(self.reject(raw, position, DecodeErrorKind::MissingField("kind")))
            }
        }

        let Some(position) = position else {
            return Err(self.reject(raw, None, DecodeErrorKind::MissingField("time_us")));
        };
        let missing = |field| self.reject(raw, Some(position), DecodeErrorKind::MissingField(field));

        let subject = non_empty(envelope.did).ok_or_else(|| missing("did"))?;
        let commit = envelope.commit.ok_or_else(|| missing("commit"))?;
        let op_str = non_empty(commit.operation).ok_or_else(|| missing("commit.operation"))?;
        let collection = non_empty(commit.collection).ok_or_else(|| missing("commit.collection"))?;
        let rkey = non_empty(commit.rkey).ok_or_else(|| missing("commit.rkey"))?;

        let Some(operation) = Operation::parse(&op_str) else {
            return Ok(Decoded::Ignored {
                position: Some(position),
                reason: IgnoreReason::UnsupportedOperation(op_str),
            });
        };

        let key = RecordKey {
            subject,
            collection,
            rkey,
        };

        let event = match operation {
            Operation::Delete => CommitEvent::delete(key, position),
            Operation::Create | Operation::Update => {
                let cid = non_empty(commit.cid).ok_or_else(|| missing("commit.cid"))?;
                let record = commit
                    .record
                    .filter(|r| !r.is_null())
                    .ok_or_else(|| missing("commit.record"))?;
                CommitEvent {
                    key,
                    operation,
                    content_hash: Some(cid),
                    payload: Some(record),
                    position,
                }
            }
        };

        Ok(Decoded::Commit(event))
    }

    fn reject(
        &self,
        raw: &RawMessage,
        position: Option<Position>,
        kind: DecodeErrorKind,
    ) -> DecodeError {
        DecodeError {
            kind,
            position,
            raw: preview(&raw.body),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn preview(body: &str) -> String {
    if body.len() <= RAW_PREVIEW_BYTES {
        return body.to_string();
    }
    let mut end = RAW_PREVIEW_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
