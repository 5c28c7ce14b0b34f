//! Core types for the record feed. Storage-agnostic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic marker of an event's place in the feed.
///
/// Jetstream uses the event's `time_us`; the engine only relies on ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(pub i64);

impl Position {
    /// The position immediately after this one.
    pub fn next(self) -> Self {
        Position(self.0.saturating_add(1))
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for Position {
    fn from(value: i64) -> Self {
        Position(value)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addresses one logical record: (subject, collection, rkey).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub subject: String,
    pub collection: String,
    pub rkey: String,
}

impl RecordKey {
    pub fn new(
        subject: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subject, self.collection, self.rkey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Parse the feed's operation string. Unknown operations return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single validated mutation. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub key: RecordKey,
    pub operation: Operation,
    /// Content-addressed id of the record body. Absent for deletes.
    pub content_hash: Option<String>,
    /// The record document. Absent for deletes.
    pub payload: Option<serde_json::Value>,
    pub position: Position,
}

impl CommitEvent {
    pub fn create(
        key: RecordKey,
        position: impl Into<Position>,
        content_hash: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            key,
            operation: Operation::Create,
            content_hash: Some(content_hash.into()),
            payload: Some(payload),
            position: position.into(),
        }
    }

    pub fn update(
        key: RecordKey,
        position: impl Into<Position>,
        content_hash: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            operation: Operation::Update,
            ..Self::create(key, position, content_hash, payload)
        }
    }

    pub fn delete(key: RecordKey, position: impl Into<Position>) -> Self {
        Self {
            key,
            operation: Operation::Delete,
            content_hash: None,
            payload: None,
            position: position.into(),
        }
    }
}

/// One message as handed over by the feed transport.
///
/// Transports that can cheaply read the position set it; otherwise the
/// decoder pulls it from the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub position: Option<Position>,
    pub body: String,
}

impl RawMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            position: None,
            body: body.into(),
        }
    }

    pub fn with_position(mut self, position: impl Into<Position>) -> Self {
        self.position = Some(position.into());
        self
    }
}
