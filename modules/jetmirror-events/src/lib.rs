//! Commit events observed on the record feed, and the decoder that produces them.
//!
//! The feed carries opaque documents identified by (subject, collection, rkey).
//! Nothing here knows about storage; the decoder only validates and normalizes.

pub mod decoder;
pub mod types;

pub use decoder::{
    DecodeError, DecodeErrorKind, Decoded, EventDecoder, IgnoreReason, DEFAULT_MAX_MESSAGE_BYTES,
};
pub use types::{CommitEvent, Operation, Position, RawMessage, RecordKey};
