//! Process edge of the materializer: configuration and the TCP feed.

pub mod config;
pub mod line_feed;

pub use config::{redact_url, ServerConfig};
pub use line_feed::LineFeed;
