//! TCP transport for a relay that speaks newline-delimited Jetstream JSON.
//!
//! On connect we send one line, `{"cursor":N}` or `{}` for the live tail,
//! then every non-empty line received is one raw message. EOF or a read
//! error ends the stream, which the supervisor treats as a disconnect.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use jetmirror_engine::{FeedTransport, RawStream, TransportError};
use jetmirror_events::{Position, RawMessage};

pub struct LineFeed {
    addr: String,
    connect_timeout: Duration,
}

impl LineFeed {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Keeps the write half alive so the relay does not see a half-close.
struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    _write: OwnedWriteHalf,
}

#[async_trait]
impl FeedTransport for LineFeed {
    async fn subscribe(&self, from: Option<Position>) -> Result<RawStream, TransportError> {
        let connect = TcpStream::connect(&self.addr);
        let socket = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(TransportError::Connect(format!("{}: {e}", self.addr))),
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "{}: timed out after {:?}",
                    self.addr, self.connect_timeout
                )))
            }
        };
        socket.set_nodelay(true)?;

        let (read, mut write) = socket.into_split();
        let hello = match from {
            Some(position) => json!({ "cursor": position }),
            None => json!({}),
        };
        write
            .write_all(format!("{hello}\n").as_bytes())
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {e}", self.addr)))?;
        debug!(addr = %self.addr, cursor = ?from.map(Position::as_i64), "Subscribed to feed");

        let connection = Connection {
            lines: BufReader::new(read).lines(),
            _write: write,
        };

        let messages = stream::unfold(Some(connection), |state| async move {
            let mut connection = state?;
            loop {
                match connection.lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => return Some((Ok(RawMessage::new(line)), Some(connection))),
                    Ok(None) => return None,
                    Err(e) => return Some((Err(TransportError::from(e)), None)),
                }
            }
        });
        Ok(messages.boxed())
    }
}
