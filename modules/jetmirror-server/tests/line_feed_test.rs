//! LineFeed against a throwaway TCP relay on localhost.

use futures::StreamExt;
use jetmirror_engine::{FeedTransport, TransportError};
use jetmirror_events::Position;
use jetmirror_server::LineFeed;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Accepts one connection, returns the subscribe line it received, and
/// writes `lines` back before closing.
async fn relay(lines: Vec<&'static str>) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut hello = String::new();
        BufReader::new(read).read_line(&mut hello).await.unwrap();
        for line in lines {
            write.write_all(line.as_bytes()).await.unwrap();
            write.write_all(b"\n").await.unwrap();
        }
        write.shutdown().await.unwrap();
        hello
    });
    (addr, handle)
}

#[tokio::test]
async fn sends_cursor_and_streams_lines_until_eof() {
    let (addr, relay) = relay(vec![r#"{"did":"a","time_us":42}"#, "", r#"{"did":"b","time_us":43}"#]).await;

    let stream = LineFeed::new(addr).subscribe(Some(Position(42))).await.unwrap();
    let messages: Vec<_> = stream.collect().await;

    assert_eq!(relay.await.unwrap().trim(), r#"{"cursor":42}"#);
    assert_eq!(messages.len(), 2, "blank lines are skipped");
    assert_eq!(messages[0].as_ref().unwrap().body, r#"{"did":"a","time_us":42}"#);
    assert!(messages[0].as_ref().unwrap().position.is_none());
}

#[tokio::test]
async fn live_tail_sends_empty_object() {
    let (addr, relay) = relay(vec![]).await;

    let stream = LineFeed::new(addr).subscribe(None).await.unwrap();
    assert_eq!(stream.count().await, 0);
    assert_eq!(relay.await.unwrap().trim(), "{}");
}

#[tokio::test]
async fn unreachable_relay_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let result = LineFeed::new(addr).subscribe(None).await;
    assert!(matches!(result, Err(TransportError::Connect(_))));
}
