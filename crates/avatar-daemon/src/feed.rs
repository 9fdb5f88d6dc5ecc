//! Live feed listener: one WebSocket connection per confirmed room.
//!
//! The listener never reconnects on its own.  Any error or close from the
//! far side ends in `Disconnected`; the operator re-confirms the room to
//! open a fresh connection.  Every update carries the connection number it
//! belongs to so the core can ignore stragglers from a closed connection.

use anyhow::{Context, Result};
use avatar_proto::protocol::{FeedEvent, FeedStatus};
use avatar_proto::room::RoomId;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Status(FeedStatus),
    Event(FeedEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    pub connection: u64,
    pub signal: FeedSignal,
}

/// A running listener.  Dropping the handle does not stop it; call `close`.
pub struct FeedHandle {
    connection: u64,
    shutdown: Arc<Notify>,
}

impl FeedHandle {
    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// Ask the listener to send a close frame and stop.
    pub fn close(self) {
        debug!("feed: closing connection {}", self.connection);
        self.shutdown.notify_one();
    }
}

/// `<ws base>/ws/<room>`.
pub fn feed_url(ws_base: &str, room: &RoomId) -> Result<String> {
    let mut url =
        Url::parse(ws_base).with_context(|| format!("Invalid feed base URL {:?}", ws_base))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        anyhow::bail!("Feed base URL must use ws:// or wss://, got {}", url.scheme());
    }
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Feed base URL cannot carry a path: {}", ws_base))?
        .pop_if_empty()
        .extend(["ws", room.as_str()]);
    Ok(url.to_string())
}

/// Start listening on `url`.  Updates go to `tx` in order.
pub fn spawn<T>(url: String, connection: u64, tx: mpsc::Sender<T>) -> FeedHandle
where
    T: From<FeedUpdate> + Send + 'static,
{
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(run(url, connection, tx, shutdown.clone()));
    FeedHandle {
        connection,
        shutdown,
    }
}

async fn emit<T: From<FeedUpdate>>(tx: &mpsc::Sender<T>, connection: u64, signal: FeedSignal) -> bool {
    tx.send(FeedUpdate { connection, signal }.into()).await.is_ok()
}

async fn run<T>(url: String, connection: u64, tx: mpsc::Sender<T>, shutdown: Arc<Notify>)
where
    T: From<FeedUpdate> + Send + 'static,
{
    if !emit(&tx, connection, FeedSignal::Status(FeedStatus::Connecting)).await {
        return;
    }
    info!("feed: connecting to {}", url);

    let connected = tokio::select! {
        _ = shutdown.notified() => None,
        result = connect_async(url.as_str()) => Some(result),
    };
    let stream = match connected {
        Some(Ok((stream, _response))) => stream,
        Some(Err(e)) => {
            warn!("feed: connection to {} failed: {}", url, e);
            emit(&tx, connection, FeedSignal::Status(FeedStatus::Disconnected)).await;
            return;
        }
        None => {
            emit(&tx, connection, FeedSignal::Status(FeedStatus::Disconnected)).await;
            return;
        }
    };

    info!("feed: connected ({})", connection);
    if !emit(&tx, connection, FeedSignal::Status(FeedStatus::Connected)).await {
        return;
    }

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_message(&text) {
                        if !emit(&tx, connection, FeedSignal::Event(event)).await {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("feed: closed by server: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("feed: receive error: {}", e);
                    break;
                }
                None => {
                    info!("feed: stream ended");
                    break;
                }
            }
        }
    }

    emit(&tx, connection, FeedSignal::Status(FeedStatus::Disconnected)).await;
}

/// Parse one inbound text frame.  Upstream `status` notices are logged;
/// malformed or unknown payloads are dropped.
pub fn parse_message(text: &str) -> Option<FeedEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("feed: dropping non-JSON message: {}", e);
            return None;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("status") => {
            let status = value.get("status").and_then(Value::as_str).unwrap_or("?");
            info!("feed: upstream status {}", status);
            None
        }
        Some("chat" | "gift" | "like") => match serde_json::from_value(value) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("feed: dropping malformed event: {}", e);
                None
            }
        },
        other => {
            warn!("feed: dropping message of unknown type {:?}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<FeedUpdate>) -> FeedSignal {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("feed update timed out")
            .expect("feed channel closed")
            .signal
    }

    #[test]
    fn test_feed_url() {
        assert_eq!(
            feed_url("ws://localhost:8000", &room("abc123")).unwrap(),
            "ws://localhost:8000/ws/abc123"
        );
        assert_eq!(
            feed_url("wss://feed.example/live/", &room("a.b_c")).unwrap(),
            "wss://feed.example/live/ws/a.b_c"
        );
        assert!(feed_url("http://localhost:8000", &room("abc")).is_err());
    }

    #[test]
    fn test_parse_message() {
        assert!(matches!(
            parse_message(r#"{"type":"chat","user_nickname":"kim","content":"hi"}"#),
            Some(FeedEvent::Chat { .. })
        ));
        assert!(parse_message(r#"{"type":"status","status":"reconnecting"}"#).is_none());
        assert!(parse_message(r#"{"type":"follow"}"#).is_none());
        assert!(parse_message(r#"{"content":"no type"}"#).is_none());
        assert!(parse_message(r#"{"type":"gift","repeat_count":"lots"}"#).is_none());
        assert!(parse_message("not json").is_none());
    }

    #[tokio::test]
    async fn test_events_then_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for frame in [
                r#"{"type":"status","status":"connected"}"#,
                r#"{"type":"chat","content":"hello"}"#,
                "{broken",
                r#"{"type":"gift","gift_name":"Rose","repeat_count":2,"motion_tag":"gift_level_1"}"#,
            ] {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            ws.close(None).await.unwrap();
        });

        let (tx, mut rx) = mpsc::channel::<FeedUpdate>(16);
        let handle = spawn(format!("ws://{}/ws/abc", addr), 7, tx);
        assert_eq!(handle.connection(), 7);

        assert_eq!(next(&mut rx).await, FeedSignal::Status(FeedStatus::Connecting));
        assert_eq!(next(&mut rx).await, FeedSignal::Status(FeedStatus::Connected));
        assert!(matches!(next(&mut rx).await, FeedSignal::Event(FeedEvent::Chat { .. })));
        match next(&mut rx).await {
            FeedSignal::Event(event) => assert_eq!(event.reaction().unwrap().repeat_count, 2),
            other => panic!("expected gift, got {:?}", other),
        }
        assert_eq!(next(&mut rx).await, FeedSignal::Status(FeedStatus::Disconnected));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_does_not_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::channel::<FeedUpdate>(16);
        let _handle = spawn(format!("ws://{}/ws/abc", addr), 1, tx);
        assert_eq!(next(&mut rx).await, FeedSignal::Status(FeedStatus::Connecting));
        assert_eq!(next(&mut rx).await, FeedSignal::Status(FeedStatus::Disconnected));

        // Task ends and drops its sender: nothing more arrives
        let rest = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(rest.is_none());
    }

    #[tokio::test]
    async fn test_close_cancels_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // Drain until the client closes
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (tx, mut rx) = mpsc::channel::<FeedUpdate>(16);
        let handle = spawn(format!("ws://{}/ws/abc", addr), 2, tx);
        assert_eq!(next(&mut rx).await, FeedSignal::Status(FeedStatus::Connecting));
        assert_eq!(next(&mut rx).await, FeedSignal::Status(FeedStatus::Connected));

        handle.close();
        assert_eq!(next(&mut rx).await, FeedSignal::Status(FeedStatus::Disconnected));
    }
}
