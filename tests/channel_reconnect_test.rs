//! Integration tests for the notification channel against an in-process
//! WebSocket server.
//!
//! Each test binds a local TCP listener and speaks the frame protocol by
//! hand: welcome, subscribe command, confirm_subscription, message frames.
//! This pins down the handshake order, reconnect-with-resubscribe behavior,
//! and teardown semantics without a real server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};

use studyhub_notify::channel::{ChannelError, NotificationChannelClient};
use studyhub_notify::config::Config;
use studyhub_notify::model::Notification;
use studyhub_notify::session::{
    AuthError, RefreshedTokens, Session, SessionTokenManager, TokenRefresher,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct NoopRefresher;

#[async_trait]
impl TokenRefresher for NoopRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
        Err(AuthError::Transport("not under test".into()))
    }
}

fn session_manager() -> SessionTokenManager {
    SessionTokenManager::new(
        Session {
            access_token: "token-1".into(),
            refresh_token: "refresh-1".into(),
            expires_at: Utc::now() + ChronoDuration::seconds(300),
        },
        Arc::new(NoopRefresher),
    )
}

/// Config pointed at the local listener with near-zero backoff so
/// reconnect tests run fast.
fn test_config(addr: std::net::SocketAddr) -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Config::new(format!("http://{addr}"));
    config.initial_backoff = Duration::from_millis(20);
    config.max_backoff = Duration::from_millis(100);
    config.backoff_jitter = Duration::from_millis(1);
    config
}

/// Accept one connection and drive the subscribe handshake, returning the
/// open socket and the topic the client subscribed to.
async fn serve_subscription(stream: TcpStream) -> (WebSocketStream<TcpStream>, String) {
    let mut ws = accept_async(stream).await.expect("handshake");
    ws.send(Message::Text(r#"{"type":"welcome"}"#.to_string()))
        .await
        .expect("send welcome");

    let topic = match ws.next().await {
        Some(Ok(Message::Text(text))) => {
            let cmd: serde_json::Value = serde_json::from_str(&text).expect("subscribe json");
            assert_eq!(cmd["command"], "subscribe");
            cmd["topic"].as_str().expect("topic").to_string()
        }
        other => panic!("expected subscribe command, got {other:?}"),
    };

    ws.send(Message::Text(
        r#"{"type":"confirm_subscription"}"#.to_string(),
    ))
    .await
    .expect("send confirm");

    (ws, topic)
}

fn message_frame(id: &str, created_at: &str) -> Message {
    Message::Text(
        serde_json::json!({
            "type": "message",
            "payload": {
                "id": id,
                "recipientId": "u-1",
                "actorId": "u-2",
                "type": "LIKE",
                "message": "Bob liked your post",
                "createdAt": created_at,
                "isRead": false
            }
        })
        .to_string(),
    )
}

async fn recv_notification(rx: &mut mpsc::Receiver<Notification>) -> Notification {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("push queue closed")
}

#[tokio::test]
async fn test_subscribe_handshake_and_delivery() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut ws, topic) = serve_subscription(stream).await;
        assert_eq!(topic, "/user/u-1/queue/notifications");
        ws.send(message_frame("n-1", "2026-03-01T09:30:00Z"))
            .await
            .unwrap();
        // Hold the connection open until the client tears down.
        while ws.next().await.is_some() {}
    });

    let (tx, mut rx) = mpsc::channel(16);
    let mut client = NotificationChannelClient::new(test_config(addr), session_manager());
    let handle = client.connect("u-1", tx).await.unwrap();

    let n = recv_notification(&mut rx).await;
    assert_eq!(n.id, "n-1");

    handle.disconnect();
    assert!(!handle.is_active());
    server.await.unwrap();
}

#[tokio::test]
async fn test_reconnect_resubscribes_after_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        // First connection: deliver one message, then drop the socket.
        let (stream, _) = listener.accept().await.unwrap();
        let (mut ws, topic) = serve_subscription(stream).await;
        assert_eq!(topic, "/user/u-1/queue/notifications");
        ws.send(message_frame("n-1", "2026-03-01T09:30:00Z"))
            .await
            .unwrap();
        drop(ws);

        // Second connection: the client must redo the full handshake.
        let (stream, _) = listener.accept().await.unwrap();
        let (mut ws, topic) = serve_subscription(stream).await;
        assert_eq!(topic, "/user/u-1/queue/notifications");
        ws.send(message_frame("n-2", "2026-03-01T09:31:00Z"))
            .await
            .unwrap();
        // Keep the connection alive until the test is done.
        let _ = done_rx.await;
    });

    let (tx, mut rx) = mpsc::channel(16);
    let mut client = NotificationChannelClient::new(test_config(addr), session_manager());
    let handle = client.connect("u-1", tx).await.unwrap();

    let first = recv_notification(&mut rx).await;
    assert_eq!(first.id, "n-1");
    let second = recv_notification(&mut rx).await;
    assert_eq!(second.id, "n-2");

    // Exactly one delivery per message across the reconnect.
    assert!(rx.try_recv().is_err());

    handle.disconnect();
    let _ = done_tx.send(());
    server.await.unwrap();
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut ws, _) = serve_subscription(stream).await;
        ws.send(Message::Text("not json".to_string())).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"message","payload":{"id":42}}"#.to_string(),
        ))
        .await
        .unwrap();
        ws.send(message_frame("n-3", "2026-03-01T09:32:00Z"))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let (tx, mut rx) = mpsc::channel(16);
    let mut client = NotificationChannelClient::new(test_config(addr), session_manager());
    let handle = client.connect("u-1", tx).await.unwrap();

    // Only the well-formed frame arrives; the loop survived the garbage.
    let n = recv_notification(&mut rx).await;
    assert_eq!(n.id, "n-3");

    handle.disconnect();
    server.await.unwrap();
}

#[tokio::test]
async fn test_invalidated_session_stops_reconnecting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (drop_tx, drop_rx) = oneshot::channel::<()>();

    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = Arc::clone(&accepts);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        server_accepts.fetch_add(1, Ordering::SeqCst);
        let (ws, _) = serve_subscription(stream).await;
        let _ = drop_rx.await;
        drop(ws);

        // Count any reconnection attempt after the session died.
        while let Ok((stream, _)) = listener.accept().await {
            server_accepts.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let session = session_manager();
    let (tx, _rx) = mpsc::channel(16);
    let mut client = NotificationChannelClient::new(test_config(addr), session.clone());
    let handle = client.connect("u-1", tx).await.unwrap();

    session.logout();
    let _ = drop_tx.send(());

    // Give the loop ample time to misbehave if it were going to retry.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 1, "reconnect after logout");
    assert_eq!(
        handle.state().await,
        studyhub_notify::channel::ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_connect_after_logout_reports_invalid_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (_ws, _) = serve_subscription(stream).await;
        let _ = done_rx.await;
    });

    let session = session_manager();
    let (tx, _rx) = mpsc::channel(16);
    let mut client = NotificationChannelClient::new(test_config(addr), session.clone());
    let handle = client.connect("u-1", tx).await.unwrap();

    session.logout();

    // The loop observes the invalidation and winds down; the handle must
    // report that death, not just explicit disconnects.
    tokio::time::timeout(RECV_TIMEOUT, async {
        while handle.is_active() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("loop never wound down after logout");

    // Re-connecting must not hand back the dead handle.
    let (tx, _rx) = mpsc::channel(16);
    let err = client.connect("u-1", tx).await.unwrap_err();
    assert!(matches!(err, ChannelError::SessionInvalid));
    let _ = done_tx.send(());
}

#[tokio::test]
async fn test_auth_rejection_surfaces_at_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let reject = |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
            let mut response = ErrorResponse::new(Some("bad token".to_string()));
            *response.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
            Err(response)
        };
        let _ = accept_hdr_async(stream, reject).await;
    });

    let (tx, _rx) = mpsc::channel(16);
    let mut client = NotificationChannelClient::new(test_config(addr), session_manager());
    let err = client.connect("u-1", tx).await.unwrap_err();
    assert!(matches!(err, ChannelError::AuthRejected));
}

#[tokio::test]
async fn test_connect_is_idempotent_per_user() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepts = Arc::new(AtomicUsize::new(0));
    let server_accepts = Arc::clone(&accepts);
    tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            server_accepts.fetch_add(1, Ordering::SeqCst);
            let (ws, _) = serve_subscription(stream).await;
            open.push(ws);
        }
    });

    let (tx, _rx) = mpsc::channel(16);
    let mut client = NotificationChannelClient::new(test_config(addr), session_manager());
    let first = client.connect("u-1", tx.clone()).await.unwrap();
    let second = client.connect("u-1", tx).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 1, "same user reuses the connection");

    // Both handles control the same subscription.
    second.disconnect();
    assert!(!first.is_active());
}
