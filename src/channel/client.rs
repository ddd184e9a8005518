//! Per-user notification channel client.
//!
//! [`NotificationChannelClient`] owns at most one live subscription at a
//! time. `connect` is idempotent per user: re-connecting the same user
//! while the subscription is alive returns the existing handle, and
//! connecting a different user tears the previous subscription down first.
//!
//! The wire protocol is JSON frames over WebSocket: the server sends
//! `welcome` after the handshake, the client sends a `subscribe` command
//! naming the per-user topic, the server answers `confirm_subscription`,
//! and notifications then arrive as `message` frames. Resubscription is
//! always re-performed after a reconnect before any message is accepted.

use rand::random;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::constants;
use crate::model::Notification;
use crate::session::{SessionPhase, SessionTokenManager};
use crate::ws::{self, ConnectError, WsMessage, WsReader, WsWriter};

use super::{ChannelError, ConnectionState, SharedConnectionState};

/// WebSocket endpoint path on the server.
const WS_PATH: &str = "/ws";

/// Subscribe command sent after the welcome frame.
#[derive(Debug, Serialize)]
struct SubscribeCommand<'a> {
    command: &'static str,
    topic: &'a str,
}

/// Incoming server frame.
#[derive(Debug, Deserialize)]
struct ServerFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

/// Why the message loop ended.
#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    /// Handle disconnected or client torn down.
    Shutdown,
    /// Session invalidated; stop retrying entirely.
    SessionDead,
    /// Transport dropped; reconnect with backoff.
    TransportLost,
}

/// Failure while establishing a subscribed connection.
enum EstablishError {
    /// Token rejected at handshake or subscription refused.
    Unauthorized,
    /// Anything else; worth retrying.
    Transport(String),
}

/// Handle to a live subscription.
///
/// Cloneable; all clones control the same underlying connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    cancel: CancellationToken,
    state: Arc<SharedConnectionState>,
}

impl ChannelHandle {
    /// Tear down the subscription and stop the reconnect loop.
    ///
    /// Idempotent: safe to call repeatedly or after the connection already
    /// died. Never fails.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Whether the handle still drives a live (or reconnecting) loop.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Observe the current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.state.get().await
    }
}

/// Client owning the single per-user notification subscription.
#[derive(Debug)]
pub struct NotificationChannelClient {
    config: Config,
    session: SessionTokenManager,
    current: Option<(String, ChannelHandle)>,
}

impl NotificationChannelClient {
    /// Create a client. No connection is made until [`connect`].
    ///
    /// [`connect`]: NotificationChannelClient::connect
    pub fn new(config: Config, session: SessionTokenManager) -> Self {
        Self {
            config,
            session,
            current: None,
        }
    }

    /// Topic a user's notifications are published on.
    pub fn topic_for(user_id: &str) -> String {
        format!("/user/{user_id}/queue/notifications")
    }

    /// Connect and subscribe for `user_id`, delivering pushed
    /// notifications into `sink`.
    ///
    /// Idempotent per user: if a live subscription for the same user
    /// exists, its handle is returned and no new connection is made. A
    /// different user tears the previous subscription down first.
    ///
    /// The first connection attempt happens inline so that a bad token is
    /// reported here instead of being retried in the background. Transport
    /// failures on the first attempt are not errors; the background loop
    /// takes over and retries with backoff.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::SessionInvalid` if no session is live, or
    /// `ChannelError::AuthRejected` if the server refuses the token. After
    /// `AuthRejected` the caller should refresh the session and re-invoke.
    pub async fn connect(
        &mut self,
        user_id: &str,
        sink: mpsc::Sender<Notification>,
    ) -> Result<ChannelHandle, ChannelError> {
        // A dead session makes any existing handle useless, so this check
        // comes before the reuse shortcut.
        let token = self
            .session
            .current_token()
            .ok_or(ChannelError::SessionInvalid)?;

        if let Some((current_user, handle)) = &self.current {
            if current_user == user_id && handle.is_active() {
                log::debug!("Already subscribed for {}, reusing handle", user_id);
                return Ok(handle.clone());
            }
            log::info!("Tearing down subscription for {}", current_user);
            handle.disconnect();
            self.current = None;
        }

        let topic = Self::topic_for(user_id);
        let state = SharedConnectionState::new();
        state.set(ConnectionState::Connecting).await;

        // First attempt inline: auth rejection must surface to the caller.
        let initial = match establish(&self.config.server_url, &topic, &token, &state).await {
            Ok(conn) => Some(conn),
            Err(EstablishError::Unauthorized) => {
                state.set(ConnectionState::Disconnected).await;
                return Err(ChannelError::AuthRejected);
            }
            Err(EstablishError::Transport(msg)) => {
                log::warn!("Initial connect failed, will retry in background: {}", msg);
                None
            }
        };

        let cancel = CancellationToken::new();
        let handle = ChannelHandle {
            cancel: cancel.clone(),
            state: Arc::clone(&state),
        };

        let config = self.config.clone();
        let session = self.session.clone();
        let loop_topic = topic.clone();
        tokio::spawn(async move {
            run_connection_loop(config, session, loop_topic, state, sink, cancel, initial).await;
        });

        self.current = Some((user_id.to_string(), handle.clone()));
        Ok(handle)
    }

    /// Handle of the current subscription, if any.
    pub fn current_handle(&self) -> Option<&ChannelHandle> {
        self.current.as_ref().map(|(_, handle)| handle)
    }

    /// Tear down the current subscription, if any. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some((user_id, handle)) = self.current.take() {
            log::info!("Disconnecting subscription for {}", user_id);
            handle.disconnect();
        }
    }
}

impl Drop for NotificationChannelClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Run the connection loop with automatic reconnection.
///
/// `initial` carries a connection already subscribed by `connect`; later
/// iterations establish their own. The loop exits on handle disconnect,
/// session invalidation, or auth rejection - never silently.
async fn run_connection_loop(
    config: Config,
    session: SessionTokenManager,
    topic: String,
    state: Arc<SharedConnectionState>,
    sink: mpsc::Sender<Notification>,
    cancel: CancellationToken,
    mut initial: Option<(WsWriter, WsReader)>,
) {
    let mut session_rx = session.subscribe();
    let mut backoff = config.initial_backoff;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if session.phase() == SessionPhase::Invalidated {
            log::info!("Session invalid, stopping channel loop for {}", topic);
            break;
        }

        let conn = match initial.take() {
            Some(conn) => Some(conn),
            None => {
                let Some(token) = session.current_token() else {
                    break;
                };
                state.set(ConnectionState::Connecting).await;

                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = establish(&config.server_url, &topic, &token, &state) => result,
                };

                match result {
                    Ok(conn) => Some(conn),
                    Err(EstablishError::Unauthorized) => {
                        // A refreshed session re-invokes connect; retrying
                        // here would hammer the server with a dead token.
                        log::error!("Subscription auth rejected for {}", topic);
                        break;
                    }
                    Err(EstablishError::Transport(msg)) => {
                        log::warn!("Failed to connect to {}: {}", topic, msg);
                        None
                    }
                }
            }
        };

        if let Some((mut write, mut read)) = conn {
            state.set(ConnectionState::Subscribed).await;
            backoff = config.initial_backoff;
            attempt = 0;
            log::info!("Subscribed to {}", topic);

            let exit = run_message_loop(
                &mut write,
                &mut read,
                &sink,
                &cancel,
                &mut session_rx,
            )
            .await;

            match exit {
                LoopExit::Shutdown => {
                    log::info!("Channel shutdown requested");
                    break;
                }
                LoopExit::SessionDead => {
                    log::info!("Session invalidated, stopping channel loop");
                    break;
                }
                LoopExit::TransportLost => {
                    log::warn!("Disconnected from {}", topic);
                }
            }
        }

        // Exponential backoff with jitter before the next attempt.
        attempt += 1;
        let jitter_ms = random::<u64>() % config.backoff_jitter.as_millis().max(1) as u64;
        let wait = backoff + Duration::from_millis(jitter_ms);
        state
            .set(ConnectionState::Reconnecting {
                attempt,
                next_retry_ms: wait.as_millis() as u64,
            })
            .await;
        log::info!(
            "Reconnecting to {} in {:.1}s (attempt {})",
            topic,
            wait.as_secs_f32(),
            attempt
        );

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => break,
        }

        backoff = (backoff * 2).min(config.max_backoff);
    }

    // Handle liveness tracks the loop itself, not just explicit
    // disconnects: once the loop is gone, `is_active()` must say so.
    cancel.cancel();
    state.set(ConnectionState::Disconnected).await;
}

/// Connect the transport and complete the subscribe handshake.
///
/// Subscription state never survives a reconnect, so this runs in full on
/// every attempt: welcome, subscribe command, confirmation.
async fn establish(
    server_url: &str,
    topic: &str,
    token: &str,
    state: &SharedConnectionState,
) -> Result<(WsWriter, WsReader), EstablishError> {
    let (mut write, mut read) = ws::connect(server_url, WS_PATH, token)
        .await
        .map_err(|e| match e {
            ConnectError::Unauthorized => EstablishError::Unauthorized,
            ConnectError::Failed(msg) => EstablishError::Transport(msg),
        })?;

    await_frame(&mut read, "welcome", constants::WELCOME_TIMEOUT).await?;
    state.set(ConnectionState::Connected).await;

    let subscribe = SubscribeCommand {
        command: "subscribe",
        topic,
    };
    let text = serde_json::to_string(&subscribe)
        .map_err(|e| EstablishError::Transport(format!("subscribe encode: {e}")))?;
    write
        .send_text(&text)
        .await
        .map_err(|e| EstablishError::Transport(e.to_string()))?;

    await_frame(&mut read, "confirm_subscription", constants::SUBSCRIBE_TIMEOUT).await?;

    Ok((write, read))
}

/// Wait for a frame of the given type, ignoring pings and unknown frames.
async fn await_frame(
    read: &mut WsReader,
    expected: &str,
    timeout: Duration,
) -> Result<(), EstablishError> {
    let wait = tokio::time::timeout(timeout, async {
        while let Some(msg) = read.next().await {
            if let WsMessage::Text(text) = msg {
                if let Ok(frame) = serde_json::from_str::<ServerFrame>(&text) {
                    if frame.frame_type == expected {
                        return Ok(());
                    }
                    if frame.frame_type == "reject_subscription" {
                        return Err(EstablishError::Unauthorized);
                    }
                }
            }
        }
        Err(EstablishError::Transport(format!(
            "connection closed before {expected}"
        )))
    })
    .await;

    match wait {
        Ok(result) => result,
        Err(_) => Err(EstablishError::Transport(format!(
            "timeout waiting for {expected}"
        ))),
    }
}

/// Pump messages until the connection drops or teardown is requested.
async fn run_message_loop(
    write: &mut WsWriter,
    read: &mut WsReader,
    sink: &mpsc::Sender<Notification>,
    cancel: &CancellationToken,
    session_rx: &mut watch::Receiver<SessionPhase>,
) -> LoopExit {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return LoopExit::Shutdown,

            changed = session_rx.changed() => {
                if changed.is_err() || *session_rx.borrow() == SessionPhase::Invalidated {
                    return LoopExit::SessionDead;
                }
            }

            msg = read.next() => {
                match msg {
                    None | Some(WsMessage::Close) => return LoopExit::TransportLost,
                    Some(WsMessage::Ping(data)) => {
                        if write.send_pong(data).await.is_err() {
                            log::warn!("Failed to send pong");
                            return LoopExit::TransportLost;
                        }
                    }
                    Some(WsMessage::Text(text)) => {
                        if let Some(notification) = parse_push(&text) {
                            if sink.send(notification).await.is_err() {
                                log::warn!("Push queue closed, shutting channel down");
                                return LoopExit::Shutdown;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Parse a `message` frame into a notification.
///
/// Malformed payloads are logged and dropped; they never reach the store
/// and never abort the loop.
fn parse_push(text: &str) -> Option<Notification> {
    let frame = match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Dropping unparseable frame: {}", e);
            return None;
        }
    };

    match frame.frame_type.as_str() {
        "message" => {
            let payload = frame.payload?;
            match serde_json::from_value::<Notification>(payload) {
                Ok(notification) => Some(notification),
                Err(e) => {
                    log::warn!("Dropping malformed notification payload: {}", e);
                    None
                }
            }
        }
        "ping" => None,
        other => {
            log::debug!("Ignoring frame type {:?}", other);
            None
        }
    }
}
