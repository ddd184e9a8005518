//! Live push channel for per-user notification delivery.
//!
//! This module owns the one authenticated subscription a user holds on the
//! notification topic, including connect/reconnect/teardown.
//!
//! # Architecture
//!
//! ```text
//! NotificationChannelClient
//!     ├── ws transport (src/ws.rs, tokio-tungstenite)
//!     ├── subscribe handshake (welcome → subscribe → confirm_subscription)
//!     ├── reconnection (capped exponential backoff with jitter)
//!     └── delivery into the store's push queue (mpsc)
//! ```
//!
//! Messages are pushed into an `mpsc` queue consumed by the store's single
//! writer; the channel never mutates store state itself. Auth rejections
//! stop the loop (the session must be refreshed and `connect` re-invoked);
//! transport failures reconnect automatically while the session is valid.

pub mod client;

use std::sync::Arc;
use tokio::sync::RwLock;

/// Connection state for the per-user subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Transport connecting / waiting for the welcome frame.
    Connecting,
    /// Transport up, subscription not yet confirmed.
    Connected,
    /// Subscription confirmed; messages are being delivered.
    Subscribed,
    /// Waiting out the backoff before another attempt.
    Reconnecting {
        /// Current reconnection attempt number.
        attempt: u32,
        /// Milliseconds until the next retry.
        next_retry_ms: u64,
    },
}

/// Errors surfaced by the channel client.
#[derive(Debug)]
pub enum ChannelError {
    /// The server rejected the token at the handshake. Not retried here;
    /// refresh the session and call `connect` again.
    AuthRejected,
    /// Failed to establish the connection or subscription.
    ConnectionFailed(String),
    /// The session is invalid; no connection will be attempted.
    SessionInvalid,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthRejected => write!(f, "Channel authentication rejected"),
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::SessionInvalid => write!(f, "Session invalid"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Shared connection state that can be observed from outside the channel.
#[derive(Debug, Default)]
pub struct SharedConnectionState {
    state: RwLock<ConnectionState>,
}

impl SharedConnectionState {
    /// Create new shared state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the current state.
    pub async fn get(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// Set the state.
    pub async fn set(&self, new_state: ConnectionState) {
        *self.state.write().await = new_state;
    }

    /// Check whether the subscription is live.
    pub async fn is_subscribed(&self) -> bool {
        matches!(*self.state.read().await, ConnectionState::Subscribed)
    }
}

// Re-exports
pub use client::{ChannelHandle, NotificationChannelClient};
