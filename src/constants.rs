//! Application-wide constants for studyhub-notify.
//!
//! This module centralizes timeouts, intervals, and backoff parameters so
//! tuning happens in one place. Constants are grouped by domain with
//! documentation explaining their purpose.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for gateway and token-refresh calls.
///
/// 10 seconds is sufficient for the notification API while preventing
/// indefinite hangs on network issues.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the server's welcome frame after the WebSocket
/// handshake before treating the connection as failed.
pub const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the subscription confirmation after sending the
/// subscribe command. No message is accepted before this confirmation.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Reconnection backoff
// ============================================================================

/// Initial delay before the first reconnection attempt.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the reconnection delay.
///
/// The delay doubles on every failed attempt until it reaches this cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Maximum random jitter added to each reconnection delay.
///
/// Spreads simultaneous reconnects out so clients do not stampede the
/// server after an outage.
pub const BACKOFF_JITTER: Duration = Duration::from_millis(1000);

// ============================================================================
// Background intervals
// ============================================================================

/// Interval between baseline fetches.
///
/// The baseline fetch fills any gap the live channel missed across a
/// reconnect, so it runs even while the channel is healthy.
pub const BASELINE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between background token refreshes.
///
/// Short enough that the access token is replaced well before its typical
/// expiry, long enough to keep auth traffic negligible.
pub const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(240);

// ============================================================================
// Queue sizing
// ============================================================================

/// Capacity of the store's command queue.
///
/// All three producers (channel, baseline timer, mutation results) share
/// this queue; 256 absorbs bursts without unbounded growth.
pub const STORE_QUEUE_CAPACITY: usize = 256;

/// Capacity of the channel's inbound push queue.
pub const PUSH_QUEUE_CAPACITY: usize = 100;
