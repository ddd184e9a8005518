//! Session credential ownership and rotation.
//!
//! [`SessionTokenManager`] is the single owner of the access/refresh token
//! pair. Everything else (channel client, gateway) reads tokens through it
//! and reacts to its invalidation signal; nothing else may mutate the
//! session.
//!
//! # Refresh semantics
//!
//! `refresh()` is single-flight: concurrent callers serialize on an async
//! gate, and a caller that finds the session already rotated while it
//! waited returns the fresh token instead of issuing a second refresh
//! request. A failed refresh is fatal to the session - it is not retried
//! here, the session flips to invalid, and dependents observe
//! [`SessionPhase::Invalidated`] through the watch channel.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::constants;

/// A live session: the credential pair plus its estimated expiry.
#[derive(Debug, Clone)]
pub struct Session {
    /// Bearer token attached to gateway and channel requests.
    pub access_token: String,
    /// Opaque token exchanged for a fresh pair on refresh.
    pub refresh_token: String,
    /// Estimated expiry of the access token.
    pub expires_at: DateTime<Utc>,
}

/// Lifecycle phase of the session, observable by dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// A session is live and tokens may be used.
    Active,
    /// The session was destroyed (logout or unrecoverable refresh failure).
    Invalidated,
}

/// Errors from session operations.
#[derive(Debug)]
pub enum AuthError {
    /// The refresh endpoint rejected the refresh token.
    RefreshRejected(String),
    /// The refresh request could not reach the server.
    Transport(String),
    /// No live session exists (logged out or already invalidated).
    Invalidated,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RefreshRejected(msg) => write!(f, "Refresh rejected: {msg}"),
            Self::Transport(msg) => write!(f, "Refresh transport error: {msg}"),
            Self::Invalidated => write!(f, "Session invalidated"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Fresh credential pair returned by a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    /// New access token.
    pub access_token: String,
    /// New refresh token (rotation replaces both).
    pub refresh_token: String,
    /// Seconds until the new access token expires.
    pub expires_in: u64,
}

/// Performs the actual token exchange.
///
/// Abstracted so the manager's single-flight and invalidation logic can be
/// tested without a server.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange a refresh token for a fresh credential pair.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::RefreshRejected` if the server refuses the
    /// token, or `AuthError::Transport` if the request fails.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError>;
}

/// Wire format of the refresh endpoint response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

/// HTTP refresher hitting `POST /auth/refresh`.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    server_url: String,
}

impl HttpTokenRefresher {
    /// Create a refresher for the given server.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(server_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, server_url })
    }

    /// Create a refresher with a pre-configured HTTP client.
    pub fn with_client(client: reqwest::Client, server_url: String) -> Self {
        Self { client, server_url }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
        let url = format!("{}/auth/refresh", self.server_url);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshRejected(format!("{status}: {body}")));
        }

        let tokens: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::RefreshRejected(format!("invalid response: {e}")))?;

        Ok(RefreshedTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_in: tokens.expires_in,
        })
    }
}

/// Internal session slot guarded by a sync mutex.
///
/// `generation` increments on every successful rotation; `refresh()` uses
/// it to detect that another caller already rotated the pair while this
/// caller waited on the gate.
#[derive(Debug)]
struct SessionSlot {
    session: Option<Session>,
    generation: u64,
}

struct Inner {
    refresher: Arc<dyn TokenRefresher>,
    slot: Mutex<SessionSlot>,
    /// Single-flight gate: at most one refresh request in flight.
    refresh_gate: tokio::sync::Mutex<()>,
    phase_tx: watch::Sender<SessionPhase>,
}

/// Owner of the session credential pair.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct SessionTokenManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokenManager")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SessionTokenManager {
    /// Create a manager owning the session obtained at login.
    pub fn new(initial: Session, refresher: Arc<dyn TokenRefresher>) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Active);
        Self {
            inner: Arc::new(Inner {
                refresher,
                slot: Mutex::new(SessionSlot {
                    session: Some(initial),
                    generation: 0,
                }),
                refresh_gate: tokio::sync::Mutex::new(()),
                phase_tx,
            }),
        }
    }

    /// Current access token, without side effects.
    ///
    /// Returns `None` once the session has been invalidated.
    pub fn current_token(&self) -> Option<String> {
        let slot = self.inner.slot.lock().expect("session lock poisoned");
        slot.session.as_ref().map(|s| s.access_token.clone())
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase_tx.borrow()
    }

    /// Subscribe to phase changes.
    ///
    /// The channel client and the service use this to stop retrying as
    /// soon as the session dies.
    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Refresh the credential pair.
    ///
    /// Single-flight: if another refresh is already in flight, this call
    /// waits for it and returns its result instead of issuing a second
    /// request. Failure invalidates the session and is not retried.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Invalidated` if no session is live, or the
    /// refresher's error after invalidating the session.
    pub async fn refresh(&self) -> Result<String, AuthError> {
        let start_generation = {
            let slot = self.inner.slot.lock().expect("session lock poisoned");
            if slot.session.is_none() {
                return Err(AuthError::Invalidated);
            }
            slot.generation
        };

        let _gate = self.inner.refresh_gate.lock().await;

        // Re-check under the gate: another caller may have rotated the pair
        // (or killed the session) while we waited.
        let refresh_token = {
            let slot = self.inner.slot.lock().expect("session lock poisoned");
            match &slot.session {
                None => return Err(AuthError::Invalidated),
                Some(session) if slot.generation != start_generation => {
                    log::debug!("Refresh satisfied by in-flight rotation");
                    return Ok(session.access_token.clone());
                }
                Some(session) => session.refresh_token.clone(),
            }
        };

        match self.inner.refresher.refresh(&refresh_token).await {
            Ok(tokens) => {
                let mut slot = self.inner.slot.lock().expect("session lock poisoned");
                // Logout may have happened while the request was in flight;
                // a destroyed session must not be resurrected.
                if slot.session.is_none() {
                    return Err(AuthError::Invalidated);
                }
                let access = tokens.access_token.clone();
                slot.session = Some(Session {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token,
                    expires_at: Utc::now()
                        + ChronoDuration::seconds(tokens.expires_in.min(i64::MAX as u64) as i64),
                });
                slot.generation += 1;
                log::debug!("Session refreshed (generation {})", slot.generation);
                Ok(access)
            }
            Err(e) => {
                log::error!("Session refresh failed, invalidating session: {}", e);
                self.invalidate();
                Err(e)
            }
        }
    }

    /// Destroy both tokens and signal invalidation immediately.
    ///
    /// Synchronous and unconditional: an in-flight refresh that completes
    /// afterwards finds the session gone and does not resurrect it.
    pub fn logout(&self) {
        log::info!("Logging out, destroying session tokens");
        self.invalidate();
    }

    /// Spawn a background task refreshing on a fixed interval.
    ///
    /// On refresh failure the session is already invalidated by
    /// `refresh()`; the task logs and exits without retrying. The returned
    /// token cancels the task deterministically.
    pub fn spawn_recurring_refresh(&self, interval: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let manager = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it, the login token is fresh.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        log::debug!("Recurring refresh cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        match manager.refresh().await {
                            Ok(_) => log::debug!("Recurring refresh succeeded"),
                            Err(e) => {
                                log::error!("Recurring refresh failed, stopping: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        cancel
    }

    fn invalidate(&self) {
        {
            let mut slot = self.inner.slot.lock().expect("session lock poisoned");
            slot.session = None;
        }
        self.inner.phase_tx.send_replace(SessionPhase::Invalidated);
    }
}
