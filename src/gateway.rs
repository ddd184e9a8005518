//! REST gateway for the notification API.
//!
//! Stateless remote operations: baseline fetch, mark-read, mark-all-read,
//! delete. Every operation returns an explicit result - nothing here
//! panics or throws across the boundary the store consumes, because the
//! store pairs each failure with a rollback of its optimistic change.
//!
//! The gateway reads the bearer token through [`SessionTokenManager`] on
//! every call and fails fast once the session is invalid rather than
//! sending a stale token.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::constants;
use crate::model::Notification;
use crate::session::SessionTokenManager;

/// Errors from gateway operations.
#[derive(Debug)]
pub enum GatewayError {
    /// The session is invalid; the request was not sent.
    SessionInvalid,
    /// The request could not reach the server.
    Transport(String),
    /// The server answered with a non-success status.
    Status(u16, String),
    /// The response body could not be decoded.
    Decode(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionInvalid => write!(f, "Session invalid, request not sent"),
            Self::Transport(msg) => write!(f, "Request failed: {msg}"),
            Self::Status(code, body) => write!(f, "Server returned {code}: {body}"),
            Self::Decode(msg) => write!(f, "Invalid response body: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Remote notification operations consumed by the store.
///
/// A trait seam so the store's rollback logic is testable against scripted
/// fakes.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// Fetch the baseline notification list for a user, newest first.
    async fn fetch_baseline(&self, user_id: &str) -> Result<Vec<Notification>, GatewayError>;

    /// Mark one notification read. Marking an already-read (or unknown)
    /// notification succeeds.
    async fn mark_read(&self, id: &str) -> Result<(), GatewayError>;

    /// Mark every notification for a user read.
    async fn mark_all_read(&self, user_id: &str) -> Result<(), GatewayError>;

    /// Delete one notification. Deleting an already-deleted or unknown id
    /// succeeds.
    async fn delete(&self, id: &str) -> Result<(), GatewayError>;
}

/// HTTP implementation of [`NotificationApi`].
#[derive(Debug, Clone)]
pub struct HttpNotificationGateway {
    client: reqwest::Client,
    server_url: String,
    session: SessionTokenManager,
}

impl HttpNotificationGateway {
    /// Create a gateway with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(server_url: String, session: SessionTokenManager) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            server_url,
            session,
        })
    }

    /// Create a gateway with a pre-configured HTTP client.
    ///
    /// Useful for testing or when custom client configuration is needed.
    pub fn with_client(
        client: reqwest::Client,
        server_url: String,
        session: SessionTokenManager,
    ) -> Self {
        Self {
            client,
            server_url,
            session,
        }
    }

    /// Returns the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn token(&self) -> Result<String, GatewayError> {
        self.session
            .current_token()
            .ok_or(GatewayError::SessionInvalid)
    }

    /// Map a mutation response, treating 404 as success.
    ///
    /// Mark-read and delete are idempotent: the entry being gone
    /// server-side means the desired state already holds.
    async fn check_idempotent(response: reqwest::Response) -> Result<(), GatewayError> {
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Status(status.as_u16(), body))
    }
}

#[async_trait]
impl NotificationApi for HttpNotificationGateway {
    async fn fetch_baseline(&self, user_id: &str) -> Result<Vec<Notification>, GatewayError> {
        let token = self.token()?;
        let url = format!("{}/notifications", self.server_url);

        let response = self
            .client
            .get(&url)
            .query(&[("userId", user_id)])
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status(status.as_u16(), body));
        }

        let list: Vec<Notification> = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        log::debug!("Fetched baseline of {} notifications for {}", list.len(), user_id);
        Ok(list)
    }

    async fn mark_read(&self, id: &str) -> Result<(), GatewayError> {
        let token = self.token()?;
        let url = format!("{}/notifications/{}/read", self.server_url, id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Self::check_idempotent(response).await
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<(), GatewayError> {
        let token = self.token()?;
        let url = format!("{}/notifications/read-all", self.server_url);

        let response = self
            .client
            .post(&url)
            .query(&[("userId", user_id)])
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(GatewayError::Status(status.as_u16(), body))
        }
    }

    async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        let token = self.token()?;
        let url = format!("{}/notifications/{}", self.server_url, id);

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Self::check_idempotent(response).await
    }
}
