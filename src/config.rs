//! Client configuration.
//!
//! Nothing here is persisted to disk; the subsystem holds no on-disk state.
//! Values come from [`Config::default`] or environment overrides, and the
//! embedding application can adjust any field before wiring the service.

use std::time::Duration;

use crate::constants;

/// Configuration for the notification client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Studyhub server, e.g. `https://studyhub.example.com`.
    pub server_url: String,
    /// Interval between background token refreshes.
    pub token_refresh_interval: Duration,
    /// Interval between baseline fetches.
    pub baseline_refresh_interval: Duration,
    /// Initial reconnection backoff delay.
    pub initial_backoff: Duration,
    /// Reconnection backoff cap.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each backoff delay.
    pub backoff_jitter: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "https://studyhub.example.com".to_string(),
            token_refresh_interval: constants::TOKEN_REFRESH_INTERVAL,
            baseline_refresh_interval: constants::BASELINE_REFRESH_INTERVAL,
            initial_backoff: constants::INITIAL_BACKOFF,
            max_backoff: constants::MAX_BACKOFF,
            backoff_jitter: constants::BACKOFF_JITTER,
        }
    }
}

impl Config {
    /// Build a config for the given server URL with default intervals.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `STUDYHUB_SERVER_URL`
    /// - `STUDYHUB_TOKEN_REFRESH_SECS`
    /// - `STUDYHUB_BASELINE_REFRESH_SECS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("STUDYHUB_SERVER_URL") {
            if !url.is_empty() {
                config.server_url = url;
            }
        }
        if let Some(secs) = env_secs("STUDYHUB_TOKEN_REFRESH_SECS") {
            config.token_refresh_interval = secs;
        }
        if let Some(secs) = env_secs("STUDYHUB_BASELINE_REFRESH_SECS") {
            config.baseline_refresh_interval = secs;
        }

        config
    }
}

/// Parse an environment variable as a duration in whole seconds.
fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
