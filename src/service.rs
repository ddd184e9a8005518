//! Service wiring: one user's notification pipeline.
//!
//! [`NotificationService`] composes the four components - session manager,
//! channel client, gateway, store - and owns their background tasks: the
//! recurring token refresh, the periodic baseline fetch, and the forwarder
//! from the channel's push queue into the store. It also watches the
//! session phase so that an invalidated session deterministically tears
//! the channel and timers down; no reconnect loop or timer survives
//! logout.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, NotificationChannelClient};
use crate::config::Config;
use crate::constants;
use crate::gateway::{HttpNotificationGateway, NotificationApi};
use crate::session::{Session, SessionPhase, SessionTokenManager};
use crate::store::StoreHandle;

/// Orchestrator for one authenticated user's notification subsystem.
pub struct NotificationService {
    config: Config,
    session: SessionTokenManager,
    channel: NotificationChannelClient,
    gateway: Arc<dyn NotificationApi>,
    store: StoreHandle,
    user_id: String,
    /// Cancels the baseline timer, the push forwarder, and the session
    /// watcher in one shot.
    tasks: CancellationToken,
    refresh_task: Option<CancellationToken>,
}

impl std::fmt::Debug for NotificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationService")
            .field("user_id", &self.user_id)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl NotificationService {
    /// Build the pipeline for `user_id` from a login session.
    ///
    /// Nothing runs until [`start`].
    ///
    /// [`start`]: NotificationService::start
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP clients cannot be created.
    pub fn new(config: Config, user_id: String, login: Session) -> Result<Self> {
        let refresher = Arc::new(crate::session::HttpTokenRefresher::new(
            config.server_url.clone(),
        )?);
        let session = SessionTokenManager::new(login, refresher);
        let gateway: Arc<dyn NotificationApi> = Arc::new(HttpNotificationGateway::new(
            config.server_url.clone(),
            session.clone(),
        )?);
        let store = StoreHandle::spawn(user_id.clone(), Arc::clone(&gateway));
        let channel = NotificationChannelClient::new(config.clone(), session.clone());

        Ok(Self {
            config,
            session,
            channel,
            gateway,
            store,
            user_id,
            tasks: CancellationToken::new(),
            refresh_task: None,
        })
    }

    /// Build with explicit collaborators (used by tests).
    pub fn with_parts(
        config: Config,
        user_id: String,
        session: SessionTokenManager,
        gateway: Arc<dyn NotificationApi>,
    ) -> Self {
        let store = StoreHandle::spawn(user_id.clone(), Arc::clone(&gateway));
        let channel = NotificationChannelClient::new(config.clone(), session.clone());
        Self {
            config,
            session,
            channel,
            gateway,
            store,
            user_id,
            tasks: CancellationToken::new(),
            refresh_task: None,
        }
    }

    /// The store handle consumed by presentation.
    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// The session manager (read-only token access for embedders).
    pub fn session(&self) -> &SessionTokenManager {
        &self.session
    }

    /// Start the pipeline: token refresh, baseline polling, live channel.
    ///
    /// An initial baseline fetch runs immediately; afterwards the baseline
    /// refreshes on the configured interval and fills whatever the live
    /// channel missed across reconnects.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is already invalid or the channel
    /// authentication is rejected even after one token refresh.
    pub async fn start(&mut self) -> Result<()> {
        self.refresh_task = Some(
            self.session
                .spawn_recurring_refresh(self.config.token_refresh_interval),
        );

        // Push queue: channel -> forwarder -> store's single writer.
        let (push_tx, mut push_rx) = mpsc::channel(constants::PUSH_QUEUE_CAPACITY);
        {
            let store = self.store.clone();
            let cancel = self.tasks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        notification = push_rx.recv() => match notification {
                            Some(n) => {
                                if store.push(n).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }

        // Live channel; one refresh-and-retry if the token just expired.
        let handle = match self.channel.connect(&self.user_id, push_tx.clone()).await {
            Ok(handle) => handle,
            Err(ChannelError::AuthRejected) => {
                log::warn!("Channel auth rejected, refreshing session once");
                self.session.refresh().await?;
                self.channel.connect(&self.user_id, push_tx).await?
            }
            Err(e) => return Err(e.into()),
        };

        // Baseline polling.
        {
            let gateway = Arc::clone(&self.gateway);
            let store = self.store.clone();
            let user_id = self.user_id.clone();
            let interval = self.config.baseline_refresh_interval;
            let cancel = self.tasks.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            match gateway.fetch_baseline(&user_id).await {
                                Ok(baseline) => {
                                    if store.merge_baseline(baseline).await.is_err() {
                                        break;
                                    }
                                }
                                // Next tick retries; the live channel still
                                // delivers in the meantime.
                                Err(e) => log::warn!("Baseline fetch failed: {}", e),
                            }
                        }
                    }
                }
            });
        }

        // Session watcher: invalidation tears the channel and timers down.
        {
            let mut phases = self.session.subscribe();
            let cancel = self.tasks.clone();
            let channel_handle = handle;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = phases.changed() => {
                            if changed.is_err()
                                || *phases.borrow() == SessionPhase::Invalidated
                            {
                                log::info!("Session invalidated, tearing down channel");
                                channel_handle.disconnect();
                                cancel.cancel();
                                break;
                            }
                        }
                    }
                }
            });
        }

        Ok(())
    }

    /// Deterministic teardown: logout, disconnect, cancel every task.
    ///
    /// Idempotent; safe to call whether or not [`start`] ran.
    ///
    /// [`start`]: NotificationService::start
    pub fn shutdown(&mut self) {
        log::info!("Shutting down notification service for {}", self.user_id);
        self.session.logout();
        self.channel.disconnect();
        if let Some(refresh) = self.refresh_task.take() {
            refresh.cancel();
        }
        self.tasks.cancel();
        self.store.shutdown();
    }
}

impl Drop for NotificationService {
    fn drop(&mut self) {
        self.tasks.cancel();
        if let Some(refresh) = self.refresh_task.take() {
            refresh.cancel();
        }
    }
}
