//! Studyhub notification client.
//!
//! Real-time notification delivery and reconciliation for the Studyhub
//! learning platform: a live per-user push subscription, a periodically
//! fetched baseline, and optimistic read/delete mutations merged into one
//! consistent, ordered, deduplicated list.
//!
//! # Architecture
//!
//! ```text
//! SessionTokenManager ──tokens──▶ NotificationChannelClient ──▶ push queue ─┐
//!        │                                                                  ▼
//!        └───tokens───▶ NotificationGateway ──baseline/results──▶ NotificationStore
//!                                                                  (single writer)
//! ```
//!
//! The store is the single source of truth consumed by presentation. All
//! of its inputs - pushes, baseline snapshots, mutation results - arrive
//! through one command queue processed by one task, so reconciliation is
//! race-free by construction.
//!
//! # Modules
//!
//! - [`session`] - access/refresh token pair, single-flight refresh,
//!   invalidation signal
//! - [`channel`] - live WebSocket subscription with reconnect backoff
//! - [`gateway`] - REST operations (baseline, mark-read, delete)
//! - [`store`] - reconciliation core and optimistic-mutation rollback
//! - [`service`] - wiring and background-task ownership

// Library modules
pub mod channel;
pub mod config;
pub mod constants;
pub mod gateway;
pub mod model;
pub mod service;
pub mod session;
pub mod store;
pub mod ws;

// Re-export commonly used types
pub use channel::{ChannelError, ChannelHandle, ConnectionState, NotificationChannelClient};
pub use config::Config;
pub use gateway::{GatewayError, HttpNotificationGateway, NotificationApi};
pub use model::{Notification, NotificationKind};
pub use service::NotificationService;
pub use session::{AuthError, Session, SessionPhase, SessionTokenManager};
pub use store::{StoreError, StoreHandle};
