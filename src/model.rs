//! Notification data model.
//!
//! Wire format is camelCase JSON; both the REST gateway and the push
//! channel deliver the same shape. Unknown notification kinds decode to
//! [`NotificationKind::Other`] so a server rollout adding a kind never
//! breaks delivery of the rest of the list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of event a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// Someone started following the recipient.
    Follow,
    /// Someone liked the recipient's content.
    Like,
    /// Someone commented on the recipient's content.
    Comment,
    /// The recipient was mentioned.
    Mention,
    /// A kind this client version does not know about.
    #[serde(other)]
    Other,
}

/// One notification as delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Server-assigned unique id.
    pub id: String,
    /// User the notification is for.
    pub recipient_id: String,
    /// User whose action triggered it.
    pub actor_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Human-readable summary line.
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Notification {
    /// Key this notification sorts under in the visible list.
    pub fn sort_key(&self) -> SortKey {
        SortKey {
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }
}

/// Ordering key for the visible list: newest first, id descending as the
/// tiebreak.
///
/// The comparison is reversed so that ascending iteration over a sorted
/// collection yields the newest entry first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    created_at: DateTime<Utc>,
    id: String,
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
