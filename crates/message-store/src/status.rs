use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RepositoryError;

/// Lifecycle status of a message.
///
/// Status transitions:
/// ```text
/// Created ──► Published ──► Received ──► Complete
///    │
///    └──► Canceled
/// ```
///
/// `Complete` means "terminally processed". A handler failure is recorded as
/// error text on the `Complete` entry rather than as a separate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Persisted, not yet handed to the broker.
    Created,
    /// Handed (or about to be handed) to the broker.
    Published,
    /// Picked up by a handler.
    Received,
    /// Handler finished, with or without an attached error.
    Complete,
    /// Aborted before dispatch.
    Canceled,
}

impl MessageStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [MessageStatus; 5] = [
        MessageStatus::Created,
        MessageStatus::Published,
        MessageStatus::Received,
        MessageStatus::Complete,
        MessageStatus::Canceled,
    ];

    /// Returns true for `Complete` and `Canceled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Complete | MessageStatus::Canceled)
    }

    /// Returns true while work is outstanding (`Created`, `Published`, `Received`).
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns the database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Created => "CREATED",
            MessageStatus::Published => "PUBLISHED",
            MessageStatus::Received => "RECEIVED",
            MessageStatus::Complete => "COMPLETE",
            MessageStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| RepositoryError::UnknownStatus(s.to_string()))
    }
}

/// One row of a message's append-only status log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: MessageStatus,
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl StatusEntry {
    pub fn new(status: MessageStatus, error: Option<String>) -> Self {
        Self {
            status,
            error,
            occurred_at: Utc::now(),
        }
    }
}
