use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Business category of a notification; drives per-category preferences and SMS eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Broadcast,
    CalendarEvents,
    Tasks,
    Payments,
    TripInvites,
    JoinRequests,
    BasecampUpdates,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Broadcast => "broadcast",
            NotificationCategory::CalendarEvents => "calendar_events",
            NotificationCategory::Tasks => "tasks",
            NotificationCategory::Payments => "payments",
            NotificationCategory::TripInvites => "trip_invites",
            NotificationCategory::JoinRequests => "join_requests",
            NotificationCategory::BasecampUpdates => "basecamp_updates",
        }
    }
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcast" => Ok(NotificationCategory::Broadcast),
            "calendar_events" => Ok(NotificationCategory::CalendarEvents),
            "tasks" => Ok(NotificationCategory::Tasks),
            "payments" => Ok(NotificationCategory::Payments),
            "trip_invites" => Ok(NotificationCategory::TripInvites),
            "join_requests" => Ok(NotificationCategory::JoinRequests),
            "basecamp_updates" => Ok(NotificationCategory::BasecampUpdates),
            other => Err(format!("unknown notification category '{}'", other)),
        }
    }
}

/// The logical trigger for a fan-out across channels. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: String,
    pub user_id: String,
    pub category: NotificationCategory,
    pub title: String,
    pub body: String,
    /// Free-form context such as the trip id and name.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Stored event plus its lifecycle timestamps.
#[derive(Debug, Clone)]
pub struct StoredNotificationEvent {
    pub event: NotificationEvent,
    pub created_at: DateTime<Utc>,
    /// Set when the notification is withdrawn; pending deliveries are cancelled.
    pub withdrawn_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct NotificationEventRow {
    pub id: String,
    pub user_id: String,
    pub category: String,
    pub title: String,
    pub body: String,
    pub metadata_json: String,
    pub created_at: DateTime<Utc>,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationEventRow> for StoredNotificationEvent {
    type Error = String;

    fn try_from(row: NotificationEventRow) -> Result<Self, Self::Error> {
        let metadata = serde_json::from_str(&row.metadata_json)
            .map_err(|e| format!("invalid metadata for event {}: {}", row.id, e))?;
        Ok(StoredNotificationEvent {
            event: NotificationEvent {
                category: row.category.parse()?,
                id: row.id,
                user_id: row.user_id,
                title: row.title,
                body: row.body,
                metadata,
            },
            created_at: row.created_at,
            withdrawn_at: row.withdrawn_at,
        })
    }
}
