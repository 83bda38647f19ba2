use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of the delivery audit trail, written from the status feed.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryStatusLog {
    pub id: String,
    pub notification_id: String,
    pub user_id: String,
    pub channel: String,
    pub previous_status: Option<String>,
    pub status: String,
    /// Empty string when the transition carried no reason.
    pub reason: String,
    pub attempt_count: i64,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
