use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{DeliveryRecord, DeliveryStatus, DeliveryStatusLog};
use crate::error::{AppError, AppResult};

// ============================================================================
// Delivery Status Log Repository
// ============================================================================

pub struct DeliveryStatusLogRepository;

impl DeliveryStatusLogRepository {
    /// Append a status change. Duplicate deliveries of the same change
    /// (same notification, channel, status, attempt count and reason) are ignored.
    /// Returns `true` when a row was written.
    pub async fn record_change(
        pool: &SqlitePool,
        record: &DeliveryRecord,
        previous_status: Option<DeliveryStatus>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let id = Uuid::new_v4().to_string();
        let reason = record
            .reason
            .as_ref()
            .map(|r| r.code().to_string())
            .unwrap_or_default();

        let result = sqlx::query(
            r#"
            INSERT INTO delivery_status_log (
                id, notification_id, user_id, channel, previous_status,
                status, reason, attempt_count, provider_message_id, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id)
        .bind(&record.notification_id)
        .bind(&record.user_id)
        .bind(record.channel.as_str())
        .bind(previous_status.map(|s| s.as_str()))
        .bind(record.status.as_str())
        .bind(reason)
        .bind(i64::from(record.attempt_count))
        .bind(&record.provider_message_id)
        .bind(at)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    /// Status history of one notification, oldest first.
    pub async fn find_by_notification(
        pool: &SqlitePool,
        notification_id: &str,
    ) -> AppResult<Vec<DeliveryStatusLog>> {
        sqlx::query_as::<_, DeliveryStatusLog>(
            r#"
            SELECT
                id, notification_id, user_id, channel, previous_status,
                status, reason, attempt_count, provider_message_id, created_at
            FROM delivery_status_log
            WHERE notification_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Channel;
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn duplicate_changes_are_ignored() {
        let pool = test_pool().await;
        let record = DeliveryRecord::queued("n1", "u1", Channel::Push, Utc::now());

        assert!(DeliveryStatusLogRepository::record_change(&pool, &record, None, Utc::now())
            .await
            .unwrap());
        assert!(!DeliveryStatusLogRepository::record_change(&pool, &record, None, Utc::now())
            .await
            .unwrap());

        let mut sent = record.clone();
        sent.status = DeliveryStatus::Sent;
        sent.attempt_count = 1;
        sent.provider_message_id = Some("msg-1".to_string());
        assert!(
            DeliveryStatusLogRepository::record_change(&pool, &sent, Some(DeliveryStatus::Queued), Utc::now())
                .await
                .unwrap()
        );

        let history = DeliveryStatusLogRepository::find_by_notification(&pool, "n1")
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, "queued");
        assert_eq!(history[1].status, "sent");
        assert_eq!(history[1].previous_status.as_deref(), Some("queued"));
        assert_eq!(history[1].provider_message_id.as_deref(), Some("msg-1"));
    }
}
