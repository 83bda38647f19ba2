use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{NotificationEvent, NotificationEventRow, StoredNotificationEvent};
use crate::error::{AppError, AppResult};

pub struct NotificationEventRepository;

impl NotificationEventRepository {
    /// Store the event unless its id is already known. Returns `true` when inserted.
    pub async fn insert_if_absent(
        pool: &SqlitePool,
        event: &NotificationEvent,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let metadata_json = serde_json::to_string(&event.metadata)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO notification_events (
                id, user_id, category, title, body, metadata_json, created_at, withdrawn_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.user_id)
        .bind(event.category.as_str())
        .bind(&event.title)
        .bind(&event.body)
        .bind(metadata_json)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn find(pool: &SqlitePool, id: &str) -> AppResult<Option<StoredNotificationEvent>> {
        let row = sqlx::query_as::<_, NotificationEventRow>(
            r#"
            SELECT id, user_id, category, title, body, metadata_json, created_at, withdrawn_at
            FROM notification_events
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        row.map(|r| {
            StoredNotificationEvent::try_from(r).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))
        })
        .transpose()
    }

    /// Mark the event withdrawn. Returns `false` when it was already withdrawn or unknown.
    pub async fn mark_withdrawn(pool: &SqlitePool, id: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE notification_events SET withdrawn_at = ? WHERE id = ? AND withdrawn_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }
}
