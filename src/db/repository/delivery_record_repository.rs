use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{Channel, DeliveryRecord, DeliveryRecordRow, DeliveryStatus};
use crate::error::{AppError, AppResult};

const RECORD_COLUMNS: &str = r#"
    notification_id,
    user_id,
    channel,
    status,
    reason,
    reason_transient,
    provider_message_id,
    attempt_count,
    last_attempt_at,
    next_attempt_at,
    created_at,
    updated_at
"#;

const CHANNEL_ORDER: &str =
    "CASE channel WHEN 'push' THEN 0 WHEN 'email' THEN 1 ELSE 2 END";

fn into_record(row: DeliveryRecordRow) -> AppResult<DeliveryRecord> {
    DeliveryRecord::try_from(row).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))
}

fn into_records(rows: Vec<DeliveryRecordRow>) -> AppResult<Vec<DeliveryRecord>> {
    rows.into_iter().map(into_record).collect()
}

/// Repository for per-channel delivery records.
///
/// Implementation notes:
/// - `(notification_id, channel)` is the primary key; creation is
///   `INSERT ... ON CONFLICT DO NOTHING` so re-submitting never duplicates.
/// - Claiming leases one record per statement with
///   `UPDATE ... WHERE rowid = (SELECT rowid ... LIMIT 1) RETURNING ...`, the
///   same short single-statement pattern that keeps SQLite contention low.
/// - State writes are compare-and-set on the `(status, attempt_count)` the
///   writer read, so a concurrent cancellation is never overwritten.
pub struct DeliveryRecordRepository;

impl DeliveryRecordRepository {
    /// Insert the record unless one already exists for its (notification, channel).
    /// Returns `true` when a row was inserted.
    pub async fn insert_if_absent(pool: &SqlitePool, record: &DeliveryRecord) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_records (
                notification_id,
                user_id,
                channel,
                status,
                reason,
                reason_transient,
                provider_message_id,
                attempt_count,
                last_attempt_at,
                next_attempt_at,
                claimed_until,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            ON CONFLICT (notification_id, channel) DO NOTHING
            "#,
        )
        .bind(&record.notification_id)
        .bind(&record.user_id)
        .bind(record.channel.as_str())
        .bind(record.status.as_str())
        .bind(record.reason.as_ref().map(|r| r.code().to_string()))
        .bind(record.reason.as_ref().and_then(|r| r.transient()))
        .bind(&record.provider_message_id)
        .bind(i64::from(record.attempt_count))
        .bind(record.last_attempt_at)
        .bind(record.next_attempt_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn find(
        pool: &SqlitePool,
        notification_id: &str,
        channel: Channel,
    ) -> AppResult<Option<DeliveryRecord>> {
        let sql = format!(
            "SELECT {} FROM delivery_records WHERE notification_id = ? AND channel = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, DeliveryRecordRow>(&sql)
            .bind(notification_id)
            .bind(channel.as_str())
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        row.map(into_record).transpose()
    }

    /// All records of one notification, in push/email/sms order.
    pub async fn find_by_notification(
        pool: &SqlitePool,
        notification_id: &str,
    ) -> AppResult<Vec<DeliveryRecord>> {
        let sql = format!(
            "SELECT {} FROM delivery_records WHERE notification_id = ? ORDER BY {}",
            RECORD_COLUMNS, CHANNEL_ORDER
        );
        let rows = sqlx::query_as::<_, DeliveryRecordRow>(&sql)
            .bind(notification_id)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        into_records(rows)
    }

    /// Find records with optional filters and pagination, newest first.
    pub async fn list_with_filters(
        pool: &SqlitePool,
        user_id: Option<&str>,
        channel: Option<Channel>,
        status: Option<DeliveryStatus>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<DeliveryRecord>> {
        let channel = channel.map(|c| c.as_str());
        let status = status.map(|s| s.as_str());
        let sql = format!(
            r#"
            SELECT {}
            FROM delivery_records
            WHERE (? IS NULL OR user_id = ?)
              AND (? IS NULL OR channel = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC, notification_id, {}
            LIMIT ?
            OFFSET ?
            "#,
            RECORD_COLUMNS, CHANNEL_ORDER
        );
        let rows = sqlx::query_as::<_, DeliveryRecordRow>(&sql)
            .bind(user_id)
            .bind(user_id)
            .bind(channel)
            .bind(channel)
            .bind(status)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        into_records(rows)
    }

    pub async fn count_with_filters(
        pool: &SqlitePool,
        user_id: Option<&str>,
        channel: Option<Channel>,
        status: Option<DeliveryStatus>,
    ) -> AppResult<i64> {
        let channel = channel.map(|c| c.as_str());
        let status = status.map(|s| s.as_str());
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM delivery_records
            WHERE (? IS NULL OR user_id = ?)
              AND (? IS NULL OR channel = ?)
              AND (? IS NULL OR status = ?)
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(channel)
        .bind(channel)
        .bind(status)
        .bind(status)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Counts grouped by status
    pub async fn counts_by_status(pool: &SqlitePool) -> AppResult<HashMap<String, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM delivery_records GROUP BY status",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows.into_iter().collect())
    }

    /// Counts grouped by channel
    pub async fn counts_by_channel(pool: &SqlitePool) -> AppResult<HashMap<String, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT channel, COUNT(*) FROM delivery_records GROUP BY channel",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows.into_iter().collect())
    }

    /// Lease up to `limit` due queued records until `lease_until` and return them.
    ///
    /// A record is due when its `next_attempt_at` has passed (or is unset) and
    /// no other worker holds an unexpired lease on it.
    pub async fn claim_due(
        pool: &SqlitePool,
        limit: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> AppResult<Vec<DeliveryRecord>> {
        let mut claimed = Vec::new();
        if limit <= 0 {
            return Ok(claimed);
        }

        let sql = format!(
            r#"
            UPDATE delivery_records
            SET claimed_until = ?, updated_at = ?
            WHERE rowid = (
                SELECT rowid FROM delivery_records
                WHERE status = 'queued'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
                  AND (claimed_until IS NULL OR claimed_until <= ?)
                ORDER BY COALESCE(next_attempt_at, created_at) ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );

        for _ in 0..limit {
            let row = sqlx::query_as::<_, DeliveryRecordRow>(&sql)
                .bind(lease_until)
                .bind(now)
                .bind(now)
                .bind(now)
                .fetch_optional(pool)
                .await
                .map_err(AppError::Database)?;

            match row {
                Some(row) => claimed.push(into_record(row)?),
                None => break,
            }
        }

        Ok(claimed)
    }

    /// When the current dispatch lease on a record runs out, if one was ever taken.
    pub async fn lease_expiry(
        pool: &SqlitePool,
        notification_id: &str,
        channel: Channel,
    ) -> AppResult<Option<DateTime<Utc>>> {
        let claimed_until = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT claimed_until FROM delivery_records WHERE notification_id = ? AND channel = ?",
        )
        .bind(notification_id)
        .bind(channel.as_str())
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(claimed_until.flatten())
    }

    /// Drop a lease without changing state so the record can be claimed again.
    pub async fn release_claim(
        pool: &SqlitePool,
        notification_id: &str,
        channel: Channel,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE delivery_records SET claimed_until = NULL WHERE notification_id = ? AND channel = ?",
        )
        .bind(notification_id)
        .bind(channel.as_str())
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Persist `next` only if the stored row still matches `expected`'s status
    /// and attempt count. Clears any lease. Returns `false` when the row moved on
    /// (or the transition is not allowed by the state machine).
    pub async fn compare_and_set(
        pool: &SqlitePool,
        expected: &DeliveryRecord,
        next: &DeliveryRecord,
    ) -> AppResult<bool> {
        if !expected.status.can_transition_to(next.status) {
            tracing::warn!(
                "Rejected delivery transition {} -> {} for notification {} ({})",
                expected.status,
                next.status,
                expected.notification_id,
                expected.channel
            );
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET
                status = ?,
                reason = ?,
                reason_transient = ?,
                provider_message_id = ?,
                attempt_count = ?,
                last_attempt_at = ?,
                next_attempt_at = ?,
                claimed_until = NULL,
                updated_at = ?
            WHERE notification_id = ?
              AND channel = ?
              AND status = ?
              AND attempt_count = ?
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.reason.as_ref().map(|r| r.code().to_string()))
        .bind(next.reason.as_ref().and_then(|r| r.transient()))
        .bind(&next.provider_message_id)
        .bind(i64::from(next.attempt_count))
        .bind(next.last_attempt_at)
        .bind(next.next_attempt_at)
        .bind(next.updated_at)
        .bind(&expected.notification_id)
        .bind(expected.channel.as_str())
        .bind(expected.status.as_str())
        .bind(i64::from(expected.attempt_count))
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }
}
