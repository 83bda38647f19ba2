use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::models::{
    Channel, ChannelPreferences, EntitlementFeature, NotificationCategory, QuietHoursWindow,
};
use crate::error::{AppError, AppResult};
use crate::services::collaborators::{
    ContactDirectory, EntitlementCheck, PreferenceStore, QuietHoursSource,
};

// ============================================================================
// Account Directory (read-only)
// ============================================================================

/// Reads preference, quiet-hours, entitlement and contact data owned by the
/// account subsystem. Nothing here writes.
#[derive(Clone)]
pub struct SqliteAccountDirectory {
    pool: SqlitePool,
}

impl SqliteAccountDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceStore for SqliteAccountDirectory {
    async fn get_channel_preferences(&self, user_id: &str) -> AppResult<ChannelPreferences> {
        let mut preferences = ChannelPreferences::default();

        let channel_rows = sqlx::query_as::<_, (String, bool)>(
            "SELECT channel, enabled FROM user_channel_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        for (channel, enabled) in channel_rows {
            match channel.parse::<Channel>() {
                Ok(channel) => preferences.for_channel_mut(channel).enabled = enabled,
                Err(e) => tracing::warn!("Ignoring channel preference for user {}: {}", user_id, e),
            }
        }

        let category_rows = sqlx::query_as::<_, (String, String, bool)>(
            "SELECT channel, category, enabled FROM user_category_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        for (channel, category, enabled) in category_rows {
            match (channel.parse::<Channel>(), category.parse::<NotificationCategory>()) {
                (Ok(channel), Ok(category)) => {
                    preferences
                        .for_channel_mut(channel)
                        .categories
                        .insert(category, enabled);
                }
                _ => tracing::warn!(
                    "Ignoring category preference {}/{} for user {}",
                    channel,
                    category,
                    user_id
                ),
            }
        }

        Ok(preferences)
    }
}

#[async_trait]
impl QuietHoursSource for SqliteAccountDirectory {
    async fn get_quiet_hours_window(&self, user_id: &str) -> AppResult<Option<QuietHoursWindow>> {
        let row = sqlx::query_as::<_, (String, String, String)>(
            "SELECT start_time, end_time, timezone FROM user_quiet_hours WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.and_then(|(start, end, timezone)| {
            QuietHoursWindow::parse(&start, &end, &timezone)
                .map_err(|e| {
                    tracing::warn!("Ignoring quiet hours for user {}: {}", user_id, e);
                })
                .ok()
        }))
    }
}

#[async_trait]
impl EntitlementCheck for SqliteAccountDirectory {
    async fn is_entitled(&self, user_id: &str, feature: EntitlementFeature) -> AppResult<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM user_entitlements WHERE user_id = ? AND feature = ?",
        )
        .bind(user_id)
        .bind(feature.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count > 0)
    }
}

#[async_trait]
impl ContactDirectory for SqliteAccountDirectory {
    async fn get_phone(&self, user_id: &str) -> AppResult<Option<String>> {
        let phone = sqlx::query_scalar::<_, Option<String>>(
            "SELECT phone FROM user_contacts WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(phone.flatten())
    }
}
