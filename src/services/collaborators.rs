//! Read-only collaborators owned by the account subsystem.
//!
//! The pipeline never mutates any of this data. Each concern is its own trait
//! so hosts (and tests) can plug in whatever backs it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{
    Channel, ChannelPreferences, EntitlementFeature, NotificationCategory, QuietHoursWindow,
};
use crate::error::AppResult;
use crate::services::eligibility::ChannelEligibilityInput;
use crate::services::quiet_hours;

#[async_trait]
pub trait PreferenceStore: Send + Sync + 'static {
    async fn get_channel_preferences(&self, user_id: &str) -> AppResult<ChannelPreferences>;
}

#[async_trait]
pub trait QuietHoursSource: Send + Sync + 'static {
    async fn get_quiet_hours_window(&self, user_id: &str) -> AppResult<Option<QuietHoursWindow>>;
}

#[async_trait]
pub trait EntitlementCheck: Send + Sync + 'static {
    async fn is_entitled(&self, user_id: &str, feature: EntitlementFeature) -> AppResult<bool>;
}

#[async_trait]
pub trait ContactDirectory: Send + Sync + 'static {
    async fn get_phone(&self, user_id: &str) -> AppResult<Option<String>>;
}

/// The set of collaborators injected into the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub preferences: Arc<dyn PreferenceStore>,
    pub quiet_hours: Arc<dyn QuietHoursSource>,
    pub entitlements: Arc<dyn EntitlementCheck>,
    pub contacts: Arc<dyn ContactDirectory>,
}

impl Collaborators {
    /// Use one object for every concern (e.g. a directory backed by a single database).
    pub fn from_single<T>(directory: Arc<T>) -> Self
    where
        T: PreferenceStore + QuietHoursSource + EntitlementCheck + ContactDirectory,
    {
        Self {
            preferences: directory.clone(),
            quiet_hours: directory.clone(),
            entitlements: directory.clone(),
            contacts: directory,
        }
    }

    /// Snapshot everything eligibility needs for one user. Lookups run concurrently.
    pub async fn load_context(&self, user_id: &str) -> AppResult<UserDeliveryContext> {
        let (preferences, quiet_hours, sms_entitled, phone) = tokio::try_join!(
            self.preferences.get_channel_preferences(user_id),
            self.quiet_hours.get_quiet_hours_window(user_id),
            self.entitlements.is_entitled(user_id, EntitlementFeature::Sms),
            self.contacts.get_phone(user_id),
        )?;

        Ok(UserDeliveryContext {
            preferences,
            quiet_hours,
            sms_entitled,
            phone: phone.filter(|p| !p.trim().is_empty()),
        })
    }
}

/// Evaluation-time snapshot of one user's delivery settings.
#[derive(Debug, Clone, Default)]
pub struct UserDeliveryContext {
    pub preferences: ChannelPreferences,
    pub quiet_hours: Option<QuietHoursWindow>,
    pub sms_entitled: bool,
    pub phone: Option<String>,
}

impl UserDeliveryContext {
    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        self.quiet_hours
            .as_ref()
            .map(|w| quiet_hours::is_in_quiet_hours(w, now))
            .unwrap_or(false)
    }

    /// When the current quiet-hours window closes, if `now` is inside one.
    pub fn quiet_hours_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.quiet_hours
            .as_ref()
            .and_then(|w| quiet_hours::quiet_hours_end(w, now))
    }

    pub fn eligibility_input(
        &self,
        channel: Channel,
        category: NotificationCategory,
        sms_eligible_categories: &[NotificationCategory],
        now: DateTime<Utc>,
    ) -> ChannelEligibilityInput {
        let pref = self.preferences.for_channel(channel);
        ChannelEligibilityInput {
            channel,
            channel_enabled: pref.enabled,
            category_enabled: pref.category_enabled(category),
            in_quiet_hours: self.in_quiet_hours(now),
            sms_eligible_category: sms_eligible_categories.contains(&category),
            sms_entitled: self.sms_entitled,
            has_sms_phone: self.phone.is_some(),
        }
    }
}
