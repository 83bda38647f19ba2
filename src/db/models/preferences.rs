use std::collections::HashMap;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{Channel, NotificationCategory};

/// A user's toggle for one channel plus per-category overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreference {
    pub enabled: bool,
    /// Categories missing from the map are enabled.
    #[serde(default)]
    pub categories: HashMap<NotificationCategory, bool>,
}

impl ChannelPreference {
    pub fn category_enabled(&self, category: NotificationCategory) -> bool {
        self.categories.get(&category).copied().unwrap_or(true)
    }
}

impl Default for ChannelPreference {
    fn default() -> Self {
        Self {
            enabled: true,
            categories: HashMap::new(),
        }
    }
}

/// Channel preferences owned by the account subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreferences {
    pub push: ChannelPreference,
    pub email: ChannelPreference,
    pub sms: ChannelPreference,
}

impl ChannelPreferences {
    pub fn for_channel(&self, channel: Channel) -> &ChannelPreference {
        match channel {
            Channel::Push => &self.push,
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
        }
    }

    pub fn for_channel_mut(&mut self, channel: Channel) -> &mut ChannelPreference {
        match channel {
            Channel::Push => &mut self.push,
            Channel::Email => &mut self.email,
            Channel::Sms => &mut self.sms,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QuietHoursError {
    #[error("invalid quiet hours time '{0}', expected HH:MM")]
    InvalidTime(String),

    #[error("'{0}' is not a valid IANA timezone")]
    InvalidTimezone(String),
}

/// Local-time window during which deliveries are deferred.
///
/// `start > end` wraps past midnight; `start == end` disables quiet hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHoursWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub timezone: Tz,
}

impl QuietHoursWindow {
    pub fn parse(start: &str, end: &str, timezone: &str) -> Result<Self, QuietHoursError> {
        let parse_time = |raw: &str| {
            NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                .map_err(|_| QuietHoursError::InvalidTime(raw.to_string()))
        };
        let timezone = timezone
            .trim()
            .parse::<Tz>()
            .map_err(|_| QuietHoursError::InvalidTimezone(timezone.to_string()))?;

        Ok(Self {
            start: parse_time(start)?,
            end: parse_time(end)?,
            timezone,
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.start == self.end
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }
}

/// Subscription-gated capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntitlementFeature {
    Sms,
}

impl EntitlementFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementFeature::Sms => "sms",
        }
    }
}
