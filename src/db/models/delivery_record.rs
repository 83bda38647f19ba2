use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery medium for a single notification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
    Sms,
}

impl Channel {
    /// Default fan-out when the caller does not narrow the channel set.
    pub const ALL: [Channel; 3] = [Channel::Push, Channel::Email, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Channel::Push),
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// Persisted delivery status.
///
/// Quiet-hours deferral is not a status of its own: a deferred record is
/// `Queued` with reason [`DeliveryReason::QuietHoursDeferred`] and a
/// `next_attempt_at` at the end of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Skipped => "skipped",
        }
    }

    /// Sent and skipped records never change again. Failed records only
    /// leave their state through a scheduled retry.
    pub fn is_final(&self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Skipped)
    }

    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        match self {
            DeliveryStatus::Queued => true,
            DeliveryStatus::Failed => next == DeliveryStatus::Queued,
            DeliveryStatus::Sent | DeliveryStatus::Skipped => false,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DeliveryStatus::Queued),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            "skipped" => Ok(DeliveryStatus::Skipped),
            other => Err(format!("unknown delivery status '{}'", other)),
        }
    }
}

/// Machine-readable explanation attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReason {
    ChannelDisabled,
    CategoryDisabled,
    CategoryNotSmsEligible,
    NotEntitled,
    NoContactInfo,
    QuietHoursDeferred,
    Cancelled,
    Expired,
    /// Error classification reported by a channel provider.
    Provider { code: String, transient: bool },
}

impl DeliveryReason {
    pub fn code(&self) -> &str {
        match self {
            DeliveryReason::ChannelDisabled => "channel_disabled",
            DeliveryReason::CategoryDisabled => "category_disabled",
            DeliveryReason::CategoryNotSmsEligible => "category_not_sms_eligible",
            DeliveryReason::NotEntitled => "not_entitled",
            DeliveryReason::NoContactInfo => "no_contact_info",
            DeliveryReason::QuietHoursDeferred => "quiet_hours_deferred",
            DeliveryReason::Cancelled => "cancelled",
            DeliveryReason::Expired => "expired",
            DeliveryReason::Provider { code, .. } => code,
        }
    }

    /// `Some` only for provider errors.
    pub fn transient(&self) -> Option<bool> {
        match self {
            DeliveryReason::Provider { transient, .. } => Some(*transient),
            _ => None,
        }
    }

    /// Rebuild a reason from its stored code and transient flag.
    pub fn from_parts(code: &str, transient: Option<bool>) -> Self {
        match code {
            "channel_disabled" => DeliveryReason::ChannelDisabled,
            "category_disabled" => DeliveryReason::CategoryDisabled,
            "category_not_sms_eligible" => DeliveryReason::CategoryNotSmsEligible,
            "not_entitled" => DeliveryReason::NotEntitled,
            "no_contact_info" => DeliveryReason::NoContactInfo,
            "quiet_hours_deferred" => DeliveryReason::QuietHoursDeferred,
            "cancelled" => DeliveryReason::Cancelled,
            "expired" => DeliveryReason::Expired,
            other => DeliveryReason::Provider {
                code: other.to_string(),
                transient: transient.unwrap_or(false),
            },
        }
    }
}

impl fmt::Display for DeliveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Per-channel delivery state for one notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub notification_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub reason: Option<DeliveryReason>,
    pub provider_message_id: Option<String>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Not dispatched before this instant (retry backoff or end of quiet hours).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn queued(notification_id: &str, user_id: &str, channel: Channel, now: DateTime<Utc>) -> Self {
        Self {
            notification_id: notification_id.to_string(),
            user_id: user_id.to_string(),
            channel,
            status: DeliveryStatus::Queued,
            reason: None,
            provider_message_id: None,
            attempt_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.status == DeliveryStatus::Queued
            && self.reason == Some(DeliveryReason::QuietHoursDeferred)
    }

    /// A failed record whose provider error may go away on its own.
    pub fn has_transient_failure(&self) -> bool {
        self.status == DeliveryStatus::Failed
            && self.reason.as_ref().and_then(DeliveryReason::transient) == Some(true)
    }
}

/// Raw `delivery_records` row.
#[derive(Debug, Clone, FromRow)]
pub struct DeliveryRecordRow {
    pub notification_id: String,
    pub user_id: String,
    pub channel: String,
    pub status: String,
    pub reason: Option<String>,
    pub reason_transient: Option<bool>,
    pub provider_message_id: Option<String>,
    pub attempt_count: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRecordRow> for DeliveryRecord {
    type Error = String;

    fn try_from(row: DeliveryRecordRow) -> Result<Self, Self::Error> {
        Ok(DeliveryRecord {
            channel: row.channel.parse()?,
            status: row.status.parse()?,
            reason: row
                .reason
                .as_deref()
                .map(|code| DeliveryReason::from_parts(code, row.reason_transient)),
            attempt_count: u32::try_from(row.attempt_count)
                .map_err(|_| format!("negative attempt_count {}", row.attempt_count))?,
            notification_id: row.notification_id,
            user_id: row.user_id,
            provider_message_id: row.provider_message_id,
            last_attempt_at: row.last_attempt_at,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
