//! Per-channel delivery policy.

use crate::db::models::{Channel, DeliveryReason, DeliveryStatus};

/// Everything the policy needs for one channel, captured at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEligibilityInput {
    pub channel: Channel,
    pub channel_enabled: bool,
    pub category_enabled: bool,
    pub in_quiet_hours: bool,
    pub sms_eligible_category: bool,
    pub sms_entitled: bool,
    pub has_sms_phone: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityDecision {
    pub status: DeliveryStatus,
    pub reason: Option<DeliveryReason>,
}

impl EligibilityDecision {
    fn queued() -> Self {
        Self {
            status: DeliveryStatus::Queued,
            reason: None,
        }
    }

    fn skipped(reason: DeliveryReason) -> Self {
        Self {
            status: DeliveryStatus::Skipped,
            reason: Some(reason),
        }
    }

    fn deferred() -> Self {
        Self {
            status: DeliveryStatus::Queued,
            reason: Some(DeliveryReason::QuietHoursDeferred),
        }
    }

    /// Queued with no reason: may be handed to a provider now.
    pub fn is_dispatchable(&self) -> bool {
        self.status == DeliveryStatus::Queued && self.reason.is_none()
    }

    pub fn is_deferred(&self) -> bool {
        self.status == DeliveryStatus::Queued
            && self.reason == Some(DeliveryReason::QuietHoursDeferred)
    }
}

/// Decide whether a channel attempt should proceed. The first matching rule wins:
///
/// 1. channel disabled -> skipped `channel_disabled`
/// 2. category disabled -> skipped `category_disabled`
/// 3. SMS only: category not SMS-eligible, not entitled, no phone -> skipped
/// 4. quiet hours -> queued `quiet_hours_deferred`
/// 5. otherwise queued
pub fn evaluate_channel_eligibility(input: &ChannelEligibilityInput) -> EligibilityDecision {
    if !input.channel_enabled {
        return EligibilityDecision::skipped(DeliveryReason::ChannelDisabled);
    }
    if !input.category_enabled {
        return EligibilityDecision::skipped(DeliveryReason::CategoryDisabled);
    }

    if input.channel == Channel::Sms {
        if !input.sms_eligible_category {
            return EligibilityDecision::skipped(DeliveryReason::CategoryNotSmsEligible);
        }
        if !input.sms_entitled {
            return EligibilityDecision::skipped(DeliveryReason::NotEntitled);
        }
        if !input.has_sms_phone {
            return EligibilityDecision::skipped(DeliveryReason::NoContactInfo);
        }
    }

    if input.in_quiet_hours {
        return EligibilityDecision::deferred();
    }

    EligibilityDecision::queued()
}
