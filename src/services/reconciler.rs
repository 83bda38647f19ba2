//! State transitions for a single delivery record.
//!
//! Every function returns the record unchanged (with `applied == false`) when
//! the transition is not legal from the current state. Re-delivered provider
//! callbacks and outcomes that race a cancellation rely on this.

use chrono::{DateTime, Utc};

use crate::db::models::{DeliveryReason, DeliveryRecord, DeliveryStatus};
use crate::services::eligibility::EligibilityDecision;
use crate::services::providers::ProviderOutcome;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub record: DeliveryRecord,
    pub applied: bool,
}

impl ReconcileOutcome {
    fn unchanged(record: &DeliveryRecord) -> Self {
        Self {
            record: record.clone(),
            applied: false,
        }
    }

    fn changed(record: DeliveryRecord) -> Self {
        Self {
            record,
            applied: true,
        }
    }
}

/// Fold one provider outcome into a queued record.
pub fn apply_provider_attempt(
    record: &DeliveryRecord,
    outcome: &ProviderOutcome,
    at: DateTime<Utc>,
) -> ReconcileOutcome {
    if record.status != DeliveryStatus::Queued {
        tracing::debug!(
            "Ignoring provider outcome for {}/{} in status {}",
            record.notification_id,
            record.channel,
            record.status
        );
        return ReconcileOutcome::unchanged(record);
    }

    let mut next = record.clone();
    next.attempt_count = record.attempt_count.saturating_add(1);
    next.last_attempt_at = Some(at);
    next.next_attempt_at = None;
    next.updated_at = at;

    match outcome {
        ProviderOutcome::Delivered {
            provider_message_id,
        } => {
            next.status = DeliveryStatus::Sent;
            next.reason = None;
            next.provider_message_id = Some(provider_message_id.clone());
        }
        ProviderOutcome::Failed {
            error_code,
            transient,
        } => {
            next.status = DeliveryStatus::Failed;
            next.reason = Some(DeliveryReason::Provider {
                code: error_code.clone(),
                transient: *transient,
            });
        }
    }

    ReconcileOutcome::changed(next)
}

/// Withdraw a record that has not reached a terminal state.
pub fn apply_cancellation(record: &DeliveryRecord, at: DateTime<Utc>) -> ReconcileOutcome {
    skip(record, DeliveryReason::Cancelled, at)
}

/// Give up on a record that sat in the queue past its time to live.
pub fn apply_expiry(record: &DeliveryRecord, at: DateTime<Utc>) -> ReconcileOutcome {
    skip(record, DeliveryReason::Expired, at)
}

fn skip(record: &DeliveryRecord, reason: DeliveryReason, at: DateTime<Utc>) -> ReconcileOutcome {
    if record.status != DeliveryStatus::Queued {
        return ReconcileOutcome::unchanged(record);
    }

    let mut next = record.clone();
    next.status = DeliveryStatus::Skipped;
    next.reason = Some(reason);
    next.next_attempt_at = None;
    next.updated_at = at;
    ReconcileOutcome::changed(next)
}

/// Apply an eligibility decision to a queued record.
///
/// `resume_at` is the end of the quiet-hours window for deferrals. A queued
/// decision on a previously deferred record clears the deferral. Records that
/// carry a provider reason (pending retry) keep it.
pub fn apply_eligibility(
    record: &DeliveryRecord,
    decision: &EligibilityDecision,
    resume_at: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
) -> ReconcileOutcome {
    if record.status != DeliveryStatus::Queued {
        return ReconcileOutcome::unchanged(record);
    }

    match decision.status {
        DeliveryStatus::Skipped => {
            let reason = decision
                .reason
                .clone()
                .unwrap_or(DeliveryReason::ChannelDisabled);
            skip(record, reason, at)
        }
        DeliveryStatus::Queued if decision.is_deferred() => {
            if record.is_deferred() && record.next_attempt_at == resume_at {
                return ReconcileOutcome::unchanged(record);
            }
            let mut next = record.clone();
            next.reason = Some(DeliveryReason::QuietHoursDeferred);
            next.next_attempt_at = resume_at;
            next.updated_at = at;
            ReconcileOutcome::changed(next)
        }
        DeliveryStatus::Queued if record.is_deferred() => {
            let mut next = record.clone();
            next.reason = None;
            next.next_attempt_at = None;
            next.updated_at = at;
            ReconcileOutcome::changed(next)
        }
        _ => ReconcileOutcome::unchanged(record),
    }
}
