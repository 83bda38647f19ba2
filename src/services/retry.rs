use chrono::{DateTime, Duration, Utc};

use crate::config::{bounded_seconds, NotificationRetryConfig};
use crate::db::models::{DeliveryRecord, DeliveryStatus};

/// Exponential backoff with a cap and an attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: &NotificationRetryConfig) -> Self {
        Self {
            base_delay: bounded_seconds(config.initial_backoff_seconds),
            max_delay: bounded_seconds(config.max_backoff_seconds),
            max_attempts: config.max_attempts,
        }
    }

    /// `min(base * 2^(attempt_count - 1), max)`
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(62);
        let factor = 1i64 << exponent;
        let base_ms = self.base_delay.num_milliseconds();
        let delay_ms = base_ms
            .saturating_mul(factor)
            .min(self.max_delay.num_milliseconds());
        Duration::milliseconds(delay_ms)
    }

    pub fn schedule_retry(&self, record: &DeliveryRecord, now: DateTime<Utc>) -> RetryDecision {
        if !record.has_transient_failure() {
            return RetryDecision::give_up();
        }
        if record.attempt_count >= self.max_attempts {
            tracing::info!(
                "Delivery {}/{} exhausted {} attempts",
                record.notification_id,
                record.channel,
                record.attempt_count
            );
            return RetryDecision::give_up();
        }

        let base = record.last_attempt_at.unwrap_or(now);
        RetryDecision {
            retry: true,
            not_before: Some(base + self.backoff_delay(record.attempt_count)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&NotificationRetryConfig {
            initial_backoff_seconds: 30,
            max_backoff_seconds: 3600,
            max_attempts: 5,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub not_before: Option<DateTime<Utc>>,
}

impl RetryDecision {
    fn give_up() -> Self {
        Self {
            retry: false,
            not_before: None,
        }
    }
}

/// Put a failed record back in the queue. `attempt_count` and the last
/// failure reason are kept so the history stays visible.
pub fn requeue(record: &DeliveryRecord, not_before: DateTime<Utc>, at: DateTime<Utc>) -> DeliveryRecord {
    let mut next = record.clone();
    if record.status == DeliveryStatus::Failed {
        next.status = DeliveryStatus::Queued;
        next.next_attempt_at = Some(not_before);
        next.updated_at = at;
    }
    next
}
