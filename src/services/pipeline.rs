//! Delivery orchestration: submission, dispatch cycles, cancellation and
//! provider callbacks.
//!
//! Every write goes through [`DeliveryPipeline::transition`], which applies a
//! pure state change to the stored version of a record and persists it with a
//! compare-and-set. When the row moved on underneath us the latest version is
//! reloaded and the change re-applied; terminal records make that a no-op.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::config::{bounded_seconds, Config};
use crate::db::models::{
    Channel, DeliveryRecord, DeliveryStatus, NotificationCategory, NotificationEvent,
};
use crate::db::repository::{DeliveryRecordRepository, NotificationEventRepository};
use crate::error::{AppError, AppResult};
use crate::services::collaborators::{Collaborators, UserDeliveryContext};
use crate::services::deliveries::create_queued_deliveries;
use crate::services::eligibility::evaluate_channel_eligibility;
use crate::services::providers::{DeliveryPayload, ProviderOutcome, ProviderSet};
use crate::services::reconciler::{
    apply_cancellation, apply_eligibility, apply_expiry, apply_provider_attempt,
    ReconcileOutcome,
};
use crate::services::retry::{requeue, RetryPolicy};
use crate::services::status_feed::StatusFeed;

pub const MAX_TITLE_CHARS: usize = 256;
pub const MAX_BODY_CHARS: usize = 4096;

const MAX_WRITE_CONFLICTS: usize = 5;

/// Tunables taken from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub sms_eligible_categories: Vec<NotificationCategory>,
    pub batch_size: i64,
    pub worker_concurrency: usize,
    pub claim_lease: Duration,
    pub ttl: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sms_eligible_categories: config.delivery.sms_eligible_categories.clone(),
            batch_size: i64::from(config.delivery.batch_size),
            worker_concurrency: config.delivery.worker_concurrency.max(1) as usize,
            claim_lease: bounded_seconds(config.delivery.claim_lease_seconds),
            ttl: bounded_seconds(config.delivery.ttl_seconds),
        }
    }
}

/// What happened to one claimed record during a dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Sent,
    Failed,
    RetryScheduled,
    Skipped,
    Deferred,
    /// Outcome arrived after the record left `queued` (e.g. cancelled mid-flight).
    Discarded,
    /// Nothing written; the lease expires and the record is picked up again.
    Released,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub retry_scheduled: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub discarded: usize,
    pub released: usize,
    pub errors: usize,
}

impl DispatchSummary {
    fn record(&mut self, result: DispatchResult) {
        match result {
            DispatchResult::Sent => self.sent += 1,
            DispatchResult::Failed => self.failed += 1,
            DispatchResult::RetryScheduled => self.retry_scheduled += 1,
            DispatchResult::Skipped => self.skipped += 1,
            DispatchResult::Deferred => self.deferred += 1,
            DispatchResult::Discarded => self.discarded += 1,
            DispatchResult::Released => self.released += 1,
        }
    }
}

/// Reject events the pipeline cannot deliver. Policy outcomes never end up here.
pub fn validate_event(event: &NotificationEvent) -> AppResult<()> {
    if event.id.trim().is_empty() {
        return Err(AppError::Validation("id is required".to_string()));
    }
    if event.user_id.trim().is_empty() {
        return Err(AppError::Validation("user_id is required".to_string()));
    }
    if event.title.trim().is_empty() {
        return Err(AppError::Validation("title is required".to_string()));
    }
    if event.title.chars().count() > MAX_TITLE_CHARS {
        return Err(AppError::Validation(format!(
            "title must be at most {} characters",
            MAX_TITLE_CHARS
        )));
    }
    if event.body.chars().count() > MAX_BODY_CHARS {
        return Err(AppError::Validation(format!(
            "body must be at most {} characters",
            MAX_BODY_CHARS
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct DeliveryPipeline {
    pool: SqlitePool,
    collaborators: Collaborators,
    providers: ProviderSet,
    retry: RetryPolicy,
    feed: StatusFeed,
    settings: PipelineSettings,
    permits: Arc<Semaphore>,
    wake: Arc<Notify>,
}

impl DeliveryPipeline {
    pub fn new(
        pool: SqlitePool,
        collaborators: Collaborators,
        providers: ProviderSet,
        feed: StatusFeed,
        config: &Config,
    ) -> Self {
        let settings = PipelineSettings::from_config(config);
        Self {
            pool,
            collaborators,
            providers,
            retry: RetryPolicy::new(&config.notification_retry),
            feed,
            permits: Arc::new(Semaphore::new(settings.worker_concurrency)),
            settings,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn feed(&self) -> &StatusFeed {
        &self.feed
    }

    /// Signalled whenever new work is queued so the dispatch loop need not wait for its poll.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub async fn submit_notification(
        &self,
        event: NotificationEvent,
        channels: Option<Vec<Channel>>,
    ) -> AppResult<Vec<DeliveryRecord>> {
        self.submit_notification_at(event, channels, Utc::now()).await
    }

    /// Store the event, create one record per channel and evaluate eligibility
    /// for the records this call created. Re-submitting an id is a no-op for
    /// channels that already have a record.
    pub async fn submit_notification_at(
        &self,
        event: NotificationEvent,
        channels: Option<Vec<Channel>>,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<DeliveryRecord>> {
        validate_event(&event)?;
        let channels = channels.unwrap_or_else(|| Channel::ALL.to_vec());
        if channels.is_empty() {
            return Err(AppError::Validation(
                "channels must not be empty".to_string(),
            ));
        }

        let inserted = NotificationEventRepository::insert_if_absent(&self.pool, &event, now).await?;
        let stored = NotificationEventRepository::find(&self.pool, &event.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {}", event.id)))?;
        if !inserted {
            if stored.event.user_id != event.user_id {
                return Err(AppError::Validation(format!(
                    "notification {} already exists for another user",
                    event.id
                )));
            }
            tracing::debug!("Notification {} already stored; reusing it", event.id);
        }

        let mut created = Vec::new();
        for record in create_queued_deliveries(&event.id, &event.user_id, &channels, now) {
            if DeliveryRecordRepository::insert_if_absent(&self.pool, &record).await? {
                self.feed.emit(&record, None, now);
                created.push(record);
            }
        }

        if !created.is_empty() {
            tracing::info!(
                "Queued {} deliveries for notification {} ({})",
                created.len(),
                event.id,
                event.category
            );

            if stored.withdrawn_at.is_some() {
                for record in created {
                    self.cancel_record(record, now).await?;
                }
            } else {
                match self.collaborators.load_context(&event.user_id).await {
                    Ok(ctx) => {
                        // Channels are independent; evaluate them concurrently.
                        futures::future::try_join_all(
                            created
                                .into_iter()
                                .map(|record| self.evaluate(record, &ctx, event.category, now)),
                        )
                        .await?;
                    }
                    Err(e) => {
                        // Records stay queued; the dispatch cycle evaluates them.
                        tracing::warn!(
                            "Could not load delivery settings for user {}: {:?}",
                            event.user_id,
                            e
                        );
                    }
                }
            }
            self.wake.notify_one();
        }

        DeliveryRecordRepository::find_by_notification(&self.pool, &event.id).await
    }

    /// Withdraw a notification: every queued record becomes `skipped/cancelled`.
    /// Attempts already in flight finish but their outcome is discarded.
    pub async fn cancel_notification(&self, notification_id: &str) -> AppResult<Vec<DeliveryRecord>> {
        let now = Utc::now();
        if NotificationEventRepository::find(&self.pool, notification_id)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound(format!("Notification {}", notification_id)));
        }

        if NotificationEventRepository::mark_withdrawn(&self.pool, notification_id, now).await? {
            tracing::info!("Notification {} withdrawn", notification_id);
        }

        let mut records = Vec::new();
        for record in DeliveryRecordRepository::find_by_notification(&self.pool, notification_id).await? {
            records.push(self.cancel_record(record, now).await?.record);
        }
        Ok(records)
    }

    pub async fn apply_provider_callback(
        &self,
        notification_id: &str,
        channel: Channel,
        attempt: u32,
        outcome: ProviderOutcome,
    ) -> AppResult<DeliveryRecord> {
        self.apply_provider_callback_at(notification_id, channel, attempt, outcome, Utc::now())
            .await
    }

    /// Reconcile an outcome reported asynchronously by a provider.
    ///
    /// Only the attempt currently in flight can be reconciled: the record must
    /// hold a live dispatch lease and `attempt` must be the one being sent.
    /// Anything else (deferred records, records waiting for a retry, replays,
    /// terminal records) is returned unchanged.
    pub async fn apply_provider_callback_at(
        &self,
        notification_id: &str,
        channel: Channel,
        attempt: u32,
        outcome: ProviderOutcome,
        now: DateTime<Utc>,
    ) -> AppResult<DeliveryRecord> {
        let record = DeliveryRecordRepository::find(&self.pool, notification_id, channel)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Delivery {}/{}", notification_id, channel))
            })?;

        let in_flight = DeliveryRecordRepository::lease_expiry(&self.pool, notification_id, channel)
            .await?
            .is_some_and(|until| until > now);
        if !in_flight {
            tracing::debug!(
                "Callback for {}/{} attempt {} ignored; no attempt in flight (record {}, {} attempts)",
                notification_id,
                channel,
                attempt,
                record.status,
                record.attempt_count
            );
            return Ok(record);
        }

        let stored = self
            .transition(record, now, |current| {
                self.reconcile_attempt(current, attempt, &outcome, now)
            })
            .await?;
        if !stored.applied {
            tracing::debug!(
                "Callback for {}/{} attempt {} ignored; record is {} after {} attempts",
                notification_id,
                channel,
                attempt,
                stored.record.status,
                stored.record.attempt_count
            );
        }
        Ok(stored.record)
    }

    /// Claim due records and process them concurrently, bounded by the worker permits.
    ///
    /// A record is leased only once a permit is free for it, so a lease never
    /// runs down while the record waits for a worker. `now` is the cycle's start;
    /// each record is stamped with the time it was actually claimed.
    pub async fn run_dispatch_cycle(&self, now: DateTime<Utc>) -> AppResult<DispatchSummary> {
        let started = Utc::now();
        let mut summary = DispatchSummary::default();
        let mut tasks = JoinSet::new();

        while (summary.claimed as i64) < self.settings.batch_size {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!("Dispatch permits unavailable: {}", e);
                    break;
                }
            };

            let at = now + (Utc::now() - started);
            let claimed = match DeliveryRecordRepository::claim_due(
                &self.pool,
                1,
                at,
                at + self.settings.claim_lease,
            )
            .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!("Claiming due deliveries failed: {:?}", e);
                    break;
                }
            };
            let Some(record) = claimed.into_iter().next() else {
                break;
            };

            summary.claimed += 1;
            let pipeline = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let key = format!("{}/{}", record.notification_id, record.channel);
                (key, pipeline.process_claimed(record, at).await)
            });
        }

        if summary.claimed == 0 {
            return Ok(summary);
        }
        tracing::debug!("Claimed {} due deliveries", summary.claimed);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(result))) => summary.record(result),
                Ok((key, Err(e))) => {
                    summary.errors += 1;
                    tracing::warn!("Dispatch of {} failed: {:?}", key, e);
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!("Dispatch task panicked or was cancelled: {}", e);
                }
            }
        }

        tracing::info!(
            "Dispatch cycle: claimed={} sent={} failed={} retrying={} skipped={} deferred={} errors={}",
            summary.claimed,
            summary.sent,
            summary.failed,
            summary.retry_scheduled,
            summary.skipped,
            summary.deferred,
            summary.errors
        );
        Ok(summary)
    }

    /// Take one leased record through cancellation, expiry, eligibility and dispatch.
    pub async fn process_claimed(
        &self,
        record: DeliveryRecord,
        now: DateTime<Utc>,
    ) -> AppResult<DispatchResult> {
        let stored = NotificationEventRepository::find(&self.pool, &record.notification_id).await?;
        let event = match stored {
            Some(stored) if stored.withdrawn_at.is_none() => stored.event,
            _ => {
                let stored = self.cancel_record(record, now).await?;
                return Ok(settled(&stored.record));
            }
        };

        // Deferred records and records already attempted are bounded by quiet
        // hours and the retry limit; the TTL only catches records never picked up.
        if record.attempt_count == 0
            && !record.is_deferred()
            && now - record.created_at > self.settings.ttl
        {
            tracing::info!(
                "Delivery {}/{} expired after {}s in queue",
                record.notification_id,
                record.channel,
                (now - record.created_at).num_seconds()
            );
            let stored = self
                .transition(record, now, |current| {
                    let outcome = apply_expiry(current, now);
                    outcome.applied.then(|| vec![outcome.record])
                })
                .await?;
            return Ok(settled(&stored.record));
        }

        let ctx = match self.collaborators.load_context(&record.user_id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(
                    "Could not load delivery settings for user {}; retrying after lease: {:?}",
                    record.user_id,
                    e
                );
                return Ok(DispatchResult::Released);
            }
        };

        let input = ctx.eligibility_input(
            record.channel,
            event.category,
            &self.settings.sms_eligible_categories,
            now,
        );
        let decision = evaluate_channel_eligibility(&input);
        if !decision.is_dispatchable() {
            let (notification_id, channel) = (record.notification_id.clone(), record.channel);
            let (result, applied) = self.evaluate(record, &ctx, event.category, now).await?;
            if !applied {
                DeliveryRecordRepository::release_claim(&self.pool, &notification_id, channel)
                    .await?;
            }
            return Ok(result);
        }

        // Clearing an elapsed deferral happens in memory; the attempt write persists it.
        let ready = apply_eligibility(&record, &decision, None, now).record;
        let destination = match record.channel {
            Channel::Sms => match ctx.phone.clone() {
                Some(phone) => phone,
                None => return Ok(DispatchResult::Released),
            },
            Channel::Push | Channel::Email => record.user_id.clone(),
        };

        let attempt = record.attempt_count.saturating_add(1);
        let payload = DeliveryPayload::for_attempt(&event, attempt);
        let outcome = self
            .providers
            .dispatch(record.channel, &destination, &payload)
            .await;

        let stored = self
            .transition(record, now, |current| {
                let base = if current.status == ready.status
                    && current.attempt_count == ready.attempt_count
                {
                    &ready
                } else {
                    current
                };
                self.reconcile_attempt(base, attempt, &outcome, now)
            })
            .await?;

        if !stored.applied {
            tracing::info!(
                "Discarded provider outcome for {}/{}; record is {}",
                stored.record.notification_id,
                stored.record.channel,
                stored.record.status
            );
            return Ok(DispatchResult::Discarded);
        }
        Ok(match stored.record.status {
            DeliveryStatus::Sent => DispatchResult::Sent,
            DeliveryStatus::Queued => DispatchResult::RetryScheduled,
            DeliveryStatus::Failed | DeliveryStatus::Skipped => DispatchResult::Failed,
        })
    }

    /// Fold the outcome of attempt number `attempt` into a record and schedule
    /// the retry in the same write. Outcomes for any other attempt are dropped.
    fn reconcile_attempt(
        &self,
        record: &DeliveryRecord,
        attempt: u32,
        outcome: &ProviderOutcome,
        at: DateTime<Utc>,
    ) -> Option<Vec<DeliveryRecord>> {
        if record.attempt_count.saturating_add(1) != attempt {
            return None;
        }
        let attempted = apply_provider_attempt(record, outcome, at);
        if !attempted.applied {
            return None;
        }

        let mut steps = vec![attempted.record.clone()];
        if attempted.record.status == DeliveryStatus::Failed {
            let decision = self.retry.schedule_retry(&attempted.record, at);
            match decision.not_before {
                Some(not_before) if decision.retry => {
                    steps.push(requeue(&attempted.record, not_before, at));
                }
                _ => tracing::warn!(
                    "Delivery {}/{} failed permanently after {} attempt(s): {}",
                    attempted.record.notification_id,
                    attempted.record.channel,
                    attempted.record.attempt_count,
                    attempted
                        .record
                        .reason
                        .as_ref()
                        .map(|r| r.code())
                        .unwrap_or("unknown")
                ),
            }
        }
        Some(steps)
    }

    /// Apply the eligibility decision for a queued record and persist it.
    /// Returns whether anything was written.
    async fn evaluate(
        &self,
        record: DeliveryRecord,
        ctx: &UserDeliveryContext,
        category: NotificationCategory,
        now: DateTime<Utc>,
    ) -> AppResult<(DispatchResult, bool)> {
        let input = ctx.eligibility_input(
            record.channel,
            category,
            &self.settings.sms_eligible_categories,
            now,
        );
        let decision = evaluate_channel_eligibility(&input);
        let resume_at = ctx.quiet_hours_end(now);

        let stored = self
            .transition(record, now, |current| {
                let outcome = apply_eligibility(current, &decision, resume_at, now);
                outcome.applied.then(|| vec![outcome.record])
            })
            .await?;
        let record = &stored.record;

        let result = if record.is_deferred() {
            tracing::info!(
                "Delivery {}/{} deferred by quiet hours until {:?}",
                record.notification_id,
                record.channel,
                record.next_attempt_at
            );
            DispatchResult::Deferred
        } else if record.status == DeliveryStatus::Skipped {
            tracing::debug!(
                "Delivery {}/{} skipped: {}",
                record.notification_id,
                record.channel,
                record.reason.as_ref().map(|r| r.code()).unwrap_or("unknown")
            );
            DispatchResult::Skipped
        } else {
            DispatchResult::Released
        };
        Ok((result, stored.applied))
    }

    async fn cancel_record(
        &self,
        record: DeliveryRecord,
        now: DateTime<Utc>,
    ) -> AppResult<ReconcileOutcome> {
        self.transition(record, now, |current| {
            let outcome = apply_cancellation(current, now);
            outcome.applied.then(|| vec![outcome.record])
        })
        .await
    }

    /// Apply `change` to the latest stored version of `record` and persist it.
    ///
    /// `change` returns the sequence of states the record passes through (the
    /// last one is stored) or `None` when nothing applies. Each intermediate
    /// state is emitted on the status feed.
    async fn transition<F>(
        &self,
        record: DeliveryRecord,
        at: DateTime<Utc>,
        change: F,
    ) -> AppResult<ReconcileOutcome>
    where
        F: Fn(&DeliveryRecord) -> Option<Vec<DeliveryRecord>>,
    {
        let mut current = record;
        for _ in 0..MAX_WRITE_CONFLICTS {
            let unchanged = |record: DeliveryRecord| ReconcileOutcome {
                record,
                applied: false,
            };
            let steps = match change(&current) {
                Some(steps) => steps,
                None => return Ok(unchanged(current)),
            };
            let next = match steps.last() {
                Some(next) => next.clone(),
                None => return Ok(unchanged(current)),
            };

            if DeliveryRecordRepository::compare_and_set(&self.pool, &current, &next).await? {
                let mut previous = current.status;
                for step in &steps {
                    self.feed.emit(step, Some(previous), at);
                    previous = step.status;
                }
                return Ok(ReconcileOutcome {
                    record: next,
                    applied: true,
                });
            }

            tracing::debug!(
                "Delivery {}/{} changed concurrently; reloading",
                current.notification_id,
                current.channel
            );
            current = DeliveryRecordRepository::find(
                &self.pool,
                &current.notification_id,
                current.channel,
            )
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Delivery {}/{}",
                    current.notification_id, current.channel
                ))
            })?;
        }

        Err(AppError::Internal(anyhow::anyhow!(
            "delivery {}/{} kept changing underneath {} writes",
            current.notification_id,
            current.channel,
            MAX_WRITE_CONFLICTS
        )))
    }
}

fn settled(record: &DeliveryRecord) -> DispatchResult {
    if record.status == DeliveryStatus::Skipped {
        DispatchResult::Skipped
    } else {
        DispatchResult::Discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ChannelPreferences, DeliveryReason, QuietHoursWindow};
    use crate::db::repository::DeliveryStatusLogRepository;
    use crate::test_support::{
        sample_event, test_pool, ScriptedProvider, ScriptedProviders, StaticDirectory,
    };
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;

    struct Harness {
        pipeline: DeliveryPipeline,
        providers: ScriptedProviders,
        pool: SqlitePool,
    }

    async fn harness(directory: StaticDirectory) -> Harness {
        let pool = test_pool().await;
        let providers = ScriptedProviders::new();
        let pipeline = DeliveryPipeline::new(
            pool.clone(),
            Collaborators::from_single(Arc::new(directory)),
            providers.provider_set(),
            StatusFeed::new(),
            &Config::default(),
        );
        Harness {
            pipeline,
            providers,
            pool,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn by_channel(records: &[DeliveryRecord], channel: Channel) -> DeliveryRecord {
        records
            .iter()
            .find(|r| r.channel == channel)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn submit_creates_one_record_per_channel_once() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;

        let records = h
            .pipeline
            .submit_notification_at(sample_event("n1", "u1"), None, t0())
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == DeliveryStatus::Queued));

        let again = h
            .pipeline
            .submit_notification_at(sample_event("n1", "u1"), None, t0())
            .await
            .unwrap();
        assert_eq!(again.len(), 3);
    }

    #[tokio::test]
    async fn policy_skips_are_resolved_at_submission() {
        // No entitlement, no phone.
        let h = harness(StaticDirectory::default()).await;
        let records = h
            .pipeline
            .submit_notification_at(sample_event("n1", "u1"), None, t0())
            .await
            .unwrap();

        let sms = by_channel(&records, Channel::Sms);
        assert_eq!(sms.status, DeliveryStatus::Skipped);
        assert_eq!(sms.reason, Some(DeliveryReason::NotEntitled));
        assert_eq!(by_channel(&records, Channel::Push).status, DeliveryStatus::Queued);
    }

    #[tokio::test]
    async fn invalid_events_are_rejected() {
        let h = harness(StaticDirectory::default()).await;

        let mut event = sample_event("n1", "u1");
        event.title = "   ".to_string();
        let err = h
            .pipeline
            .submit_notification_at(event, None, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut event = sample_event("n2", "u1");
        event.body = "x".repeat(MAX_BODY_CHARS + 1);
        assert!(h.pipeline.submit_notification_at(event, None, t0()).await.is_err());

        let err = h
            .pipeline
            .submit_notification_at(sample_event("n3", "u1"), Some(vec![]), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Same id, different user.
        h.pipeline
            .submit_notification_at(sample_event("n4", "u1"), None, t0())
            .await
            .unwrap();
        assert!(h
            .pipeline
            .submit_notification_at(sample_event("n4", "u2"), None, t0())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn dispatch_cycle_sends_every_channel() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), None, t0())
            .await
            .unwrap();

        let summary = h.pipeline.run_dispatch_cycle(t0()).await.unwrap();
        assert_eq!(summary.claimed, 3);
        assert_eq!(summary.sent, 3);

        let records = DeliveryRecordRepository::find_by_notification(&h.pool, "n1")
            .await
            .unwrap();
        for record in &records {
            assert_eq!(record.status, DeliveryStatus::Sent);
            assert_eq!(record.attempt_count, 1);
            assert!(record.provider_message_id.is_some());
        }
        assert_eq!(h.providers.sms.calls(), vec!["+15555550100".to_string()]);
        assert_eq!(h.providers.push.calls(), vec!["u1".to_string()]);

        // Nothing left to do.
        let summary = h.pipeline.run_dispatch_cycle(t0()).await.unwrap();
        assert_eq!(summary.claimed, 0);
    }

    #[tokio::test]
    async fn quiet_hours_defer_until_window_closes() {
        let directory = StaticDirectory::sms_ready("u1");
        directory.set_quiet_hours("u1", QuietHoursWindow::parse("22:00", "07:00", "UTC").unwrap());
        let h = harness(directory).await;

        let night = Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2024, 6, 2, 7, 0, 0).unwrap();
        let records = h
            .pipeline
            .submit_notification_at(sample_event("n1", "u1"), None, night)
            .await
            .unwrap();
        for record in &records {
            assert!(record.is_deferred());
            assert_eq!(record.next_attempt_at, Some(morning));
        }

        let summary = h
            .pipeline
            .run_dispatch_cycle(night + Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(summary.claimed, 0);

        let summary = h.pipeline.run_dispatch_cycle(morning).await.unwrap();
        assert_eq!(summary.sent, 3);
        let records = DeliveryRecordRepository::find_by_notification(&h.pool, "n1")
            .await
            .unwrap();
        assert!(records
            .iter()
            .all(|r| r.status == DeliveryStatus::Sent && r.reason.is_none()));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_attempts_run_out() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;
        for _ in 0..5 {
            h.providers
                .sms
                .push_outcome(ProviderOutcome::failed("provider_5xx", true));
        }
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), Some(vec![Channel::Sms]), t0())
            .await
            .unwrap();

        let mut now = t0();
        for attempt in 1..=5u32 {
            let summary = h.pipeline.run_dispatch_cycle(now).await.unwrap();
            assert_eq!(summary.claimed, 1, "attempt {}", attempt);
            let record = DeliveryRecordRepository::find(&h.pool, "n1", Channel::Sms)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.attempt_count, attempt);
            if attempt < 5 {
                assert_eq!(record.status, DeliveryStatus::Queued);
                assert!(record.next_attempt_at.unwrap() > now);
                // Not due before the backoff elapses.
                assert_eq!(h.pipeline.run_dispatch_cycle(now).await.unwrap().claimed, 0);
            } else {
                assert_eq!(record.status, DeliveryStatus::Failed);
                assert_eq!(
                    record.reason,
                    Some(DeliveryReason::Provider {
                        code: "provider_5xx".to_string(),
                        transient: true
                    })
                );
            }
            now = now + Duration::hours(1);
        }

        assert_eq!(h.pipeline.run_dispatch_cycle(now).await.unwrap().claimed, 0);
        assert_eq!(h.providers.sms.calls().len(), 5);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;
        h.providers
            .push
            .push_outcome(ProviderOutcome::failed("invalid_token", false));
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), Some(vec![Channel::Push]), t0())
            .await
            .unwrap();

        let summary = h.pipeline.run_dispatch_cycle(t0()).await.unwrap();
        assert_eq!(summary.failed, 1);
        let summary = h
            .pipeline
            .run_dispatch_cycle(t0() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(summary.claimed, 0);
    }

    #[tokio::test]
    async fn sms_failure_leaves_other_channels_alone() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;
        h.providers
            .sms
            .push_outcome(ProviderOutcome::failed("invalid_phone", false));
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), None, t0())
            .await
            .unwrap();
        h.pipeline.run_dispatch_cycle(t0()).await.unwrap();

        let records = DeliveryRecordRepository::find_by_notification(&h.pool, "n1")
            .await
            .unwrap();
        assert_eq!(by_channel(&records, Channel::Sms).status, DeliveryStatus::Failed);
        assert_eq!(by_channel(&records, Channel::Push).status, DeliveryStatus::Sent);
        assert_eq!(by_channel(&records, Channel::Email).status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn cancellation_skips_pending_records() {
        let h = harness(StaticDirectory::default()).await;
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), None, t0())
            .await
            .unwrap();

        let records = h.pipeline.cancel_notification("n1").await.unwrap();
        assert_eq!(by_channel(&records, Channel::Push).reason, Some(DeliveryReason::Cancelled));
        assert_eq!(by_channel(&records, Channel::Email).status, DeliveryStatus::Skipped);
        // Already terminal before cancellation.
        assert_eq!(by_channel(&records, Channel::Sms).reason, Some(DeliveryReason::NotEntitled));

        assert_eq!(h.pipeline.run_dispatch_cycle(t0()).await.unwrap().claimed, 0);
        assert!(h.providers.push.calls().is_empty());

        // Idempotent.
        assert_eq!(h.pipeline.cancel_notification("n1").await.unwrap().len(), 3);
        assert!(matches!(
            h.pipeline.cancel_notification("missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn outcome_racing_cancellation_is_discarded() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), Some(vec![Channel::Email]), t0())
            .await
            .unwrap();

        // A worker leased the record, then the notification was withdrawn.
        let claimed = DeliveryRecordRepository::claim_due(&h.pool, 1, t0(), t0() + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        h.pipeline.cancel_notification("n1").await.unwrap();

        let result = h
            .pipeline
            .apply_provider_callback_at(
                "n1",
                Channel::Email,
                1,
                ProviderOutcome::Delivered {
                    provider_message_id: "late".to_string(),
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(result.status, DeliveryStatus::Skipped);
        assert!(result.provider_message_id.is_none());

        let result = h.pipeline.process_claimed(claimed[0].clone(), t0()).await.unwrap();
        assert_eq!(result, DispatchResult::Skipped);
        assert!(h.providers.email.calls().is_empty());
    }

    #[tokio::test]
    async fn callbacks_are_idempotent_on_sent_records() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), Some(vec![Channel::Sms]), t0())
            .await
            .unwrap();
        DeliveryRecordRepository::claim_due(&h.pool, 1, t0(), t0() + Duration::minutes(2))
            .await
            .unwrap();

        let sent = h
            .pipeline
            .apply_provider_callback_at(
                "n1",
                Channel::Sms,
                1,
                ProviderOutcome::Delivered {
                    provider_message_id: "SM123".to_string(),
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert_eq!(sent.provider_message_id.as_deref(), Some("SM123"));

        let replay = h
            .pipeline
            .apply_provider_callback_at(
                "n1",
                Channel::Sms,
                1,
                ProviderOutcome::failed("timeout", true),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(replay.status, DeliveryStatus::Sent);
        assert_eq!(replay.provider_message_id.as_deref(), Some("SM123"));
        assert_eq!(replay.attempt_count, 1);

        assert!(matches!(
            h.pipeline
                .apply_provider_callback_at(
                    "n1",
                    Channel::Push,
                    1,
                    ProviderOutcome::failed("x", false),
                    t0()
                )
                .await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn callbacks_without_an_attempt_in_flight_change_nothing() {
        let directory = StaticDirectory::sms_ready("u1");
        directory.set_quiet_hours("u1", QuietHoursWindow::parse("22:00", "07:00", "UTC").unwrap());
        let h = harness(directory).await;
        let night = Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap();
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), Some(vec![Channel::Sms]), night)
            .await
            .unwrap();

        // Deferred by quiet hours: never sent, so nothing to report on.
        for outcome in [
            ProviderOutcome::failed("provider_5xx", true),
            ProviderOutcome::Delivered {
                provider_message_id: "SM1".to_string(),
            },
        ] {
            let record = h
                .pipeline
                .apply_provider_callback_at("n1", Channel::Sms, 1, outcome, night)
                .await
                .unwrap();
            assert!(record.is_deferred());
            assert_eq!(record.attempt_count, 0);
        }

        // Waiting for a retry after a transient failure.
        let morning = Utc.with_ymd_and_hms(2024, 6, 2, 7, 0, 0).unwrap();
        h.providers
            .sms
            .push_outcome(ProviderOutcome::failed("provider_5xx", true));
        h.pipeline.run_dispatch_cycle(morning).await.unwrap();
        let waiting = h
            .pipeline
            .apply_provider_callback_at(
                "n1",
                Channel::Sms,
                2,
                ProviderOutcome::Delivered {
                    provider_message_id: "SM2".to_string(),
                },
                morning,
            )
            .await
            .unwrap();
        assert_eq!(waiting.status, DeliveryStatus::Queued);
        assert_eq!(waiting.attempt_count, 1);

        // Leased for attempt 2: a report for another attempt is dropped.
        let retry_at = waiting.next_attempt_at.unwrap();
        DeliveryRecordRepository::claim_due(&h.pool, 1, retry_at, retry_at + Duration::minutes(2))
            .await
            .unwrap();
        let stale = h
            .pipeline
            .apply_provider_callback_at(
                "n1",
                Channel::Sms,
                1,
                ProviderOutcome::Delivered {
                    provider_message_id: "SM1".to_string(),
                },
                retry_at,
            )
            .await
            .unwrap();
        assert_eq!(stale.status, DeliveryStatus::Queued);
        assert_eq!(stale.attempt_count, 1);
        assert_eq!(h.providers.sms.calls().len(), 1);
    }

    #[tokio::test]
    async fn callback_during_send_wins_over_the_synchronous_outcome() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), Some(vec![Channel::Email]), t0())
            .await
            .unwrap();
        let claimed = DeliveryRecordRepository::claim_due(&h.pool, 1, t0(), t0() + Duration::minutes(2))
            .await
            .unwrap();

        let reported = h
            .pipeline
            .apply_provider_callback_at(
                "n1",
                Channel::Email,
                1,
                ProviderOutcome::Delivered {
                    provider_message_id: "relay-1".to_string(),
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(reported.status, DeliveryStatus::Sent);

        let result = h.pipeline.process_claimed(claimed[0].clone(), t0()).await.unwrap();
        assert_eq!(result, DispatchResult::Discarded);
        let record = DeliveryRecordRepository::find(&h.pool, "n1", Channel::Email)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.provider_message_id.as_deref(), Some("relay-1"));
    }

    #[tokio::test]
    async fn records_are_leased_only_when_a_worker_is_free() {
        let pool = test_pool().await;
        let slow = || Arc::new(ScriptedProvider::with_delay(StdDuration::from_millis(200)));
        let providers = ScriptedProviders {
            push: slow(),
            email: slow(),
            sms: slow(),
        };
        let mut config = Config::default();
        config.delivery.worker_concurrency = 1;
        let dispatcher = || {
            DeliveryPipeline::new(
                pool.clone(),
                Collaborators::from_single(Arc::new(StaticDirectory::sms_ready("u1"))),
                providers.provider_set(),
                StatusFeed::new(),
                &config,
            )
        };
        let first = dispatcher();
        let second = dispatcher();
        first
            .submit_notification_at(sample_event("n1", "u1"), None, t0())
            .await
            .unwrap();

        let busy = tokio::spawn({
            let first = first.clone();
            async move { first.run_dispatch_cycle(t0()).await.unwrap() }
        });
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let other = second.run_dispatch_cycle(t0()).await.unwrap();
        let busy = busy.await.unwrap();

        // The busy dispatcher left the records it had no worker for.
        assert!(other.claimed >= 1);
        assert_eq!(busy.claimed + other.claimed, 3);
        assert_eq!(busy.discarded + other.discarded, 0);

        let sends = providers.push.calls().len()
            + providers.email.calls().len()
            + providers.sms.calls().len();
        assert_eq!(sends, 3);
        for record in DeliveryRecordRepository::find_by_notification(&pool, "n1")
            .await
            .unwrap()
        {
            assert_eq!(record.status, DeliveryStatus::Sent);
            assert_eq!(record.attempt_count, 1);
        }
    }

    #[tokio::test]
    async fn stored_preferences_skip_channels() {
        let directory = StaticDirectory::sms_ready("u1");
        let mut preferences = ChannelPreferences::default();
        preferences.push.enabled = false;
        preferences
            .email
            .categories
            .insert(NotificationCategory::Broadcast, false);
        directory.set_preferences("u1", preferences);
        let h = harness(directory).await;

        let records = h
            .pipeline
            .submit_notification_at(sample_event("n1", "u1"), None, t0())
            .await
            .unwrap();
        let push = by_channel(&records, Channel::Push);
        assert_eq!(push.status, DeliveryStatus::Skipped);
        assert_eq!(push.reason, Some(DeliveryReason::ChannelDisabled));
        let email = by_channel(&records, Channel::Email);
        assert_eq!(email.status, DeliveryStatus::Skipped);
        assert_eq!(email.reason, Some(DeliveryReason::CategoryDisabled));

        let summary = h.pipeline.run_dispatch_cycle(t0()).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert!(h.providers.push.calls().is_empty());
        assert!(h.providers.email.calls().is_empty());
    }

    #[tokio::test]
    async fn deferral_outliving_the_ttl_is_still_delivered() {
        let directory = StaticDirectory::sms_ready("u1");
        directory.set_quiet_hours("u1", QuietHoursWindow::parse("22:00", "07:00", "UTC").unwrap());
        let h = harness(directory).await;
        let night = Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap();
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), Some(vec![Channel::Push]), night)
            .await
            .unwrap();

        // Dispatcher was down until the next morning, more than a day later.
        let later = Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap();
        let summary = h.pipeline.run_dispatch_cycle(later).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(h.providers.push.calls().len(), 1);
    }

    #[tokio::test]
    async fn stale_records_expire() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), Some(vec![Channel::Push]), t0())
            .await
            .unwrap();

        let summary = h
            .pipeline
            .run_dispatch_cycle(t0() + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        let record = DeliveryRecordRepository::find(&h.pool, "n1", Channel::Push)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.reason, Some(DeliveryReason::Expired));
        assert!(h.providers.push.calls().is_empty());
    }

    #[tokio::test]
    async fn every_transition_is_published() {
        let h = harness(StaticDirectory::sms_ready("u1")).await;
        let mut rx = h.pipeline.feed().subscribe();
        h.providers
            .push
            .push_outcome(ProviderOutcome::failed("rate_limited", true));
        h.pipeline
            .submit_notification_at(sample_event("n1", "u1"), Some(vec![Channel::Push]), t0())
            .await
            .unwrap();
        h.pipeline.run_dispatch_cycle(t0()).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(change) = rx.try_recv() {
            seen.push((change.previous_status, change.status));
        }
        assert_eq!(
            seen,
            vec![
                (None, DeliveryStatus::Queued),
                (Some(DeliveryStatus::Queued), DeliveryStatus::Failed),
                (Some(DeliveryStatus::Failed), DeliveryStatus::Queued),
            ]
        );

        // History is written by the audit logger; nothing logged without it.
        assert!(DeliveryStatusLogRepository::find_by_notification(&h.pool, "n1")
            .await
            .unwrap()
            .is_empty());
    }
}
