//! Outbound feed of delivery state transitions.
//!
//! Consumers must tolerate at-least-once delivery: the same change may be
//! emitted again when a write is retried. The audit logger dedups on
//! (notification, channel, status, attempt count, reason).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::db::models::{DeliveryRecord, DeliveryStatus};
use crate::db::repository::DeliveryStatusLogRepository;

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStatusChanged {
    pub notification_id: String,
    pub user_id: String,
    pub channel: String,
    pub previous_status: Option<DeliveryStatus>,
    pub status: DeliveryStatus,
    pub reason: Option<String>,
    pub attempt_count: u32,
    pub provider_message_id: Option<String>,
    pub at: DateTime<Utc>,
    #[serde(skip)]
    pub record: DeliveryRecord,
}

impl DeliveryStatusChanged {
    pub fn new(record: &DeliveryRecord, previous_status: Option<DeliveryStatus>, at: DateTime<Utc>) -> Self {
        Self {
            notification_id: record.notification_id.clone(),
            user_id: record.user_id.clone(),
            channel: record.channel.to_string(),
            previous_status,
            status: record.status,
            reason: record.reason.as_ref().map(|r| r.code().to_string()),
            attempt_count: record.attempt_count,
            provider_message_id: record.provider_message_id.clone(),
            at,
            record: record.clone(),
        }
    }
}

#[derive(Clone)]
pub struct StatusFeed {
    sender: broadcast::Sender<DeliveryStatusChanged>,
}

impl StatusFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryStatusChanged> {
        self.sender.subscribe()
    }

    /// Publish a transition. Having no subscribers is not an error.
    pub fn emit(&self, record: &DeliveryRecord, previous_status: Option<DeliveryStatus>, at: DateTime<Utc>) {
        let change = DeliveryStatusChanged::new(record, previous_status, at);
        tracing::debug!(
            "Delivery {}/{} {} -> {}{}",
            change.notification_id,
            change.channel,
            previous_status.map(|s| s.as_str()).unwrap_or("new"),
            change.status,
            change
                .reason
                .as_deref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        let _ = self.sender.send(change);
    }
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Persist every status change into `delivery_status_log` until shutdown.
pub fn spawn_audit_logger(
    feed: &StatusFeed,
    pool: SqlitePool,
    shutdown: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut changes = feed.subscribe();
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Delivery audit logger shutting down");
                    break;
                }
                received = changes.recv() => match received {
                    Ok(change) => {
                        if let Err(e) = DeliveryStatusLogRepository::record_change(
                            &pool,
                            &change.record,
                            change.previous_status,
                            change.at,
                        )
                        .await
                        {
                            tracing::warn!(
                                "Failed to write audit entry for {}/{}: {:?}",
                                change.notification_id,
                                change.channel,
                                e
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Delivery audit logger lagged; {} status changes not logged", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
