use chrono::{DateTime, Utc};

use crate::db::models::{Channel, DeliveryRecord};

/// Build one queued record per requested channel.
///
/// Duplicate channels collapse to one record; eligibility is not evaluated
/// here so creation stays cheap and preferences are read as late as possible.
pub fn create_queued_deliveries(
    notification_id: &str,
    user_id: &str,
    channels: &[Channel],
    now: DateTime<Utc>,
) -> Vec<DeliveryRecord> {
    let mut seen: Vec<Channel> = Vec::with_capacity(channels.len());
    for channel in channels {
        if !seen.contains(channel) {
            seen.push(*channel);
        }
    }

    seen.into_iter()
        .map(|channel| DeliveryRecord::queued(notification_id, user_id, channel, now))
        .collect()
}
