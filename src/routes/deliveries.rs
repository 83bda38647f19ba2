use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{Channel, DeliveryRecord, DeliveryStatus};
use crate::db::DeliveryRecordRepository;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_deliveries))
        .route("/stats", get(get_delivery_stats))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListDeliveriesQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub user_id: Option<String>,
    pub channel: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeliveriesListResponse {
    pub items: Vec<DeliveryRecordResponse>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct DeliveryRecordResponse {
    pub notification_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub reason: Option<String>,
    /// Only set for provider errors.
    pub transient: Option<bool>,
    pub deferred: bool,
    pub provider_message_id: Option<String>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DeliveryRecord> for DeliveryRecordResponse {
    fn from(record: DeliveryRecord) -> Self {
        Self {
            deferred: record.is_deferred(),
            reason: record.reason.as_ref().map(|r| r.code().to_string()),
            transient: record.reason.as_ref().and_then(|r| r.transient()),
            notification_id: record.notification_id,
            user_id: record.user_id,
            channel: record.channel,
            status: record.status,
            provider_message_id: record.provider_message_id,
            attempt_count: record.attempt_count,
            last_attempt_at: record.last_attempt_at,
            next_attempt_at: record.next_attempt_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

pub fn to_responses(records: Vec<DeliveryRecord>) -> Vec<DeliveryRecordResponse> {
    records.into_iter().map(DeliveryRecordResponse::from).collect()
}

#[derive(Debug, Serialize)]
pub struct DeliveryStatsResponse {
    pub total: i64,
    pub by_status: HashMap<String, i64>,
    pub by_channel: HashMap<String, i64>,
}

// ============================================================================
// Handlers
// ============================================================================

/// List delivery records, newest first
async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListDeliveriesQuery>,
) -> AppResult<Json<DeliveriesListResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let channel = query
        .channel
        .as_deref()
        .map(str::parse::<Channel>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DeliveryStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let user_id = query.user_id.as_deref();

    let (records, total) = tokio::try_join!(
        DeliveryRecordRepository::list_with_filters(
            &state.db, user_id, channel, status, per_page, offset
        ),
        DeliveryRecordRepository::count_with_filters(&state.db, user_id, channel, status),
    )?;

    let total_pages = (total as f64 / per_page as f64).ceil() as i64;

    Ok(Json(DeliveriesListResponse {
        items: to_responses(records),
        total,
        page,
        per_page,
        total_pages,
    }))
}

/// Delivery counts by status and by channel
async fn get_delivery_stats(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<DeliveryStatsResponse>> {
    let (by_status, by_channel) = tokio::try_join!(
        DeliveryRecordRepository::counts_by_status(&state.db),
        DeliveryRecordRepository::counts_by_channel(&state.db),
    )?;

    Ok(Json(DeliveryStatsResponse {
        total: by_status.values().sum(),
        by_status,
        by_channel,
    }))
}
