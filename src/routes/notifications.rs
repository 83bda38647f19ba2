use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::{Channel, DeliveryStatusLog, NotificationEvent};
use crate::db::{DeliveryRecordRepository, DeliveryStatusLogRepository};
use crate::error::{AppError, AppResult};
use crate::routes::deliveries::{to_responses, DeliveryRecordResponse};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(submit_notification))
        .route("/:id", delete(cancel_notification))
        .route("/:id/deliveries", get(get_deliveries))
        .route("/:id/history", get(get_history))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitNotificationRequest {
    #[serde(flatten)]
    pub event: NotificationEvent,
    /// Defaults to every channel.
    pub channels: Option<Vec<Channel>>,
}

#[derive(Debug, Serialize)]
pub struct NotificationDeliveriesResponse {
    pub notification_id: String,
    pub deliveries: Vec<DeliveryRecordResponse>,
}

#[derive(Debug, Serialize)]
pub struct NotificationHistoryResponse {
    pub notification_id: String,
    pub history: Vec<DeliveryStatusLog>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a notification for delivery
async fn submit_notification(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitNotificationRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<NotificationDeliveriesResponse>)> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let notification_id = request.event.id.clone();

    let records = state
        .pipeline
        .submit_notification(request.event, request.channels)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(NotificationDeliveriesResponse {
            notification_id,
            deliveries: to_responses(records),
        }),
    ))
}

/// Per-channel delivery state of one notification
async fn get_deliveries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationDeliveriesResponse>> {
    let records = DeliveryRecordRepository::find_by_notification(&state.db, &id).await?;
    if records.is_empty() {
        return Err(AppError::NotFound(format!("Notification {}", id)));
    }

    Ok(Json(NotificationDeliveriesResponse {
        notification_id: id,
        deliveries: to_responses(records),
    }))
}

/// Withdraw a notification; pending deliveries are cancelled
async fn cancel_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationDeliveriesResponse>> {
    let records = state.pipeline.cancel_notification(&id).await?;

    Ok(Json(NotificationDeliveriesResponse {
        notification_id: id,
        deliveries: to_responses(records),
    }))
}

/// Status transitions recorded for one notification, oldest first
async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationHistoryResponse>> {
    let history = DeliveryStatusLogRepository::find_by_notification(&state.db, &id).await?;

    Ok(Json(NotificationHistoryResponse {
        notification_id: id,
        history,
    }))
}
