use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};

use crate::db::models::Channel;
use crate::error::{AppError, AppResult};
use crate::routes::deliveries::DeliveryRecordResponse;
use crate::services::callbacks::{CallbackService, ProviderCallback};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/:channel/callback", post(handle_provider_callback))
}

/// Asynchronous delivery report from a provider relay.
async fn handle_provider_callback(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<DeliveryRecordResponse>> {
    let channel: Channel = channel
        .parse()
        .map_err(|e: String| AppError::NotFound(e))?;

    let (timestamp, signature) = CallbackService::extract_headers(&headers)?;
    CallbackService::verify_signature(
        &state.config.callbacks,
        &timestamp,
        &body,
        &signature,
        chrono::Utc::now(),
    )?;

    let callback: ProviderCallback = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid payload: {}", e)))?;

    tracing::info!(
        "Received {} provider callback for notification {} (attempt {})",
        channel,
        callback.notification_id,
        callback.attempt
    );

    let record = state
        .pipeline
        .apply_provider_callback(
            &callback.notification_id,
            channel,
            callback.attempt,
            callback.outcome,
        )
        .await?;

    Ok(Json(record.into()))
}
