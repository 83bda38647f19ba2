pub mod callbacks;
pub mod deliveries;
pub mod health;
pub mod notifications;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

/// Health and API routes. Provider callbacks are nested separately so they
/// can carry their own rate limiter.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/notifications", notifications::router())
        .nest("/api/deliveries", deliveries::router())
}
