use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::config::CallbackConfig;
use crate::error::{AppError, AppResult};
use crate::services::providers::ProviderOutcome;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-delivery-signature";
pub const TIMESTAMP_HEADER: &str = "x-delivery-timestamp";

/// Body of an asynchronous provider report, e.g.
/// `{"notification_id": "n1", "attempt": 1, "result": "failed", "error_code": "unsubscribed", "transient": false}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCallback {
    pub notification_id: String,
    /// Attempt number from the dispatched payload.
    pub attempt: u32,
    #[serde(flatten)]
    pub outcome: ProviderOutcome,
}

pub struct CallbackService;

impl CallbackService {
    /// Returns `(timestamp, signature)`.
    pub fn extract_headers(headers: &HeaderMap) -> AppResult<(String, String)> {
        let get_header = |name: &str| -> AppResult<String> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
                .ok_or_else(|| AppError::BadRequest(format!("Missing header: {}", name)))
        };

        Ok((get_header(TIMESTAMP_HEADER)?, get_header(SIGNATURE_HEADER)?))
    }

    /// Check `sha256=<hex>` HMAC over `timestamp || body` and the timestamp's age.
    pub fn verify_signature(
        config: &CallbackConfig,
        timestamp: &str,
        body: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let secret = config.signing_secret.as_deref().ok_or_else(|| {
            AppError::ServiceUnavailable("Provider callbacks are not configured".to_string())
        })?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AppError::Internal(anyhow::anyhow!("Failed to create HMAC")))?;
        mac.update(timestamp.as_bytes());
        mac.update(body);

        let expected_sig = match signature.strip_prefix("sha256=") {
            Some(hex_sig) => hex::decode(hex_sig)
                .map_err(|_| AppError::BadRequest("Invalid signature format".to_string()))?,
            None => return Err(AppError::BadRequest("Invalid signature format".to_string())),
        };

        mac.verify_slice(&expected_sig)
            .map_err(|_| AppError::Unauthorized)?;

        let sent_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| AppError::BadRequest("Invalid callback timestamp".to_string()))?;
        let skew = now.signed_duration_since(sent_at).num_seconds().abs();
        if skew > config.max_skew_seconds {
            return Err(AppError::BadRequest("Callback timestamp too old".to_string()));
        }

        Ok(())
    }

    /// Signature header value for a payload. Used by relays and tests.
    pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> AppResult<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AppError::Internal(anyhow::anyhow!("Failed to create HMAC")))?;
        mac.update(timestamp.as_bytes());
        mac.update(body);
        Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
    }
}
