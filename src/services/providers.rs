use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ProvidersConfig;
use crate::db::models::{Channel, NotificationCategory, NotificationEvent};
use crate::error::{AppError, AppResult};

/// Content handed to a channel provider.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryPayload {
    pub notification_id: String,
    pub category: NotificationCategory,
    pub title: String,
    pub body: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Attempt number this send belongs to. Asynchronous reports echo it back.
    pub attempt: u32,
}

impl DeliveryPayload {
    pub fn for_attempt(event: &NotificationEvent, attempt: u32) -> Self {
        Self {
            notification_id: event.id.clone(),
            category: event.category,
            title: event.title.clone(),
            body: event.body.clone(),
            metadata: event.metadata.clone(),
            attempt,
        }
    }
}

/// Normalized result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Delivered {
        provider_message_id: String,
    },
    Failed {
        error_code: String,
        /// Timeouts, 5xx and rate limits may succeed later; invalid destinations never will.
        transient: bool,
    },
}

impl ProviderOutcome {
    pub fn failed(error_code: impl Into<String>, transient: bool) -> Self {
        ProviderOutcome::Failed {
            error_code: error_code.into(),
            transient,
        }
    }
}

#[async_trait]
pub trait ChannelProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn send(&self, destination: &str, payload: &DeliveryPayload) -> ProviderOutcome;
}

/// Map an HTTP status from a provider relay to an error code and transient flag.
pub fn classify_status(status: u16) -> (String, bool) {
    match status {
        408 => ("timeout".to_string(), true),
        429 => ("rate_limited".to_string(), true),
        500..=599 => ("provider_5xx".to_string(), true),
        other => (format!("rejected_{}", other), false),
    }
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    message_id: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    channel: Channel,
    destination: &'a str,
    payload: &'a DeliveryPayload,
}

/// Provider that forwards deliveries to an HTTP relay owned by the host
/// application (which talks to the actual push/email/SMS vendor).
pub struct WebhookProvider {
    channel: Channel,
    url: url::Url,
    client: reqwest::Client,
}

impl WebhookProvider {
    pub fn new(channel: Channel, url: &str, timeout: Duration) -> AppResult<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| AppError::Config(format!("invalid {} relay url: {}", channel, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            channel,
            url,
            client,
        })
    }
}

#[async_trait]
impl ChannelProvider for WebhookProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, destination: &str, payload: &DeliveryPayload) -> ProviderOutcome {
        let request = RelayRequest {
            channel: self.channel,
            destination,
            payload,
        };

        let response = match self.client.post(self.url.clone()).json(&request).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                tracing::warn!("{} relay timed out: {}", self.channel, e);
                return ProviderOutcome::failed("timeout", true);
            }
            Err(e) => {
                tracing::warn!("{} relay request failed: {}", self.channel, e);
                return ProviderOutcome::failed("network_error", true);
            }
        };

        let status = response.status();
        let body: Option<RelayResponse> = response.json().await.ok();

        if status.is_success() {
            let provider_message_id = body
                .and_then(|b| b.message_id)
                .unwrap_or_else(|| format!("{}-{}", self.channel, Uuid::new_v4()));
            return ProviderOutcome::Delivered {
                provider_message_id,
            };
        }

        let (fallback_code, transient) = classify_status(status.as_u16());
        // Relays may name permanent errors (e.g. `invalid_destination`, `unsubscribed`).
        let error_code = match body.and_then(|b| b.error) {
            Some(code) if !transient && !code.trim().is_empty() => code,
            _ => fallback_code,
        };
        tracing::warn!(
            "{} relay responded {} (error_code={}, transient={})",
            self.channel,
            status,
            error_code,
            transient
        );
        ProviderOutcome::Failed {
            error_code,
            transient,
        }
    }
}

/// Dry-run provider used when no relay is configured for a channel.
pub struct LogProvider {
    channel: Channel,
}

impl LogProvider {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelProvider for LogProvider {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, destination: &str, payload: &DeliveryPayload) -> ProviderOutcome {
        let provider_message_id = format!("log-{}", Uuid::new_v4());
        tracing::info!(
            "[dry-run] {} delivery of notification {} to {}: {} ({})",
            self.channel,
            payload.notification_id,
            destination,
            payload.title,
            provider_message_id
        );
        ProviderOutcome::Delivered {
            provider_message_id,
        }
    }
}

/// The fixed set of channel providers.
#[derive(Clone)]
pub struct ProviderSet {
    push: Arc<dyn ChannelProvider>,
    email: Arc<dyn ChannelProvider>,
    sms: Arc<dyn ChannelProvider>,
    timeout: Duration,
}

impl ProviderSet {
    pub fn new(
        push: Arc<dyn ChannelProvider>,
        email: Arc<dyn ChannelProvider>,
        sms: Arc<dyn ChannelProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            push,
            email,
            sms,
            timeout,
        }
    }

    /// Webhook relays where configured, dry-run logging elsewhere.
    pub fn from_config(config: &ProvidersConfig) -> AppResult<Self> {
        let timeout = Duration::from_secs(config.request_timeout_seconds);
        let build = |channel: Channel, url: &Option<String>| -> AppResult<Arc<dyn ChannelProvider>> {
            match url {
                Some(url) => {
                    tracing::info!("Using webhook relay for {} deliveries", channel);
                    Ok(Arc::new(WebhookProvider::new(channel, url, timeout)?))
                }
                None => {
                    tracing::warn!(
                        "No relay configured for {} deliveries; using dry-run logging provider",
                        channel
                    );
                    Ok(Arc::new(LogProvider::new(channel)))
                }
            }
        };

        Ok(Self::new(
            build(Channel::Push, &config.push_webhook_url)?,
            build(Channel::Email, &config.email_webhook_url)?,
            build(Channel::Sms, &config.sms_webhook_url)?,
            timeout,
        ))
    }

    pub fn for_channel(&self, channel: Channel) -> &Arc<dyn ChannelProvider> {
        match channel {
            Channel::Push => &self.push,
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
        }
    }

    /// Send through the channel's provider, bounded by the configured timeout.
    pub async fn dispatch(
        &self,
        channel: Channel,
        destination: &str,
        payload: &DeliveryPayload,
    ) -> ProviderOutcome {
        let provider = self.for_channel(channel);
        match tokio::time::timeout(self.timeout, provider.send(destination, payload)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    "{} provider '{}' exceeded {}s for notification {}",
                    channel,
                    provider.name(),
                    self.timeout.as_secs(),
                    payload.notification_id
                );
                ProviderOutcome::failed("timeout", true)
            }
        }
    }
}
