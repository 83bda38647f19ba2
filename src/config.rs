use std::env;
use std::str::FromStr;

use serde::Deserialize;

use crate::db::models::NotificationCategory;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub delivery: DeliveryConfig,
    pub notification_retry: NotificationRetryConfig,
    pub providers: ProvidersConfig,
    pub callbacks: CallbackConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed by CORS (the dashboard that renders delivery status).
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Whether the background dispatch worker runs.
    pub dispatch_enabled: bool,
    /// How often (seconds) the worker polls for due deliveries when not woken earlier.
    pub poll_interval_seconds: u64,
    /// Maximum records claimed per dispatch cycle.
    pub batch_size: u32,
    /// Maximum provider calls in flight at once.
    pub worker_concurrency: u32,
    /// How long a claimed record stays leased to one worker. Must exceed the provider timeout.
    pub claim_lease_seconds: u64,
    /// Records older than this are skipped with reason `expired` instead of dispatched.
    pub ttl_seconds: u64,
    /// Categories that may ever be delivered over SMS.
    pub sms_eligible_categories: Vec<NotificationCategory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRetryConfig {
    /// Delay before the first retry; doubled for every further attempt.
    pub initial_backoff_seconds: u64,
    /// Cap for exponential backoff (seconds).
    pub max_backoff_seconds: u64,
    /// Attempts after which a transient failure becomes terminal.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    /// Relay endpoints. When unset the channel uses the logging dry-run provider.
    pub push_webhook_url: Option<String>,
    pub email_webhook_url: Option<String>,
    pub sms_webhook_url: Option<String>,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    /// Shared secret providers use to sign callbacks. Callbacks are rejected when unset.
    pub signing_secret: Option<String>,
    /// Maximum accepted clock skew for `x-delivery-timestamp`.
    pub max_skew_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for provider callback endpoints
    pub callback_per_second: u32,
    /// Burst size for provider callback endpoints
    pub callback_burst: u32,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Upper bound for durations that end up in `chrono::Duration` arithmetic.
pub const MAX_DURATION_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Seconds from configuration as a `chrono::Duration`, clamped to [`MAX_DURATION_SECONDS`].
pub fn bounded_seconds(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.min(MAX_DURATION_SECONDS) as i64)
}

/// Parse a comma separated category list such as `broadcast,payments`.
pub fn parse_category_list(raw: &str) -> Result<Vec<NotificationCategory>, ConfigError> {
    let mut categories = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let category = part
            .parse::<NotificationCategory>()
            .map_err(|_| ConfigError::InvalidValue(format!("SMS_ELIGIBLE_CATEGORIES ({})", part)))?;
        if !categories.contains(&category) {
            categories.push(category);
        }
    }
    Ok(categories)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let sms_eligible_categories = match env::var("SMS_ELIGIBLE_CATEGORIES") {
            Ok(raw) => parse_category_list(&raw)?,
            Err(_) => defaults.delivery.sms_eligible_categories.clone(),
        };

        let config = Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL").unwrap_or(defaults.server.frontend_url),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", defaults.database.max_connections),
            },
            delivery: DeliveryConfig {
                dispatch_enabled: env_flag("DELIVERY_DISPATCH_ENABLED", true),
                poll_interval_seconds: env_or(
                    "DELIVERY_POLL_INTERVAL_SECONDS",
                    defaults.delivery.poll_interval_seconds,
                ),
                batch_size: env_or("DELIVERY_BATCH_SIZE", defaults.delivery.batch_size),
                worker_concurrency: env_or(
                    "DELIVERY_WORKER_CONCURRENCY",
                    defaults.delivery.worker_concurrency,
                ),
                claim_lease_seconds: env_or(
                    "DELIVERY_CLAIM_LEASE_SECONDS",
                    defaults.delivery.claim_lease_seconds,
                ),
                ttl_seconds: env_or("DELIVERY_TTL_SECONDS", defaults.delivery.ttl_seconds),
                sms_eligible_categories,
            },
            notification_retry: NotificationRetryConfig {
                initial_backoff_seconds: env_or(
                    "NOTIFICATION_RETRY_INITIAL_BACKOFF_SECONDS",
                    defaults.notification_retry.initial_backoff_seconds,
                ),
                max_backoff_seconds: env_or(
                    "NOTIFICATION_RETRY_MAX_BACKOFF_SECONDS",
                    defaults.notification_retry.max_backoff_seconds,
                ),
                max_attempts: env_or(
                    "NOTIFICATION_RETRY_MAX_ATTEMPTS",
                    defaults.notification_retry.max_attempts,
                ),
            },
            providers: ProvidersConfig {
                push_webhook_url: env_opt("PUSH_WEBHOOK_URL"),
                email_webhook_url: env_opt("EMAIL_WEBHOOK_URL"),
                sms_webhook_url: env_opt("SMS_WEBHOOK_URL"),
                request_timeout_seconds: env_or(
                    "PROVIDER_TIMEOUT_SECONDS",
                    defaults.providers.request_timeout_seconds,
                ),
            },
            callbacks: CallbackConfig {
                signing_secret: env_opt("CALLBACK_SIGNING_SECRET"),
                max_skew_seconds: env_or(
                    "CALLBACK_MAX_SKEW_SECONDS",
                    defaults.callbacks.max_skew_seconds,
                ),
            },
            rate_limit: RateLimitConfig {
                callback_per_second: env_or(
                    "RATE_LIMIT_CALLBACKS_PER_SECOND",
                    defaults.rate_limit.callback_per_second,
                ),
                callback_burst: env_or(
                    "RATE_LIMIT_CALLBACKS_BURST",
                    defaults.rate_limit.callback_burst,
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery.batch_size == 0 {
            return Err(ConfigError::InvalidValue("DELIVERY_BATCH_SIZE".to_string()));
        }
        for (key, seconds) in [
            ("DELIVERY_CLAIM_LEASE_SECONDS", self.delivery.claim_lease_seconds),
            ("DELIVERY_TTL_SECONDS", self.delivery.ttl_seconds),
            (
                "NOTIFICATION_RETRY_INITIAL_BACKOFF_SECONDS",
                self.notification_retry.initial_backoff_seconds,
            ),
            (
                "NOTIFICATION_RETRY_MAX_BACKOFF_SECONDS",
                self.notification_retry.max_backoff_seconds,
            ),
        ] {
            if seconds > MAX_DURATION_SECONDS {
                return Err(ConfigError::InvalidValue(format!(
                    "{} (at most {} seconds)",
                    key, MAX_DURATION_SECONDS
                )));
            }
        }
        if self.notification_retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "NOTIFICATION_RETRY_MAX_ATTEMPTS".to_string(),
            ));
        }
        if self.delivery.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_WORKER_CONCURRENCY".to_string(),
            ));
        }
        if self.delivery.claim_lease_seconds <= self.providers.request_timeout_seconds {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_CLAIM_LEASE_SECONDS must exceed PROVIDER_TIMEOUT_SECONDS".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/deliveries.db".to_string(),
                max_connections: 5,
            },
            delivery: DeliveryConfig {
                dispatch_enabled: true,
                poll_interval_seconds: 5,
                batch_size: 50,
                worker_concurrency: 10,
                claim_lease_seconds: 120,
                ttl_seconds: 24 * 60 * 60,
                sms_eligible_categories: vec![
                    NotificationCategory::Broadcast,
                    NotificationCategory::CalendarEvents,
                    NotificationCategory::Payments,
                ],
            },
            notification_retry: NotificationRetryConfig {
                initial_backoff_seconds: 30,
                max_backoff_seconds: 3600,
                max_attempts: 5,
            },
            providers: ProvidersConfig {
                push_webhook_url: None,
                email_webhook_url: None,
                sms_webhook_url: None,
                request_timeout_seconds: 30,
            },
            callbacks: CallbackConfig {
                signing_secret: None,
                max_skew_seconds: 600,
            },
            rate_limit: RateLimitConfig {
                callback_per_second: 20,
                callback_burst: 100,
            },
        }
    }
}
