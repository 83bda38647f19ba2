//! Shared fixtures for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::db::models::{
    ChannelPreferences, EntitlementFeature, NotificationCategory, NotificationEvent,
    QuietHoursWindow,
};
use crate::error::AppResult;
use crate::services::collaborators::{
    ContactDirectory, EntitlementCheck, PreferenceStore, QuietHoursSource,
};
use crate::services::providers::{ChannelProvider, DeliveryPayload, ProviderOutcome};

/// Fresh in-memory database with migrations applied.
///
/// One connection only: every `sqlite::memory:` connection is its own database.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

pub fn sample_event(id: &str, user_id: &str) -> NotificationEvent {
    NotificationEvent {
        id: id.to_string(),
        user_id: user_id.to_string(),
        category: NotificationCategory::Broadcast,
        title: "Trip update".to_string(),
        body: "The meeting point moved to the harbour.".to_string(),
        metadata: serde_json::Map::new(),
    }
}

/// In-memory account directory. Unknown users get default preferences,
/// no quiet hours, no entitlement and no phone.
#[derive(Default)]
pub struct StaticDirectory {
    preferences: Mutex<HashMap<String, ChannelPreferences>>,
    quiet_hours: Mutex<HashMap<String, QuietHoursWindow>>,
    entitled: Mutex<HashSet<String>>,
    phones: Mutex<HashMap<String, String>>,
}

impl StaticDirectory {
    pub fn set_preferences(&self, user_id: &str, preferences: ChannelPreferences) {
        self.preferences
            .lock()
            .unwrap()
            .insert(user_id.to_string(), preferences);
    }

    pub fn set_quiet_hours(&self, user_id: &str, window: QuietHoursWindow) {
        self.quiet_hours
            .lock()
            .unwrap()
            .insert(user_id.to_string(), window);
    }

    pub fn entitle(&self, user_id: &str) {
        self.entitled.lock().unwrap().insert(user_id.to_string());
    }

    pub fn set_phone(&self, user_id: &str, phone: &str) {
        self.phones
            .lock()
            .unwrap()
            .insert(user_id.to_string(), phone.to_string());
    }

    /// Entitled user with a phone number: every channel can be dispatched.
    pub fn sms_ready(user_id: &str) -> Self {
        let directory = Self::default();
        directory.entitle(user_id);
        directory.set_phone(user_id, "+15555550100");
        directory
    }
}

#[async_trait]
impl PreferenceStore for StaticDirectory {
    async fn get_channel_preferences(&self, user_id: &str) -> AppResult<ChannelPreferences> {
        Ok(self
            .preferences
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl QuietHoursSource for StaticDirectory {
    async fn get_quiet_hours_window(&self, user_id: &str) -> AppResult<Option<QuietHoursWindow>> {
        Ok(self.quiet_hours.lock().unwrap().get(user_id).copied())
    }
}

#[async_trait]
impl EntitlementCheck for StaticDirectory {
    async fn is_entitled(&self, user_id: &str, feature: EntitlementFeature) -> AppResult<bool> {
        Ok(match feature {
            EntitlementFeature::Sms => self.entitled.lock().unwrap().contains(user_id),
        })
    }
}

#[async_trait]
impl ContactDirectory for StaticDirectory {
    async fn get_phone(&self, user_id: &str) -> AppResult<Option<String>> {
        Ok(self.phones.lock().unwrap().get(user_id).cloned())
    }
}

/// Provider that replays queued outcomes, then reports success.
#[derive(Default)]
pub struct ScriptedProvider {
    outcomes: Mutex<VecDeque<ProviderOutcome>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push_outcome(&self, outcome: ProviderOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Destinations passed to `send`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, destination: &str, payload: &DeliveryPayload) -> ProviderOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(destination.to_string());
            calls.len()
        };
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ProviderOutcome::Delivered {
                provider_message_id: format!("{}-{}", payload.notification_id, attempt),
            })
    }
}

/// One scripted provider per channel, handy for asserting which channel was hit.
pub struct ScriptedProviders {
    pub push: Arc<ScriptedProvider>,
    pub email: Arc<ScriptedProvider>,
    pub sms: Arc<ScriptedProvider>,
}

impl ScriptedProviders {
    pub fn new() -> Self {
        Self {
            push: Arc::new(ScriptedProvider::default()),
            email: Arc::new(ScriptedProvider::default()),
            sms: Arc::new(ScriptedProvider::default()),
        }
    }

    pub fn provider_set(&self) -> crate::services::providers::ProviderSet {
        crate::services::providers::ProviderSet::new(
            self.push.clone(),
            self.email.clone(),
            self.sms.clone(),
            Duration::from_secs(5),
        )
    }
}

pub const TEST_CALLBACK_SECRET: &str = "test-callback-secret";

/// Application state over an in-memory database, with scripted providers.
pub async fn test_state(directory: StaticDirectory) -> (Arc<crate::AppState>, ScriptedProviders) {
    let mut config = crate::config::Config::default();
    config.callbacks.signing_secret = Some(TEST_CALLBACK_SECRET.to_string());

    let pool = test_pool().await;
    let providers = ScriptedProviders::new();
    let pipeline = crate::services::pipeline::DeliveryPipeline::new(
        pool.clone(),
        crate::services::collaborators::Collaborators::from_single(Arc::new(directory)),
        providers.provider_set(),
        crate::services::status_feed::StatusFeed::new(),
        &config,
    );

    let state = Arc::new(crate::AppState {
        db: pool,
        config,
        pipeline,
    });
    (state, providers)
}
