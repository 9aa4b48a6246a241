//! Console client facade and domain operations.
//!
//! `ConsoleClient` is the one object consumers hold: domain calls route
//! through the request executor, socket control through the realtime
//! channel, and event registration through the bus. It is an explicit
//! dependency with an `init`/`shutdown` lifecycle, never a process-wide
//! singleton.

use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::client::{ChannelConfig, ChannelState, RealtimeChannel};
use crate::channel::proto::{ClientFrame, Room};
use crate::channel::transport::{
    ChannelError, ChannelFactory, WsChannelFactory, CHANNEL_ENDPOINT, LOCAL_CHANNEL_ENDPOINT,
};
use crate::console_api::{
    ApiError, ExecutorOptions, RequestExecutor, RequestOptions, CONSOLE_BASE_URL,
    LOCAL_CONSOLE_BASE_URL,
};
use crate::events::{AuthChange, BusEvent, EventBus, EventKind, SubscriptionId};
use crate::session::{
    Credential, CredentialStore, KeyringStore, NoRefresh, SessionStore, TokenRefresher,
    UserProfile, DEFAULT_KEYRING_SERVICE,
};

/// Construction-time configuration for the facade.
#[derive(Clone, Debug)]
pub struct ConsoleClientOptions {
    pub base_url: String,
    pub channel_endpoint: String,
    pub executor: ExecutorOptions,
    pub channel: ChannelConfig,
    pub keyring_service: String,
}

impl ConsoleClientOptions {
    /// Options pointing at a local development console.
    pub fn local() -> Self {
        Self {
            base_url: LOCAL_CONSOLE_BASE_URL.to_string(),
            channel_endpoint: LOCAL_CHANNEL_ENDPOINT.to_string(),
            ..Self::default()
        }
    }
}

impl Default for ConsoleClientOptions {
    fn default() -> Self {
        Self {
            base_url: CONSOLE_BASE_URL.to_string(),
            channel_endpoint: CHANNEL_ENDPOINT.to_string(),
            executor: ExecutorOptions::default(),
            channel: ChannelConfig::default(),
            keyring_service: DEFAULT_KEYRING_SERVICE.to_string(),
        }
    }
}

/// The sole entry point consumers use.
pub struct ConsoleClient {
    session: Arc<SessionStore>,
    bus: Arc<EventBus>,
    executor: RequestExecutor,
    channel: RealtimeChannel,
}

impl ConsoleClient {
    /// Production client with platform keyring persistence.
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(ConsoleClientOptions::default())
    }

    pub fn with_options(options: ConsoleClientOptions) -> Result<Self, ApiError> {
        let store = Box::new(KeyringStore::new(options.keyring_service.clone()));
        let factory = Arc::new(WsChannelFactory::new(options.channel_endpoint.clone()));
        Self::with_parts(options, store, Box::new(NoRefresh), factory)
    }

    /// Full dependency injection: credential store, token refresher, and
    /// channel transport are all supplied by the caller.
    pub fn with_parts(
        options: ConsoleClientOptions,
        store: Box<dyn CredentialStore>,
        refresher: Box<dyn TokenRefresher>,
        factory: Arc<dyn ChannelFactory>,
    ) -> Result<Self, ApiError> {
        let bus = Arc::new(EventBus::new());
        let session = Arc::new(SessionStore::new(store, refresher));
        let executor = RequestExecutor::new(
            options.base_url,
            Arc::clone(&session),
            Arc::clone(&bus),
            options.executor,
        )?;
        let channel = RealtimeChannel::new(
            factory,
            Arc::clone(&session),
            Arc::clone(&bus),
            options.channel,
        );

        Ok(Self {
            session,
            bus,
            executor,
            channel,
        })
    }

    /// Restores a persisted session, if any.
    ///
    /// Returns true when a stored token made the client authenticated;
    /// publishes the matching auth-change event so consumers render the
    /// right state on startup.
    pub fn init(&self) -> Result<bool, ApiError> {
        let restored = self.session.load()?;
        if restored {
            self.bus.publish(BusEvent::AuthChange(AuthChange {
                authenticated: true,
                user: None,
            }));
        }
        Ok(restored)
    }

    /// Tears the client down: closes the channel and drops subscriptions.
    pub fn shutdown(&self) {
        self.channel.disconnect();
        self.bus.clear();
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Registers an event handler. See [`EventKind`] for the event set.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    /// Removes a handler registered with [`ConsoleClient::on`].
    pub fn off(&self, kind: EventKind, id: SubscriptionId) {
        self.bus.unsubscribe(kind, id);
    }

    /// Authenticates and installs the returned credential.
    ///
    /// With `remember` set the token survives process restarts.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        remember: bool,
    ) -> Result<UserProfile, ApiError> {
        let response: LoginResponse = self
            .executor
            .post("/api/login", &LoginRequest { username, password })
            .await?;

        let credential = Credential {
            access_token: SecretString::new(response.token),
            refresh_token: response.refresh_token.map(SecretString::new),
        };
        self.session.install(credential, remember)?;
        self.bus.publish(BusEvent::AuthChange(AuthChange {
            authenticated: true,
            user: Some(response.user.clone()),
        }));
        Ok(response.user)
    }

    /// Clears the stored credential and closes the channel.
    ///
    /// Purely client-side: the bearer token is simply forgotten.
    pub fn logout(&self) -> Result<(), ApiError> {
        self.session.clear()?;
        self.channel.disconnect();
        self.bus.publish(BusEvent::AuthChange(AuthChange {
            authenticated: false,
            user: None,
        }));
        Ok(())
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(), ApiError> {
        let _: MessageAck = self
            .executor
            .post(
                "/api/register",
                &RegisterRequest {
                    username,
                    email,
                    password,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StatsSummary, ApiError> {
        self.executor.get("/api/stats").await
    }

    pub async fn bot_activity(&self) -> Result<BotActivity, ApiError> {
        self.executor.get("/api/bot-activity").await
    }

    pub async fn system_metrics(&self) -> Result<SystemMetrics, ApiError> {
        self.executor.get("/api/system-metrics").await
    }

    pub async fn bots(&self, query: &BotQuery) -> Result<BotPage, ApiError> {
        self.executor
            .get_with(
                "/api/bots",
                RequestOptions {
                    query: query.to_query(),
                    ..RequestOptions::default()
                },
            )
            .await
    }

    pub async fn bot(&self, bot_id: u64) -> Result<BotDetails, ApiError> {
        self.executor.get(&format!("/api/bots/{bot_id}")).await
    }

    pub async fn logs(&self, query: &LogQuery) -> Result<Vec<LogRecord>, ApiError> {
        let response: LogsResponse = self
            .executor
            .get_with(
                "/api/logs",
                RequestOptions {
                    query: query.to_query(),
                    ..RequestOptions::default()
                },
            )
            .await?;
        Ok(response.logs)
    }

    pub async fn settings(&self) -> Result<ConsoleSettings, ApiError> {
        self.executor.get("/api/settings").await
    }

    pub async fn update_settings(&self, settings: &ConsoleSettings) -> Result<(), ApiError> {
        let _: MessageAck = self.executor.put("/api/settings", settings).await?;
        Ok(())
    }

    /// Reports a fingerprint observation to the console.
    pub async fn submit_fingerprint(
        &self,
        report: &FingerprintReport,
    ) -> Result<FingerprintAck, ApiError> {
        self.executor.post("/api/fingerprint", report).await
    }

    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.executor.get("/health").await
    }

    /// Opens the realtime channel with the current credential snapshot.
    pub fn connect_socket(&self) {
        self.channel.connect();
    }

    /// Closes the realtime channel without triggering reconnection.
    pub fn disconnect_socket(&self) {
        self.channel.disconnect();
    }

    pub fn socket_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Asks the server to re-broadcast current state to a room.
    pub fn request_update(&self, room: Room) -> Result<(), ChannelError> {
        self.channel.send(ClientFrame::RequestUpdate { room })
    }

    /// Leaves a room joined at connect time.
    pub fn leave_room(&self, room: Room) -> Result<(), ChannelError> {
        self.channel.send(ClientFrame::Unsubscribe { room })
    }
}

#[derive(Clone, Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Clone, Debug, Deserialize)]
struct LoginResponse {
    token: String,
    /// Present only when the auth service issues refresh tokens.
    #[serde(default)]
    refresh_token: Option<String>,
    user: UserProfile,
}

#[derive(Clone, Debug, Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Clone, Debug, Deserialize)]
struct MessageAck {
    #[allow(dead_code)]
    message: String,
}

/// Dashboard headline statistics.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatsSummary {
    pub active_bots: u64,
    pub total_bots_trapped: u64,
    pub detection_accuracy: f64,
    pub avg_engagement_hours: f64,
    pub false_positive_rate: f64,
    pub recent_detections: u64,
    pub avg_detection_score: f64,
}

/// One hour bucket of bot activity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityPoint {
    pub timestamp: String,
    pub count: u64,
}

/// Chart-ready activity series for the last 24 hours.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotActivity {
    pub activity: Vec<ActivityPoint>,
}

/// Backend performance gauges.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub quantum_entropy_generation: f64,
    pub behavior_prediction_accuracy: f64,
    pub task_completion_rate: f64,
    pub system_load: f64,
    pub memory_usage: f64,
    pub network_io: f64,
}

/// One trapped bot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BotRecord {
    pub id: u64,
    pub fingerprint_hash: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub detection_score: Option<f64>,
    #[serde(default)]
    pub first_seen: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub pages: u32,
}

/// One page of the bot listing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BotPage {
    pub bots: Vec<BotRecord>,
    pub pagination: Pagination,
}

/// Full bot record with challenge and verification history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BotDetails {
    #[serde(flatten)]
    pub record: BotRecord,
    #[serde(default)]
    pub challenge_history: Vec<Value>,
    #[serde(default)]
    pub verification_results: Value,
}

/// Filters for the bot listing.
#[derive(Clone, Debug, Default)]
pub struct BotQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub status: Option<String>,
}

impl BotQuery {
    fn to_query(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(page) = self.page {
            pairs.push(("page".to_string(), page.to_string()));
        }
        if let Some(per_page) = self.per_page {
            pairs.push(("per_page".to_string(), per_page.to_string()));
        }
        if let Some(status) = &self.status {
            pairs.push(("status".to_string(), status.clone()));
        }
        pairs
    }
}

/// One system log row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub id: u64,
    pub level: String,
    pub component: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
struct LogsResponse {
    logs: Vec<LogRecord>,
}

/// Filters for the log query.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub component: Option<String>,
    pub search: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    fn to_query(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(level) = &self.level {
            pairs.push(("level".to_string(), level.clone()));
        }
        if let Some(component) = &self.component {
            pairs.push(("component".to_string(), component.clone()));
        }
        if let Some(search) = &self.search {
            pairs.push(("search".to_string(), search.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

/// Operator-tunable honeypot configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConsoleSettings {
    pub honeypot_enabled: bool,
    pub challenge_difficulty: String,
    pub quantum_entropy_rate: u32,
    pub behavior_prediction_threshold: f64,
    pub sandbox_cpu_limit: u32,
    pub sandbox_memory_limit: u32,
    pub alert_threshold: u32,
    pub auto_ban_enabled: bool,
    pub max_bot_lifetime_hours: u32,
}

/// Fingerprint observation submitted to the console.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FingerprintReport {
    pub fingerprint_hash: String,
    pub detection_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FingerprintAck {
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}
