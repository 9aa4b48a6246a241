//! Authenticated HTTP request execution against the console API.
//!
//! The executor composes the retry policy and the session store into the
//! request contract every facade operation uses: bearer-token attachment,
//! bounded retries with backoff under rate limiting, a single token-refresh
//! attempt on 401, and immediate surfacing of other failures with the
//! server-provided message.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{AuthChange, BusEvent, EventBus};
use crate::retry::{RetryClass, RetryPolicy};
use crate::session::{SessionError, SessionStore};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Production console endpoint.
pub const CONSOLE_BASE_URL: &str = "https://console.nexuswatch.io";
/// Local development console endpoint.
pub const LOCAL_CONSOLE_BASE_URL: &str = "http://localhost:5000";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExecutorDefaults;

impl ExecutorDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
}

/// Tuning knobs for the executor.
#[derive(Clone, Debug)]
pub struct ExecutorOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ExecutorDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ExecutorDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Caller-controlled parts of one logical request.
///
/// The `Authorization` header is owned by the session store; a value set
/// here is discarded before the request is sent.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
}

/// Errors surfaced to facade callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No response arrived; surfaced once the retry budget is exhausted.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// 401 that survived the single refresh attempt.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 429 that survived the backoff budget.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Any other non-2xx status, never retried.
    #[error("console api status {status}: {message}")]
    Status { status: StatusCode, message: String },

    /// 2xx body that did not match the expected shape.
    #[error("failed to parse response: {0}")]
    Parse(String),

    /// Session persistence failure.
    #[error(transparent)]
    Session(#[from] SessionError),
}

enum AttemptFailure {
    Unauthorized(String),
    RateLimited(String),
    Transport(reqwest::Error),
    Fatal(ApiError),
}

/// Executes authenticated requests with retry semantics.
pub struct RequestExecutor {
    http: Client,
    base_url: String,
    session: Arc<SessionStore>,
    bus: Arc<EventBus>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(
        base_url: impl Into<String>,
        session: Arc<SessionStore>,
        bus: Arc<EventBus>,
        options: ExecutorOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            bus,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute(Method::GET, path, None::<&()>, RequestOptions::default())
            .await
    }

    pub async fn get_with<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        self.execute(Method::GET, path, None::<&()>, options).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.execute(Method::POST, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.execute(Method::PUT, path, Some(body), RequestOptions::default())
            .await
    }

    /// Runs one logical request through the full retry contract.
    pub async fn execute<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        options: RequestOptions,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let url = format!("{}{}", self.base_url, path);
        let headers = sanitize_headers(options.headers);
        let query = options.query;
        let mut retries = 0usize;
        let mut refreshed = false;

        loop {
            let attempt = retries + 1;
            match self
                .send_attempt(method.clone(), &url, body, &headers, &query, attempt)
                .await
            {
                Ok(value) => return Ok(value),
                Err(AttemptFailure::Fatal(err)) => return Err(err),
                Err(AttemptFailure::Unauthorized(message)) => {
                    if refreshed {
                        return Err(ApiError::Unauthorized(message));
                    }
                    refreshed = true;

                    match self.session.refresh().await {
                        Ok(()) => {
                            if !self.retry_policy.allows(retries) {
                                return Err(ApiError::Unauthorized(message));
                            }
                            retries += 1;
                            debug!(event = "retry_after_refresh", attempt, url = %url);
                        }
                        Err(err) => {
                            // Store already cleared itself; tell every consumer.
                            warn!(event = "session_expired", url = %url, error = %err);
                            self.bus.publish(BusEvent::AuthChange(AuthChange {
                                authenticated: false,
                                user: None,
                            }));
                            return Err(ApiError::Unauthorized(message));
                        }
                    }
                }
                Err(AttemptFailure::RateLimited(message)) => {
                    if !self.retry_policy.allows(retries) {
                        return Err(ApiError::RateLimited(message));
                    }
                    retries += 1;
                    let delay = self.retry_policy.delay_for(RetryClass::RateLimited, retries);
                    debug!(
                        event = "rate_limited_backoff",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        url = %url
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptFailure::Transport(err)) => {
                    if !self.retry_policy.allows(retries) {
                        return Err(ApiError::Transport(err));
                    }
                    retries += 1;
                    let delay = self.retry_policy.delay_for(RetryClass::Transport, retries);
                    debug!(
                        event = "transport_retry",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        url = %url
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_attempt<T, B>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        headers: &HeaderMap,
        query: &[(String, String)],
        attempt: usize,
    ) -> Result<T, AttemptFailure>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let mut builder = self
            .http
            .request(method, url)
            .timeout(self.attempt_timeout)
            .headers(headers.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if !query.is_empty() {
            builder = builder.query(query);
        }

        if let Some(token) = self.session.access_token() {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        debug!(event = "request_attempt", attempt, url = %url);

        let response = builder.send().await.map_err(AttemptFailure::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(AttemptFailure::Transport)?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(AttemptFailure::Unauthorized(error_message(&text)));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptFailure::RateLimited(error_message(&text)));
        }
        if !status.is_success() {
            return Err(AttemptFailure::Fatal(ApiError::Status {
                status,
                message: error_message(&text),
            }));
        }

        serde_json::from_str(&text)
            .map_err(|err| AttemptFailure::Fatal(ApiError::Parse(err.to_string())))
    }
}

/// Strips the session-owned `Authorization` header from caller headers.
fn sanitize_headers(mut headers: HeaderMap) -> HeaderMap {
    if headers.remove(AUTHORIZATION).is_some() {
        warn!(event = "caller_authorization_discarded");
    }
    headers
}

/// Extracts the failure message from an error response body.
fn error_message(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

    use super::{error_message, sanitize_headers, CONSOLE_BASE_URL, LOCAL_CONSOLE_BASE_URL};

    #[test]
    fn error_message_prefers_error_field() {
        let body = r#"{"error":"Token has expired"}"#;
        assert_eq!(error_message(body), "Token has expired");
    }

    #[test]
    fn error_message_falls_back_to_message_field() {
        let body = r#"{"message":"slow down"}"#;
        assert_eq!(error_message(body), "slow down");
    }

    #[test]
    fn error_message_falls_back_to_body_snippet() {
        assert_eq!(error_message("gateway exploded"), "gateway exploded");
    }

    #[test]
    fn sanitize_headers_drops_caller_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer forged"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let sanitized = sanitize_headers(headers);
        assert!(sanitized.get(AUTHORIZATION).is_none());
        assert!(sanitized.get(CONTENT_TYPE).is_some());
    }

    #[test]
    fn production_base_url_is_fixed() {
        assert_eq!(CONSOLE_BASE_URL, "https://console.nexuswatch.io");
        assert_eq!(LOCAL_CONSOLE_BASE_URL, "http://localhost:5000");
    }
}
