//! transport/mod.rs - HTTP(S) JSON transport for push/pull, plus a
//! managed-provider adapter that layers OAuth-style token refresh on top
//! of the same interface (component C7).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::wire::{PullRequest, PullResponse, PushRequest, PushResponse, ServerErrorBody};
use crate::{Error, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const REFRESH_SKEW_SECS: i64 = 30;

/// Push/pull capability a sync cycle drives. Implemented by [`HttpTransport`]
/// directly, or wrapped by [`ManagedTransport`] for providers that need
/// token refresh.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn push(&self, req: &PushRequest) -> Result<PushResponse>;
    async fn pull(&self, req: &PullRequest) -> Result<PullResponse>;
}

/// Plain HTTP(S) JSON transport. One POST per call, bounded by `timeout`.
#[derive(Clone)]
pub struct HttpTransport {
    push_url: String,
    pull_url: String,
    client: reqwest::Client,
    bearer_token: Arc<RwLock<Option<String>>>,
}

impl HttpTransport {
    pub fn new(push_url: impl Into<String>, pull_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(push_url, pull_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(push_url: impl Into<String>, pull_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            push_url: push_url.into(),
            pull_url: pull_url.into(),
            client,
            bearer_token: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer_token.write().await = token;
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = self.bearer_token.read().await.clone() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Auth(format!("invalid bearer token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn post_json<T: Serialize + Sync, R: for<'de> Deserialize<'de>>(&self, url: &str, body: &T) -> Result<R> {
        let headers = self.headers().await?;
        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("request to {url} timed out"))
                } else {
                    Error::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: Option<ServerErrorBody> = response.json().await.ok();
            return Err(match body {
                Some(b) => Error::TransportStatus {
                    code: b.code.as_str().to_string(),
                    message: b.message,
                    retry_after_ms: b.retry_after_ms,
                },
                None => Error::TransportStatus {
                    code: status.as_u16().to_string(),
                    message: format!("non-2xx response with no parseable body ({status})"),
                    retry_after_ms: None,
                },
            });
        }

        response.json().await.map_err(|e| Error::Network(format!("malformed response body: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn push(&self, req: &PushRequest) -> Result<PushResponse> {
        self.post_json(&self.push_url, req).await
    }

    async fn pull(&self, req: &PullRequest) -> Result<PullResponse> {
        self.post_json(&self.pull_url, req).await
    }
}

/// `x-www-form-urlencoded` body for a refresh-token exchange.
#[derive(Debug, Clone, Serialize)]
struct RefreshTokenRequest<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct RefreshTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Current access/refresh token pair plus the absolute expiry, kept in
/// memory by default and handed to `on_auth_refresh` so the caller can
/// persist it (mobile secure keystore, desktop settings file, etc).
#[derive(Debug, Clone, PartialEq)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: chrono::DateTime<Utc>,
}

impl TokenState {
    fn needs_refresh(&self) -> bool {
        Utc::now() + chrono::Duration::seconds(REFRESH_SKEW_SECS) >= self.expires_at
    }
}

type AuthRefreshCallback = Box<dyn Fn(TokenState) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wraps a [`Transport`] with OAuth-style refresh: before each call, if the
/// cached token is within `REFRESH_SKEW_SECS` of expiry, it is refreshed
/// against `refresh_url` first.
pub struct ManagedTransport {
    inner: HttpTransport,
    refresh_url: String,
    refresh_client: reqwest::Client,
    token: Arc<RwLock<TokenState>>,
    on_auth_refresh: Option<AuthRefreshCallback>,
}

impl ManagedTransport {
    pub fn new(inner: HttpTransport, refresh_url: impl Into<String>, initial_token: TokenState) -> Result<Self> {
        let refresh_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Network(format!("failed to build refresh client: {e}")))?;
        Ok(Self {
            inner,
            refresh_url: refresh_url.into(),
            refresh_client,
            token: Arc::new(RwLock::new(initial_token)),
            on_auth_refresh: None,
        })
    }

    /// Registers a callback invoked with the new [`TokenState`] every time a
    /// refresh succeeds, so the host can persist it.
    pub fn on_auth_refresh<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(TokenState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_auth_refresh = Some(Box::new(move |state| Box::pin(callback(state))));
        self
    }

    async fn ensure_fresh(&self) -> Result<()> {
        let needs_refresh = self.token.read().await.needs_refresh();
        if !needs_refresh {
            return Ok(());
        }

        let refresh_token = self.token.read().await.refresh_token.clone();
        let response: RefreshTokenResponse = self
            .refresh_client
            .post(&self.refresh_url)
            .form(&RefreshTokenRequest { grant_type: "refresh_token", refresh_token: &refresh_token })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout("token refresh timed out".to_string())
                } else {
                    Error::Network(e.to_string())
                }
            })?
            .json()
            .await
            .map_err(|e| Error::Auth(format!("malformed refresh response: {e}")))?;

        let new_state = TokenState {
            access_token: response.access_token,
            refresh_token: response.refresh_token.unwrap_or(refresh_token),
            expires_at: Utc::now() + chrono::Duration::seconds(response.expires_in),
        };

        self.inner.set_bearer_token(Some(new_state.access_token.clone())).await;
        *self.token.write().await = new_state.clone();

        if let Some(callback) = &self.on_auth_refresh {
            callback(new_state).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ManagedTransport {
    async fn push(&self, req: &PushRequest) -> Result<PushResponse> {
        self.ensure_fresh().await?;
        self.inner.push(req).await
    }

    async fn pull(&self, req: &PullRequest) -> Result<PullResponse> {
        self.ensure_fresh().await?;
        self.inner.pull(req).await
    }
}
