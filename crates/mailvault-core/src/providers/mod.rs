//! Remote mailbox access behind one capability interface.

pub mod gmail;
pub mod graph;
pub mod oauth;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, header::RETRY_AFTER};
use thiserror::Error;
use tracing::warn;

use crate::ai::client::parse_retry_after;
use crate::config::Config;
use crate::retry::RetryPolicy;
use crate::types::{NativeTimestamp, Provider};

pub use gmail::GmailProvider;
pub use graph::GraphProvider;
pub use oauth::{FileTokenStore, OAuthClientConfig, OAuthError, OAuthTokens, TokenManager, TokenStore};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            ProviderError::transient(err.to_string())
        } else if err.is_decode() {
            ProviderError::Protocol(err.to_string())
        } else {
            ProviderError::transient(err.to_string())
        }
    }
}

impl From<OAuthError> for ProviderError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::Http(inner) => ProviderError::from(inner),
            OAuthError::TokenEndpoint { status, .. } if status >= 500 => {
                ProviderError::transient(err.to_string())
            }
            other => ProviderError::Auth(other.to_string()),
        }
    }
}

/// What to enumerate. Resolved once per run by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchWindow {
    /// Messages received at or after the instant. Resuming from a checkpoint
    /// re-lists the checkpointed message itself; dedup absorbs it.
    Since(DateTime<Utc>),
    /// Messages received at or after the given message, excluding it.
    AfterId(String),
    /// Exactly one message.
    Single(String),
    Unbounded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub id: String,
    /// Receipt time when the listing already carries it.
    pub received: Option<NativeTimestamp>,
}

impl MessageDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            received: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub bytes: Vec<u8>,
    pub native_timestamp: Option<NativeTimestamp>,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// Ensures usable credentials, refreshing when needed.
    async fn authenticate(&self) -> Result<(), ProviderError>;

    /// Candidate messages, oldest first.
    async fn list_candidate_ids(
        &self,
        window: &FetchWindow,
        search: Option<&str>,
    ) -> Result<Vec<MessageDescriptor>, ProviderError>;

    async fn fetch_raw(&self, descriptor: &MessageDescriptor) -> Result<RawMessage, ProviderError>;
}

pub fn build_provider(
    provider: Provider,
    config: &Config,
    http: reqwest::Client,
) -> Arc<dyn MailProvider> {
    match provider {
        Provider::Gmail => Arc::new(GmailProvider::from_config(config, http)),
        Provider::M365 => Arc::new(GraphProvider::from_config(config, http)),
    }
}

/// Maps an HTTP status to the provider taxonomy. `Ok` for success.
pub(crate) fn check_status(response: &reqwest::Response, what: &str) -> Result<(), ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(parse_retry_after)
        .map(Duration::from_millis);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Auth(format!("{what}: {status}"))
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => ProviderError::Transient {
            message: format!("{what}: {status}"),
            retry_after,
        },
        status if status.is_server_error() => ProviderError::Transient {
            message: format!("{what}: {status}"),
            retry_after,
        },
        status => ProviderError::Protocol(format!("{what}: {status}")),
    })
}

/// Runs `op` until it succeeds, fails permanently, or the policy runs out.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(ProviderError::Transient {
                message,
                retry_after,
            }) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt, retry_after);
                warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "transient provider error; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
