use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub retry_after_ms: Option<u64>,
}

impl RateLimitInfo {
    pub fn new(retry_after_ms: Option<u64>) -> Self {
        Self { retry_after_ms }
    }
}

impl fmt::Display for RateLimitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ms) = self.retry_after_ms {
            write!(f, " (retry after {}ms)", ms)
        } else {
            Ok(())
        }
    }
}

impl std::error::Error for RateLimitInfo {}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("timeout")]
    Timeout,
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("rate limited{0}")]
    RateLimited(#[source] RateLimitInfo),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider error: {0}")]
    ProviderError(String),
}

impl LLMError {
    pub fn kind(&self) -> AiErrorKind {
        match self {
            LLMError::Unreachable(_) | LLMError::Timeout => AiErrorKind::Network,
            LLMError::AuthenticationFailed(_) => AiErrorKind::Auth,
            LLMError::RateLimited(_) => AiErrorKind::RateLimit,
            LLMError::ServerError(_) => AiErrorKind::Server,
            LLMError::ParseError(_) => AiErrorKind::Parse,
            LLMError::InvalidRequest(_) | LLMError::ProviderError(_) => AiErrorKind::Other,
        }
    }
}

/// Coarse failure category used for breaker decisions and run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiErrorKind {
    Network,
    Auth,
    RateLimit,
    Server,
    Parse,
    Other,
}

impl AiErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiErrorKind::Network => "network",
            AiErrorKind::Auth => "auth",
            AiErrorKind::RateLimit => "rate_limit",
            AiErrorKind::Server => "server",
            AiErrorKind::Parse => "parse",
            AiErrorKind::Other => "other",
        }
    }

    /// Kinds that mean the endpoint itself is unusable right now.
    pub fn is_fast_trip(&self) -> bool {
        matches!(self, AiErrorKind::Network | AiErrorKind::Auth)
    }
}

impl fmt::Display for AiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
