//! Refresh-token handling shared by the provider clients.
//!
//! Tokens are obtained out of band (browser or device flow) and written to a
//! JSON file under the auth directory. This module only keeps them fresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Missing expiry forces a refresh on first use.
    #[serde(alias = "expiry", default = "expired")]
    pub expires_at: DateTime<Utc>,
}

fn expired() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now + buffer >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("missing refresh token")]
    MissingRefreshToken,
    #[error("no token file at {0}; authorize this provider first")]
    MissingTokenFile(PathBuf),
    #[error("token file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load_tokens(&self) -> Result<OAuthTokens, OAuthError>;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), OAuthError>;
}

/// Tokens persisted as a JSON file, rewritten atomically after each refresh.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> OAuthError {
        OAuthError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load_tokens(&self) -> Result<OAuthTokens, OAuthError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OAuthError::MissingTokenFile(self.path.clone()));
            }
            Err(err) => return Err(self.io_error(err)),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), OAuthError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(err))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(tokens)?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|err| self.io_error(err))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| self.io_error(err))
    }
}

/// Application registration used for the refresh grant.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    /// Public clients (Microsoft device flow) have none.
    pub client_secret: Option<String>,
    pub token_endpoint: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub async fn refresh_access_token(
    client: &reqwest::Client,
    oauth: &OAuthClientConfig,
    tokens: &OAuthTokens,
) -> Result<OAuthTokens, OAuthError> {
    if tokens.refresh_token.is_empty() {
        return Err(OAuthError::MissingRefreshToken);
    }

    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("client_id", oauth.client_id.as_str()),
        ("refresh_token", tokens.refresh_token.as_str()),
    ];
    if let Some(secret) = oauth.client_secret.as_deref().filter(|s| !s.is_empty()) {
        form.push(("client_secret", secret));
    }
    if let Some(scope) = oauth.scope.as_deref().filter(|s| !s.is_empty()) {
        form.push(("scope", scope));
    }

    let response = client.post(&oauth.token_endpoint).form(&form).send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.text().await?;
    let payload: RefreshResponse = serde_json::from_str(&body)?;
    if payload.expires_in <= 0 {
        return Err(OAuthError::InvalidExpires(payload.expires_in));
    }

    Ok(OAuthTokens {
        access_token: payload.access_token,
        refresh_token: payload
            .refresh_token
            .unwrap_or_else(|| tokens.refresh_token.clone()),
        expires_at: Utc::now() + Duration::seconds(payload.expires_in),
    })
}

/// Hands out access tokens, refreshing at most once for concurrent callers.
pub struct TokenManager {
    http: reqwest::Client,
    oauth: OAuthClientConfig,
    store: Arc<dyn TokenStore>,
    tokens: RwLock<Option<OAuthTokens>>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, oauth: OAuthClientConfig, store: Arc<dyn TokenStore>) -> Self {
        Self {
            http,
            oauth,
            store,
            tokens: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    async fn current(&self) -> Result<OAuthTokens, OAuthError> {
        if let Some(tokens) = self.tokens.read().await.as_ref() {
            return Ok(tokens.clone());
        }
        let loaded = self.store.load_tokens().await?;
        *self.tokens.write().await = Some(loaded.clone());
        Ok(loaded)
    }

    pub async fn access_token(&self, force_refresh: bool) -> Result<String, OAuthError> {
        let tokens = self.current().await?;
        if !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
            return Ok(tokens.access_token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        let current = self.current().await?;
        if current.access_token != tokens.access_token
            && !current.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER)
        {
            return Ok(current.access_token);
        }

        let refreshed = refresh_access_token(&self.http, &self.oauth, &current).await?;
        *self.tokens.write().await = Some(refreshed.clone());
        self.store.save_tokens(&refreshed).await?;
        info!(endpoint = %self.oauth.token_endpoint, "refreshed access token");

        Ok(refreshed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oauth(server: &MockServer) -> OAuthClientConfig {
        OAuthClientConfig {
            client_id: "client".into(),
            client_secret: Some("secret".into()),
            token_endpoint: format!("{}/token", server.uri()),
            scope: None,
        }
    }

    fn tokens(expires_at: DateTime<Utc>) -> OAuthTokens {
        OAuthTokens {
            access_token: "old".into(),
            refresh_token: "old_refresh".into(),
            expires_at,
        }
    }

    #[test]
    fn needs_refresh_respects_buffer() {
        let tokens = tokens(Utc::now() + Duration::minutes(4));
        assert!(tokens.needs_refresh(Utc::now(), Duration::minutes(5)));
        assert!(!tokens.needs_refresh(Utc::now(), Duration::minutes(1)));
    }

    #[test]
    fn google_authorized_user_format_is_accepted() {
        let parsed: OAuthTokens = serde_json::from_value(json!({
            "token": "ya29",
            "refresh_token": "1//r",
            "expiry": "2024-01-01T00:00:00Z",
            "client_id": "ignored"
        }))
        .expect("parse");
        assert_eq!(parsed.access_token, "ya29");
        assert_eq!(parsed.expires_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");

        let no_expiry: OAuthTokens =
            serde_json::from_value(json!({"access_token": "a", "refresh_token": "r"})).expect("parse");
        assert!(no_expiry.needs_refresh(Utc::now(), Duration::zero()));
    }

    #[tokio::test]
    async fn refresh_updates_tokens_and_keeps_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("client_secret=secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new_access",
                "expires_in": 3600,
                "token_type": "Bearer",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let old = tokens(Utc::now());
        let refreshed = refresh_access_token(&reqwest::Client::new(), &oauth(&server), &old)
            .await
            .expect("refresh succeeds");

        assert_eq!(refreshed.access_token, "new_access");
        assert_eq!(refreshed.refresh_token, "old_refresh");
        assert!(refreshed.expires_at > old.expires_at);
    }

    #[tokio::test]
    async fn public_client_sends_scope_without_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("scope=Mail.Read"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "graph",
                "refresh_token": "rotated",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = oauth(&server);
        cfg.client_secret = None;
        cfg.scope = Some("Mail.Read offline_access".into());
        let refreshed = refresh_access_token(&reqwest::Client::new(), &cfg, &tokens(Utc::now()))
            .await
            .expect("refresh");
        assert_eq!(refreshed.refresh_token, "rotated");

        let requests = server.received_requests().await.expect("requests");
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(!body.contains("client_secret"));
    }

    #[tokio::test]
    async fn refresh_errors_on_bad_status_and_bad_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = refresh_access_token(&reqwest::Client::new(), &oauth(&server), &tokens(Utc::now()))
            .await
            .expect_err("should fail on non-200");
        assert!(matches!(err, OAuthError::TokenEndpoint { status: 400, .. }));

        let missing = OAuthTokens {
            refresh_token: String::new(),
            ..tokens(Utc::now())
        };
        let err = refresh_access_token(&reqwest::Client::new(), &oauth(&server), &missing)
            .await
            .expect_err("missing refresh token");
        assert!(matches!(err, OAuthError::MissingRefreshToken));
    }

    #[tokio::test]
    async fn file_store_round_trips_and_reports_missing_file() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileTokenStore::new(dir.path().join("auth/gmail_token.json"));

        assert!(matches!(
            store.load_tokens().await,
            Err(OAuthError::MissingTokenFile(_))
        ));

        let t = tokens(Utc::now());
        store.save_tokens(&t).await.expect("save");
        assert_eq!(store.load_tokens().await.expect("load"), t);
    }

    #[tokio::test]
    async fn manager_refreshes_expiring_tokens_once_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(FileTokenStore::new(dir.path().join("token.json")));
        store
            .save_tokens(&tokens(Utc::now() + Duration::minutes(1)))
            .await
            .expect("seed");

        let manager = TokenManager::new(reqwest::Client::new(), oauth(&server), store.clone());
        assert_eq!(manager.access_token(false).await.expect("token"), "fresh");
        assert_eq!(manager.access_token(false).await.expect("cached"), "fresh");
        assert_eq!(store.load_tokens().await.expect("load").access_token, "fresh");
    }
}
