use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::oauth::{FileTokenStore, GOOGLE_TOKEN_ENDPOINT, OAuthClientConfig, TokenManager};
use super::{
    FetchWindow, MailProvider, MessageDescriptor, ProviderError, RawMessage, check_status,
    retry_transient,
};
use crate::config::Config;
use crate::retry::RetryPolicy;
use crate::types::{NativeTimestamp, Provider};

const PAGE_SIZE: u32 = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    #[serde(default)]
    raw: Option<String>,
    internal_date: Option<String>,
}

/// Gmail REST client over the `users/me` resource.
pub struct GmailProvider {
    http: Client,
    api_base: String,
    tokens: TokenManager,
    timeout: Duration,
    list_policy: RetryPolicy,
}

impl GmailProvider {
    pub fn new(
        http: Client,
        api_base: impl Into<String>,
        tokens: TokenManager,
        timeout: Duration,
        list_policy: RetryPolicy,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
            timeout,
            list_policy,
        }
    }

    pub fn from_config(config: &Config, http: Client) -> Self {
        let gmail = &config.gmail;
        let token_endpoint = if gmail.token_endpoint.is_empty() {
            GOOGLE_TOKEN_ENDPOINT.to_string()
        } else {
            gmail.token_endpoint.clone()
        };
        let oauth = OAuthClientConfig {
            client_id: gmail.client_id.clone(),
            client_secret: Some(gmail.client_secret.clone()),
            token_endpoint,
            scope: None,
        };
        let store = Arc::new(FileTokenStore::new(config.paths.auth_dir.join(&gmail.token_file)));
        Self::new(
            http.clone(),
            gmail.api_base.clone(),
            TokenManager::new(http, oauth, store),
            config.sync.request_timeout(),
            config.sync.fetch_policy(),
        )
    }

    async fn send<B>(&self, build: B, what: &str) -> Result<reqwest::Response, ProviderError>
    where
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.tokens.access_token(false).await?;
        let mut response = build()
            .bearer_auth(&token)
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let token = self.tokens.access_token(true).await?;
            response = build()
                .bearer_auth(&token)
                .timeout(self.timeout)
                .send()
                .await?;
        }

        check_status(&response, what)?;
        Ok(response)
    }

    async fn get_message(&self, id: &str, format: &str) -> Result<MessageResponse, ProviderError> {
        let url = format!("{}/messages/{}", self.api_base, id);
        let response = self
            .send(|| self.http.get(&url).query(&[("format", format)]), id)
            .await?;
        response
            .json()
            .await
            .map_err(|err| ProviderError::Protocol(err.to_string()))
    }

    async fn list_page(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse, ProviderError> {
        let url = format!("{}/messages", self.api_base);
        let response = self
            .send(
                || {
                    let mut builder = self.http.get(&url).query(&[("maxResults", PAGE_SIZE)]);
                    if let Some(q) = query {
                        builder = builder.query(&[("q", q)]);
                    }
                    if let Some(token) = page_token {
                        builder = builder.query(&[("pageToken", token)]);
                    }
                    builder
                },
                "list messages",
            )
            .await?;
        response
            .json()
            .await
            .map_err(|err| ProviderError::Protocol(err.to_string()))
    }

    /// Internal date (epoch millis) of a message, used to resolve after-id
    /// windows.
    async fn internal_date(&self, id: &str) -> Result<i64, ProviderError> {
        let message = self.get_message(id, "minimal").await?;
        parse_internal_date(message.internal_date.as_deref())
            .ok_or_else(|| ProviderError::Protocol(format!("message {id} has no internalDate")))
    }
}

/// `after:` is exclusive and second-granular, so step back one second to keep
/// messages sharing the boundary second in the listing.
fn inclusive_after(millis: i64) -> i64 {
    millis.div_euclid(1000) - 1
}

fn build_query(after_secs: Option<i64>, search: Option<&str>) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(secs) = after_secs {
        parts.push(format!("after:{secs}"));
    }
    if let Some(search) = search.map(str::trim).filter(|s| !s.is_empty()) {
        parts.push(search.to_string());
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

fn parse_internal_date(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
}

fn decode_raw(data: &str) -> Option<Vec<u8>> {
    let trimmed = data.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .ok()
        .or_else(|| STANDARD.decode(data.trim()).ok())
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    async fn authenticate(&self) -> Result<(), ProviderError> {
        self.tokens.access_token(false).await?;
        Ok(())
    }

    async fn list_candidate_ids(
        &self,
        window: &FetchWindow,
        search: Option<&str>,
    ) -> Result<Vec<MessageDescriptor>, ProviderError> {
        let (after_secs, exclude) = match window {
            FetchWindow::Single(id) => return Ok(vec![MessageDescriptor::new(id.clone())]),
            FetchWindow::Since(since) => (Some(inclusive_after(since.timestamp_millis())), None),
            FetchWindow::AfterId(id) => {
                let millis = self.internal_date(id).await?;
                (Some(inclusive_after(millis)), Some(id.as_str()))
            }
            FetchWindow::Unbounded => (None, None),
        };
        let query = build_query(after_secs, search);
        debug!(query = query.as_deref().unwrap_or(""), "listing gmail messages");

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = retry_transient(self.list_policy, "gmail list", || {
                self.list_page(query.as_deref(), page_token.as_deref())
            })
            .await?;
            ids.extend(
                page.messages
                    .into_iter()
                    .map(|m| m.id)
                    .filter(|id| Some(id.as_str()) != exclude),
            );
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        // Gmail lists newest first.
        ids.reverse();
        info!(count = ids.len(), "gmail candidates listed");
        Ok(ids.into_iter().map(MessageDescriptor::new).collect())
    }

    async fn fetch_raw(&self, descriptor: &MessageDescriptor) -> Result<RawMessage, ProviderError> {
        let message = self.get_message(&descriptor.id, "raw").await?;
        let raw = message
            .raw
            .ok_or_else(|| ProviderError::Protocol(format!("message {} has no raw body", descriptor.id)))?;
        let bytes = decode_raw(&raw)
            .ok_or_else(|| ProviderError::Protocol(format!("message {} raw body is not base64", descriptor.id)))?;

        Ok(RawMessage {
            bytes,
            native_timestamp: parse_internal_date(message.internal_date.as_deref())
                .map(NativeTimestamp::EpochMillis)
                .or_else(|| descriptor.received.clone()),
        })
    }
}
