use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::oauth::{FileTokenStore, OAuthClientConfig, TokenManager};
use super::{
    FetchWindow, MailProvider, MessageDescriptor, ProviderError, RawMessage, check_status,
    retry_transient,
};
use crate::config::Config;
use crate::retry::RetryPolicy;
use crate::types::{NativeTimestamp, Provider};

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    received_date_time: Option<String>,
}

impl GraphMessage {
    fn received(&self) -> Option<NativeTimestamp> {
        self.received_date_time
            .clone()
            .map(NativeTimestamp::Iso8601)
    }
}

/// Microsoft Graph mailbox client over `/me/messages`.
pub struct GraphProvider {
    http: Client,
    api_base: String,
    tokens: TokenManager,
    timeout: Duration,
    list_policy: RetryPolicy,
    page_size: u32,
}

impl GraphProvider {
    pub fn new(
        http: Client,
        api_base: impl Into<String>,
        tokens: TokenManager,
        timeout: Duration,
        list_policy: RetryPolicy,
        page_size: u32,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
            timeout,
            list_policy,
            page_size: page_size.max(1),
        }
    }

    pub fn from_config(config: &Config, http: Client) -> Self {
        let m365 = &config.m365;
        let oauth = OAuthClientConfig {
            client_id: m365.client_id.clone(),
            client_secret: None,
            token_endpoint: m365.resolved_token_endpoint(),
            scope: Some(m365.scopes.clone()),
        };
        let store = Arc::new(FileTokenStore::new(config.paths.auth_dir.join(&m365.token_file)));
        Self::new(
            http.clone(),
            m365.api_base.clone(),
            TokenManager::new(http, oauth, store),
            config.sync.request_timeout(),
            config.sync.fetch_policy(),
            m365.page_size,
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

    async fn fetch_page(&self, url: &str, first_page: Option<&[(&str, String)]>, search: bool) -> Result<MessagePage, ProviderError> {
        let response = self
            .send(
                || {
                    let mut builder = self.http.get(url);
                    if let Some(params) = first_page {
                        builder = builder.query(params);
                    }
                    if search {
                        builder = builder.header("ConsistencyLevel", "eventual");
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

    async fn received_at(&self, id: &str) -> Result<Option<NativeTimestamp>, ProviderError> {
        let url = format!("{}/me/messages/{}", self.api_base, id);
        let message: GraphMessage = self
            .send(|| self.http.get(&url).query(&[("$select", "id,receivedDateTime")]), id)
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::Protocol(err.to_string()))?;
        Ok(message.received())
    }
}

fn odata_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl MailProvider for GraphProvider {
    fn provider(&self) -> Provider {
        Provider::M365
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
        let (since, exclude) = match window {
            FetchWindow::Single(id) => return Ok(vec![MessageDescriptor::new(id.clone())]),
            FetchWindow::Since(since) => (Some(*since), None),
            FetchWindow::AfterId(id) => {
                let anchor = self
                    .received_at(id)
                    .await?
                    .and_then(|ts| ts.to_utc())
                    .ok_or_else(|| ProviderError::Protocol(format!("message {id} has no receivedDateTime")))?;
                (Some(anchor), Some(id.as_str()))
            }
            FetchWindow::Unbounded => (None, None),
        };
        let search = search.map(str::trim).filter(|s| !s.is_empty());

        // $search can't be combined with $filter or $orderby on messages, so
        // the window is applied client-side in that case.
        let mut params = vec![
            ("$select", "id,receivedDateTime".to_string()),
            ("$top", self.page_size.to_string()),
        ];
        match (search, since) {
            (Some(text), _) => params.push(("$search", format!("\"{}\"", text.replace('"', "")))),
            (None, Some(since)) => {
                params.push(("$filter", format!("receivedDateTime ge {}", odata_time(since))));
                params.push(("$orderby", "receivedDateTime asc".to_string()));
            }
            (None, None) => params.push(("$orderby", "receivedDateTime asc".to_string())),
        }
        debug!(?params, "listing graph messages");

        let first_url = format!("{}/me/messages", self.api_base);
        let mut next: Option<String> = None;
        let mut messages = Vec::new();
        loop {
            let page = match &next {
                None => {
                    retry_transient(self.list_policy, "graph list", || {
                        self.fetch_page(&first_url, Some(params.as_slice()), search.is_some())
                    })
                    .await?
                }
                Some(link) => {
                    retry_transient(self.list_policy, "graph list", || {
                        self.fetch_page(link, None, search.is_some())
                    })
                    .await?
                }
            };
            messages.extend(page.value);
            match page.next_link {
                Some(link) if !link.is_empty() => next = Some(link),
                _ => break,
            }
        }

        let since_ms = since.map(|s| s.timestamp_millis());
        let mut descriptors: Vec<MessageDescriptor> = messages
            .into_iter()
            .filter(|m| Some(m.id.as_str()) != exclude)
            .map(|m| MessageDescriptor {
                received: m.received(),
                id: m.id,
            })
            .filter(|d| match (since_ms, d.received.as_ref().and_then(NativeTimestamp::position)) {
                (Some(since), Some(at)) => at >= since,
                _ => true,
            })
            .collect();
        descriptors.sort_by(|a, b| match (&a.received, &b.received) {
            (Some(x), Some(y)) => x.cmp_position(y),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        info!(count = descriptors.len(), "graph candidates listed");
        Ok(descriptors)
    }

    async fn fetch_raw(&self, descriptor: &MessageDescriptor) -> Result<RawMessage, ProviderError> {
        let url = format!("{}/me/messages/{}/$value", self.api_base, descriptor.id);
        let bytes = self
            .send(|| self.http.get(&url), &descriptor.id)
            .await?
            .bytes()
            .await?
            .to_vec();

        let native_timestamp = match &descriptor.received {
            Some(ts) => Some(ts.clone()),
            None => self.received_at(&descriptor.id).await?,
        };
        Ok(RawMessage {
            bytes,
            native_timestamp,
        })
    }
}
