use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tracing::{error, info};

use crate::config::WebhookConfig;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to read artifact {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid webhook header {0}")]
    InvalidHeader(String),
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Posts finished artifacts to an external collaborator as a multipart
/// `file` field.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl WebhookClient {
    /// `None` when the webhook is disabled or has no URL.
    pub fn from_config(
        config: &WebhookConfig,
        http: reqwest::Client,
    ) -> Result<Option<Self>, WebhookError> {
        let Some(url) = config
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| config.enabled && !u.is_empty())
        else {
            return Ok(None);
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            if value.is_empty() {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| WebhookError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| WebhookError::InvalidHeader(name.to_string()))?;
            headers.insert(name, value);
        }

        Ok(Some(Self {
            http,
            url: url.to_string(),
            headers,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }))
    }

    pub async fn send(&self, path: &Path) -> Result<(), WebhookError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| WebhookError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "message.eml".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("message/rfc822")?;
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WebhookError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Fire-and-forget delivery: failures are logged, never returned.
    pub async fn deliver(&self, path: &Path) -> bool {
        match self.send(path).await {
            Ok(()) => {
                info!(path = %path.display(), "artifact sent to webhook");
                true
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "webhook delivery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn config(url: &str) -> WebhookConfig {
        WebhookConfig {
            enabled: true,
            url: Some(url.to_string()),
            headers: HashMap::from([("Authorization".to_string(), "secret".to_string())]),
            timeout_secs: 5,
        }
    }

    #[test]
    fn disabled_or_urlless_webhook_builds_nothing() {
        let mut cfg = config("http://localhost/hook");
        cfg.enabled = false;
        assert!(WebhookClient::from_config(&cfg, reqwest::Client::new()).expect("cfg").is_none());

        let mut cfg = config("");
        cfg.url = Some("  ".into());
        assert!(WebhookClient::from_config(&cfg, reqwest::Client::new()).expect("cfg").is_none());
    }

    #[tokio::test]
    async fn posts_artifact_as_multipart_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("authorization", "secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().expect("temp dir");
        let file = dir.path().join("20240101_0000_Hello_abc.eml");
        std::fs::write(&file, b"Subject: Hello\r\n\r\nbody").expect("write");

        let client = WebhookClient::from_config(&config(&format!("{}/hook", server.uri())), reqwest::Client::new())
            .expect("cfg")
            .expect("enabled");
        assert!(client.deliver(&file).await);

        let requests: Vec<Request> = server.received_requests().await.expect("requests");
        let body = String::from_utf8_lossy(&requests[0].body).to_string();
        assert!(body.contains("name=\"file\""));
        assert!(body.contains("filename=\"20240101_0000_Hello_abc.eml\""));
        assert!(body.contains("Content-Type: message/rfc822"));
        assert!(body.contains("Subject: Hello"));
    }

    #[tokio::test]
    async fn failures_are_reported_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let dir = TempDir::new().expect("temp dir");
        let file = dir.path().join("a.eml");
        std::fs::write(&file, b"x").expect("write");
        let client = WebhookClient::from_config(&config(&server.uri()), reqwest::Client::new())
            .expect("cfg")
            .expect("enabled");

        assert!(matches!(
            client.send(&file).await,
            Err(WebhookError::Status { status: 500, .. })
        ));
        assert!(!client.deliver(&file).await);
        assert!(!client.deliver(&dir.path().join("missing.eml")).await);
    }
}
