use serde::Deserialize;
use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::types::Provider;

pub const DEFAULT_CATEGORIES: [&str; 6] = [
    "important",
    "promotional",
    "transactional",
    "social",
    "newsletter",
    "spam",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub m365: M365Config,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
    pub download_dir: PathBuf,
    pub auth_dir: PathBuf,
    /// Pre-database checkpoint file, imported once on startup if present.
    #[serde(default)]
    pub legacy_checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub legacy_metadata: Option<PathBuf>,
    /// Provider the legacy metadata file's rows are attributed to.
    #[serde(default = "default_legacy_provider")]
    pub legacy_provider: Provider,
}

fn default_legacy_provider() -> Provider {
    Provider::Gmail
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AiConfig {
    /// `openai`, `ollama`, `lm_studio` or `local`. Picks a default base URL.
    pub provider: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub classification_temperature: f32,
    pub extraction_temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_secs: u64,
    pub categories: Vec<String>,
    pub skip_categories: Vec<String>,
    pub health_probe: bool,
    pub rate_limit_retries: u32,
    pub rate_limit_backoff_ms: u64,
    pub rate_limit_max_backoff_ms: u64,
    pub fast_trip_threshold: u32,
    pub server_error_threshold: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            classification_temperature: 0.3,
            extraction_temperature: 0.1,
            max_output_tokens: 1024,
            timeout_secs: 60,
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            skip_categories: Vec::new(),
            health_probe: true,
            rate_limit_retries: 3,
            rate_limit_backoff_ms: 1_000,
            rate_limit_max_backoff_ms: 60_000,
            fast_trip_threshold: 2,
            server_error_threshold: 10,
        }
    }
}

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1/";

impl AiConfig {
    /// Base URL of the OpenAI-compatible endpoint, always with a trailing slash.
    pub fn resolved_base_url(&self) -> String {
        let url = match self.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => url.trim().to_string(),
            None => match self.provider.as_str() {
                "ollama" => "http://localhost:11434/v1".to_string(),
                "lm_studio" => "http://localhost:1234/v1".to_string(),
                "local" => "http://localhost:8000/v1".to_string(),
                _ => OPENAI_BASE_URL.to_string(),
            },
        };
        if url.ends_with('/') {
            url
        } else {
            format!("{url}/")
        }
    }

    /// Only OpenAI proper is asked for JSON response format; local servers
    /// vary in support.
    pub fn is_openai(&self) -> bool {
        self.resolved_base_url().contains("api.openai.com")
    }

    /// Local servers accept any key, so one is only required for OpenAI.
    pub fn resolved_api_key(&self) -> Option<String> {
        match self.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Some(key.to_string()),
            None if self.is_openai() => None,
            None => Some("not-needed".to_string()),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn rate_limit_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.rate_limit_retries + 1,
            base_delay: Duration::from_millis(self.rate_limit_backoff_ms),
            max_delay: Duration::from_millis(self.rate_limit_max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub token_endpoint: String,
    pub token_file: String,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            token_file: "gmail_token.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct M365Config {
    pub client_id: String,
    pub tenant: String,
    pub scopes: String,
    pub api_base: String,
    pub token_endpoint: Option<String>,
    pub token_file: String,
    pub page_size: u32,
}

impl Default for M365Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            tenant: "common".to_string(),
            scopes: "https://graph.microsoft.com/Mail.Read offline_access".to_string(),
            api_base: "https://graph.microsoft.com/v1.0".to_string(),
            token_endpoint: None,
            token_file: "m365_token.json".to_string(),
            page_size: 50,
        }
    }
}

impl M365Config {
    pub fn resolved_token_endpoint(&self) -> String {
        self.token_endpoint.clone().unwrap_or_else(|| {
            format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                self.tenant
            )
        })
    }
}

/// What a run fetches when nothing narrower applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultWindow {
    /// Messages received since local midnight.
    #[default]
    Today,
    /// No lower bound: the whole mailbox.
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub default_window: DefaultWindow,
    pub fetch_attempts: u32,
    pub fetch_backoff_ms: u64,
    pub fetch_max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            default_window: DefaultWindow::Today,
            fetch_attempts: 3,
            fetch_backoff_ms: 500,
            fetch_max_backoff_ms: 10_000,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn fetch_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_attempts.max(1),
            base_delay: Duration::from_millis(self.fetch_backoff_ms),
            max_delay: Duration::from_millis(self.fetch_max_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            headers: HashMap::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("webhook is enabled but no url is configured")]
    MissingWebhookUrl,
    #[error("sync.batch_size must be at least 1")]
    InvalidBatchSize,
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            let port: u16 = port.parse().map_err(ConfigError::InvalidPort)?;
            self.app.port = port;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Some(url) = first_env(&["LLM_BASE_URL", "OPENAI_BASE_URL"]) {
            self.ai.base_url = Some(url);
        }
        if let Some(key) = first_env(&["LLM_API_KEY", "OPENAI_API_KEY"]) {
            self.ai.api_key = Some(key);
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            self.ai.model = model;
        }

        if let Ok(path) = env::var("MAILVAULT_DB_PATH") {
            self.paths.database = PathBuf::from(path);
        }
        if let Ok(path) = env::var("MAILVAULT_DOWNLOAD_DIR") {
            self.paths.download_dir = PathBuf::from(path);
        }
        if let Ok(path) = env::var("MAILVAULT_AUTH_DIR") {
            self.paths.auth_dir = PathBuf::from(path);
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker_path(&mut self.paths.database)?;
        apply_env_marker_path(&mut self.paths.download_dir)?;
        apply_env_marker_path(&mut self.paths.auth_dir)?;
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        apply_env_marker(&mut self.ai.model)?;
        for value in [&mut self.ai.base_url, &mut self.ai.api_key, &mut self.webhook.url]
            .into_iter()
            .flatten()
        {
            apply_env_marker(value)?;
        }
        apply_env_marker(&mut self.gmail.client_id)?;
        apply_env_marker(&mut self.gmail.client_secret)?;
        apply_env_marker(&mut self.m365.client_id)?;
        for value in self.webhook.headers.values_mut() {
            apply_env_marker(value)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        expand_tilde(&mut self.paths.database);
        expand_tilde(&mut self.paths.download_dir);
        expand_tilde(&mut self.paths.auth_dir);
        if let Some(path) = &mut self.paths.legacy_checkpoint {
            expand_tilde(path);
        }
        if let Some(path) = &mut self.paths.legacy_metadata {
            expand_tilde(path);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook.enabled && self.webhook.url.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingWebhookUrl);
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(())
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| env::var(name).ok().filter(|v| !v.is_empty()))
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}

fn expand_tilde(path: &mut PathBuf) {
    let value = path.to_string_lossy().to_string();
    *path = PathBuf::from(shellexpand::tilde(&value).as_ref());
}
