use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genai::{
    Client as GenaiClient, Error as GenaiError, ModelIden, ServiceTarget,
    adapter::AdapterKind,
    chat::{
        ChatMessage as GenaiChatMessage, ChatOptions, ChatRequest, ChatResponse,
        ChatResponseFormat, MessageContent,
    },
    resolver::{AuthData, Endpoint, ServiceTargetResolver},
    webc,
};
use reqwest::{
    StatusCode,
    header::{HeaderMap, HeaderValue, RETRY_AFTER},
};
use tracing::debug;

use super::error::{LLMError, RateLimitInfo};
use super::types::{ChatMessage, ChatRole, CompletionRequest, CompletionResponse, LlmCallContext};
use crate::config::AiConfig;

/// Minimal async interface for the model endpoint.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError>;

    /// Cheap reachability/auth check made once before a run.
    async fn probe(&self) -> Result<(), LLMError> {
        Ok(())
    }
}

#[async_trait]
pub trait ChatExecutor: Send + Sync {
    async fn exec_chat(
        &self,
        model: &str,
        request: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<ChatResponse, GenaiError>;
}

#[async_trait]
impl ChatExecutor for GenaiClient {
    async fn exec_chat(
        &self,
        model: &str,
        request: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<ChatResponse, GenaiError> {
        GenaiClient::exec_chat(self, model, request, options).await
    }
}

/// OpenAI-compatible client backed by the genai crate. Every model name is
/// routed through the OpenAI adapter at the configured base URL, so local
/// servers (Ollama, LM Studio, vLLM) work the same as OpenAI proper.
pub struct GenaiLLMClient {
    chat: Arc<dyn ChatExecutor>,
    http: reqwest::Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    json_mode_supported: bool,
}

impl GenaiLLMClient {
    pub fn from_config(cfg: &AiConfig, http: reqwest::Client) -> Result<Self, LLMError> {
        let base_url = cfg.resolved_base_url();
        let api_key = cfg.resolved_api_key().ok_or_else(|| {
            LLMError::AuthenticationFailed("no API key configured for OpenAI".to_string())
        })?;

        let resolver = ServiceTargetResolver::from_resolver_fn(
            move |target: ServiceTarget| -> Result<ServiceTarget, genai::resolver::Error> {
                let ServiceTarget { model, .. } = target;
                Ok(ServiceTarget {
                    endpoint: Endpoint::from_owned(base_url.clone()),
                    auth: AuthData::from_single(api_key.clone()),
                    model: ModelIden::new(AdapterKind::OpenAI, model.model_name),
                })
            },
        );
        let chat: Arc<dyn ChatExecutor> = Arc::new(
            GenaiClient::builder()
                .with_service_target_resolver(resolver)
                .build(),
        );

        Ok(Self::with_executor(cfg, http, chat))
    }

    pub fn with_executor(cfg: &AiConfig, http: reqwest::Client, chat: Arc<dyn ChatExecutor>) -> Self {
        Self {
            chat,
            http,
            model: cfg.model.clone(),
            base_url: cfg.resolved_base_url(),
            api_key: cfg.resolved_api_key(),
            timeout: cfg.timeout(),
            json_mode_supported: cfg.is_openai(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_chat_request(&self, request: &CompletionRequest) -> ChatRequest {
        let messages = request
            .messages
            .iter()
            .map(to_genai_message)
            .collect::<Vec<_>>();
        ChatRequest::from_messages(messages)
    }

    fn build_chat_options(&self, request: &CompletionRequest) -> ChatOptions {
        let mut options = ChatOptions::default()
            .with_temperature(request.temperature as f64)
            .with_max_tokens(request.max_tokens);

        if request.json_mode && self.json_mode_supported {
            options = options.with_response_format(ChatResponseFormat::JsonMode);
        }

        options
    }
}

#[async_trait]
impl LLMClient for GenaiLLMClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError> {
        let chat_request = self.build_chat_request(&request);
        let options = self.build_chat_options(&request);

        let start = Instant::now();
        let result = tokio::time::timeout(
            self.timeout,
            self.chat.exec_chat(&self.model, chat_request, Some(&options)),
        )
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let response = match result {
            Err(_) => return Err(LLMError::Timeout),
            Ok(Err(err)) => {
                let mapped = map_genai_error(err);
                debug!(
                    capability = %context.capability,
                    message_id = context.message_id.as_deref().unwrap_or(""),
                    latency_ms,
                    error = %mapped,
                    "model call failed"
                );
                return Err(mapped);
            }
            Ok(Ok(response)) => response,
        };

        let content = response.first_text().unwrap_or("").to_string();
        let (input_tokens, output_tokens) = usage_tokens(&response.usage);
        debug!(
            capability = %context.capability,
            message_id = context.message_id.as_deref().unwrap_or(""),
            latency_ms,
            input_tokens,
            output_tokens,
            "model call completed"
        );

        Ok(CompletionResponse {
            content,
            model: response.provider_model_iden.to_string(),
            input_tokens,
            output_tokens,
            latency_ms,
        })
    }

    async fn probe(&self) -> Result<(), LLMError> {
        let url = format!("{}models", self.base_url);
        let mut req = self.http.get(&url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(LLMError::AuthenticationFailed(status.to_string()))
            }
            // Some local servers don't implement the listing; reaching them is enough.
            status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
            status if status.is_server_error() => Err(LLMError::ServerError(status.to_string())),
            status => Err(LLMError::ProviderError(status.to_string())),
        }
    }
}

fn to_genai_message(message: &ChatMessage) -> GenaiChatMessage {
    match message.role {
        ChatRole::System => GenaiChatMessage::system(text_content(&message.content)),
        ChatRole::User => GenaiChatMessage::user(text_content(&message.content)),
        ChatRole::Assistant => GenaiChatMessage::assistant(text_content(&message.content)),
    }
}

fn text_content(content: &str) -> MessageContent {
    MessageContent::from_text(content.to_string())
}

fn usage_tokens(usage: &genai::chat::Usage) -> (u32, u32) {
    let input = usage.prompt_tokens.unwrap_or_default().max(0) as u32;
    let output = usage.completion_tokens.unwrap_or_default().max(0) as u32;
    (input, output)
}

fn map_reqwest_error(err: reqwest::Error) -> LLMError {
    if err.is_timeout() {
        LLMError::Timeout
    } else if err.is_connect() || err.is_request() {
        LLMError::Unreachable(err.to_string())
    } else {
        LLMError::ProviderError(err.to_string())
    }
}

fn map_genai_error(err: GenaiError) -> LLMError {
    match err {
        GenaiError::RequiresApiKey { .. }
        | GenaiError::NoAuthResolver { .. }
        | GenaiError::NoAuthData { .. } => LLMError::AuthenticationFailed(err.to_string()),
        GenaiError::ChatReqHasNoMessages { .. }
        | GenaiError::LastChatMessageIsNotUser { .. }
        | GenaiError::MessageRoleNotSupported { .. }
        | GenaiError::MessageContentTypeNotSupported { .. }
        | GenaiError::JsonModeWithoutInstruction
        | GenaiError::VerbosityParsing { .. }
        | GenaiError::ReasoningParsingError { .. }
        | GenaiError::ServiceTierParsing { .. }
        | GenaiError::ModelMapperFailed { .. }
        | GenaiError::AdapterNotSupported { .. }
        | GenaiError::Resolver { .. } => LLMError::InvalidRequest(err.to_string()),
        GenaiError::InvalidJsonResponseElement { .. } | GenaiError::StreamParse { .. } => {
            LLMError::ParseError(err.to_string())
        }
        GenaiError::NoChatResponse { .. } => LLMError::ServerError(err.to_string()),
        GenaiError::WebAdapterCall { webc_error, .. }
        | GenaiError::WebModelCall { webc_error, .. } => map_webc_error(webc_error),
        GenaiError::ChatResponse { .. } | GenaiError::WebStream { .. } => {
            LLMError::ProviderError(err.to_string())
        }
        GenaiError::Internal(msg) => LLMError::ProviderError(msg),
        GenaiError::EventSourceClone(e) => LLMError::ProviderError(e.to_string()),
        GenaiError::JsonValueExt(e) => LLMError::ParseError(e.to_string()),
        GenaiError::ReqwestEventSource(err) => LLMError::ProviderError(err.to_string()),
        GenaiError::SerdeJson(err) => LLMError::ParseError(err.to_string()),
    }
}

fn map_webc_error(err: webc::Error) -> LLMError {
    match err {
        webc::Error::ResponseFailedStatus {
            status, headers, ..
        } => {
            let retry_after_ms = retry_after_ms_from_headers(&headers);
            match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    LLMError::RateLimited(RateLimitInfo::new(retry_after_ms))
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    LLMError::AuthenticationFailed(status.to_string())
                }
                status if status.is_server_error() => LLMError::ServerError(status.to_string()),
                status if status.is_client_error() => LLMError::InvalidRequest(status.to_string()),
                status => LLMError::ProviderError(status.to_string()),
            }
        }
        webc::Error::Reqwest(req_err) => map_reqwest_error(req_err),
        err @ webc::Error::ResponseFailedNotJson { .. } => LLMError::ParseError(err.to_string()),
        webc::Error::JsonValueExt(parse_err) => LLMError::ParseError(parse_err.to_string()),
        webc::Error::EventSourceClone(clone_err) => LLMError::ProviderError(clone_err.to_string()),
    }
}

fn retry_after_ms_from_headers(headers: &HeaderMap) -> Option<u64> {
    if let Some(value) = headers.get(RETRY_AFTER) {
        if let Some(ms) = parse_retry_after(value) {
            return Some(ms);
        }
    }

    headers.get("x-ratelimit-reset").and_then(parse_epoch_reset)
}

/// `Retry-After` as delta seconds or an HTTP-date.
pub(crate) fn parse_retry_after(value: &HeaderValue) -> Option<u64> {
    let raw = value.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs.saturating_mul(1000));
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        let delta_ms = (dt.with_timezone(&Utc) - Utc::now()).num_milliseconds();
        if delta_ms > 0 {
            return Some(delta_ms as u64);
        }
    }

    None
}

fn parse_epoch_reset(value: &HeaderValue) -> Option<u64> {
    let raw = value.to_str().ok()?.trim();
    let reset_epoch = raw.parse::<i64>().ok()?;
    let delta_ms = (reset_epoch - Utc::now().timestamp()).saturating_mul(1000);
    (delta_ms > 0).then_some(delta_ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Capability;
    use genai::chat::Usage;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_config(base_url: &str) -> AiConfig {
        AiConfig {
            provider: "local".into(),
            base_url: Some(base_url.to_string()),
            timeout_secs: 1,
            ..AiConfig::default()
        }
    }

    #[derive(Default)]
    struct StubChatExecutor {
        responses: Mutex<Vec<Result<ChatResponse, GenaiError>>>,
        calls: Mutex<Vec<(String, ChatRequest, Option<ChatOptions>)>>,
        delay: Option<Duration>,
    }

    impl StubChatExecutor {
        fn new(response: Result<ChatResponse, GenaiError>) -> Self {
            Self {
                responses: Mutex::new(vec![response]),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ChatExecutor for StubChatExecutor {
        async fn exec_chat(
            &self,
            model: &str,
            request: ChatRequest,
            options: Option<&ChatOptions>,
        ) -> Result<ChatResponse, GenaiError> {
            self.calls.lock().expect("calls").push((
                model.to_string(),
                request.clone(),
                options.cloned(),
            ));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.responses
                .lock()
                .expect("responses")
                .pop()
                .unwrap_or_else(|| Err(GenaiError::Internal("stub missing response".into())))
        }
    }

    fn ok_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: MessageContent::from_text(text),
            reasoning_content: None,
            model_iden: ModelIden::new(AdapterKind::OpenAI, "gpt-4o-mini"),
            provider_model_iden: ModelIden::new(AdapterKind::OpenAI, "gpt-4o-mini"),
            usage: Usage {
                prompt_tokens: Some(5),
                completion_tokens: Some(7),
                total_tokens: None,
                ..Default::default()
            },
            captured_raw_body: None,
        }
    }

    fn status_error(status: StatusCode, headers: HeaderMap) -> GenaiError {
        GenaiError::WebModelCall {
            model_iden: ModelIden::new(AdapterKind::OpenAI, "gpt-4o-mini"),
            webc_error: webc::Error::ResponseFailedStatus {
                status,
                body: String::new(),
                headers: Box::new(headers),
            },
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatMessage::system("system"), ChatMessage::user("hi there")],
            temperature: 0.3,
            max_tokens: 64,
            json_mode: true,
        }
    }

    #[test]
    fn usage_tokens_defaults_and_clamps() {
        let mut usage = Usage::default();
        assert_eq!(usage_tokens(&usage), (0, 0));

        usage.prompt_tokens = Some(-5);
        usage.completion_tokens = Some(7);
        assert_eq!(usage_tokens(&usage), (0, 7));
    }

    #[test]
    fn build_chat_request_converts_messages() {
        let client = GenaiLLMClient::with_executor(
            &local_config("http://localhost:1/v1"),
            reqwest::Client::new(),
            Arc::new(StubChatExecutor::default()),
        );

        let built = client.build_chat_request(&request());
        assert_eq!(built.messages.len(), 2);
        assert!(matches!(
            built.messages[0].role,
            genai::chat::ChatRole::System
        ));
        assert_eq!(built.messages[1].content.first_text(), Some("hi there"));
    }

    #[test]
    fn json_mode_only_requested_from_openai() {
        let local = GenaiLLMClient::with_executor(
            &local_config("http://localhost:1/v1"),
            reqwest::Client::new(),
            Arc::new(StubChatExecutor::default()),
        );
        let options = local.build_chat_options(&request());
        assert_eq!(options.max_tokens, Some(64));
        assert!(options.response_format.is_none());

        let openai_cfg = AiConfig {
            api_key: Some("sk-test".into()),
            ..AiConfig::default()
        };
        let openai = GenaiLLMClient::with_executor(
            &openai_cfg,
            reqwest::Client::new(),
            Arc::new(StubChatExecutor::default()),
        );
        assert!(matches!(
            openai.build_chat_options(&request()).response_format,
            Some(ChatResponseFormat::JsonMode)
        ));
    }

    #[test]
    fn from_config_requires_key_for_openai() {
        let cfg = AiConfig::default();
        assert!(matches!(
            GenaiLLMClient::from_config(&cfg, reqwest::Client::new()),
            Err(LLMError::AuthenticationFailed(_))
        ));
        assert!(GenaiLLMClient::from_config(&local_config("http://localhost:1/v1"), reqwest::Client::new()).is_ok());
    }

    #[test]
    fn map_genai_error_maps_categories() {
        let model_iden = ModelIden::from((AdapterKind::OpenAI, "gpt-4o-mini"));

        assert!(matches!(
            map_genai_error(status_error(StatusCode::TOO_MANY_REQUESTS, HeaderMap::new())),
            LLMError::RateLimited(_)
        ));
        assert!(matches!(
            map_genai_error(GenaiError::ChatReqHasNoMessages {
                model_iden: model_iden.clone(),
            }),
            LLMError::InvalidRequest(_)
        ));
        assert!(matches!(
            map_genai_error(GenaiError::InvalidJsonResponseElement { info: "bad" }),
            LLMError::ParseError(_)
        ));
        assert!(matches!(
            map_genai_error(GenaiError::RequiresApiKey { model_iden }),
            LLMError::AuthenticationFailed(_)
        ));
    }

    #[test]
    fn map_webc_error_classifies_status_codes() {
        let cases = [
            (StatusCode::UNAUTHORIZED, "auth"),
            (StatusCode::FORBIDDEN, "auth"),
            (StatusCode::TOO_MANY_REQUESTS, "rate_limit"),
            (StatusCode::BAD_GATEWAY, "server"),
            (StatusCode::BAD_REQUEST, "other"),
        ];
        for (status, kind) in cases {
            let err = map_webc_error(webc::Error::ResponseFailedStatus {
                status,
                body: String::new(),
                headers: Box::new(HeaderMap::new()),
            });
            assert_eq!(err.kind().as_str(), kind, "status {status}");
        }

        let parse = webc::Error::ResponseFailedNotJson {
            content_type: "text/plain".into(),
        };
        assert!(matches!(map_webc_error(parse), LLMError::ParseError(_)));
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        assert_eq!(parse_retry_after(&HeaderValue::from_static("3")), Some(3000));
        let future = (Utc::now() + chrono::Duration::seconds(30)).to_rfc2822();
        let ms = parse_retry_after(&HeaderValue::from_str(&future).unwrap()).expect("date");
        assert!(ms > 20_000 && ms <= 30_000);
        assert_eq!(parse_retry_after(&HeaderValue::from_static("soon")), None);
    }

    #[tokio::test]
    async fn complete_returns_content_and_usage() {
        let stub = Arc::new(StubChatExecutor::new(Ok(ok_response("{\"ok\":true}"))));
        let client = GenaiLLMClient::with_executor(
            &local_config("http://localhost:1/v1"),
            reqwest::Client::new(),
            stub.clone(),
        );

        let completion = client
            .complete(request(), LlmCallContext::new(Capability::Classification))
            .await
            .expect("completion");
        assert_eq!(completion.content, "{\"ok\":true}");
        assert_eq!(completion.input_tokens, 5);
        assert_eq!(completion.output_tokens, 7);

        let recorded = stub.calls.lock().expect("calls");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn complete_surfaces_rate_limit_with_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        let stub = Arc::new(StubChatExecutor::new(Err(status_error(
            StatusCode::TOO_MANY_REQUESTS,
            headers,
        ))));
        let client = GenaiLLMClient::with_executor(
            &local_config("http://localhost:1/v1"),
            reqwest::Client::new(),
            stub,
        );

        match client
            .complete(request(), LlmCallContext::new(Capability::Classification))
            .await
        {
            Err(LLMError::RateLimited(RateLimitInfo { retry_after_ms })) => {
                assert_eq!(retry_after_ms, Some(2000))
            }
            other => panic!("expected rate limited error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_times_out() {
        let stub = Arc::new(StubChatExecutor {
            responses: Mutex::new(vec![Ok(ok_response("late"))]),
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let client = GenaiLLMClient::with_executor(
            &local_config("http://localhost:1/v1"),
            reqwest::Client::new(),
            stub,
        );

        let err = client
            .complete(request(), LlmCallContext::new(Capability::Extraction))
            .await
            .expect_err("timeout");
        assert!(matches!(err, LLMError::Timeout));
    }

    #[tokio::test]
    async fn probe_reports_auth_and_reachability() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let base = format!("{}/v1", server.uri());
        let mut cfg = local_config(&base);
        cfg.api_key = Some("secret".into());
        let ok = GenaiLLMClient::with_executor(&cfg, reqwest::Client::new(), Arc::new(StubChatExecutor::default()));
        ok.probe().await.expect("probe ok");

        cfg.api_key = Some("wrong".into());
        let denied = GenaiLLMClient::with_executor(&cfg, reqwest::Client::new(), Arc::new(StubChatExecutor::default()));
        assert!(matches!(
            denied.probe().await,
            Err(LLMError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn probe_unreachable_endpoint_is_network_error() {
        // Port 9 (discard) is closed on test hosts.
        let client = GenaiLLMClient::with_executor(
            &local_config("http://127.0.0.1:9/v1"),
            reqwest::Client::new(),
            Arc::new(StubChatExecutor::default()),
        );
        let err = client.probe().await.expect_err("unreachable");
        assert_eq!(err.kind(), crate::ai::AiErrorKind::Network);
    }
}
