use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::breaker::{CapabilityBreaker, CapabilityReport};
use super::classify::{Classification, Classifier};
use super::client::{GenaiLLMClient, LLMClient};
use super::extract::{Extraction, Extractor};
use super::fallback::RuleClassifier;
use super::{CompletionRequest, LLMError, LlmCallContext};
use crate::config::AiConfig;
use crate::content::ParsedEmail;
use crate::retry::RetryPolicy;
use crate::types::{AiStatus, Capability};

/// Long-lived AI configuration shared across runs. Breaker state lives in
/// [`AiRun`] so every run starts with both capabilities enabled.
pub struct AiPipeline {
    client: Option<Arc<dyn LLMClient>>,
    unavailable_reason: Option<String>,
    classifier: Classifier,
    extractor: Extractor,
    fallback: RuleClassifier,
    rate_limit: RetryPolicy,
    health_probe: bool,
    fast_trip_threshold: u32,
    server_error_threshold: u32,
}

impl AiPipeline {
    pub fn new(cfg: &AiConfig, client: Arc<dyn LLMClient>) -> Self {
        Self::build(cfg, Some(client), None)
    }

    /// Builds the genai-backed pipeline. A client that can't be constructed
    /// (e.g. OpenAI without a key) leaves the pipeline in fallback-only mode.
    pub fn from_config(cfg: &AiConfig, http: reqwest::Client) -> Self {
        match GenaiLLMClient::from_config(cfg, http) {
            Ok(client) => {
                info!(model = client.model(), base_url = %cfg.resolved_base_url(), "AI pipeline configured");
                Self::build(cfg, Some(Arc::new(client)), None)
            }
            Err(err) => {
                warn!(error = %err, "AI client unavailable; using rule-based classification only");
                Self::build(cfg, None, Some(err.to_string()))
            }
        }
    }

    fn build(cfg: &AiConfig, client: Option<Arc<dyn LLMClient>>, unavailable_reason: Option<String>) -> Self {
        Self {
            client,
            unavailable_reason,
            classifier: Classifier::from_config(cfg),
            extractor: Extractor::from_config(cfg),
            fallback: RuleClassifier,
            rate_limit: cfg.rate_limit_policy(),
            health_probe: cfg.health_probe,
            fast_trip_threshold: cfg.fast_trip_threshold,
            server_error_threshold: cfg.server_error_threshold,
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Starts per-run state for the requested capabilities, probing the
    /// endpoint first when configured to.
    pub async fn start_run(&self, classify: bool, extract: bool) -> AiRun<'_> {
        let breaker = |capability| {
            CapabilityBreaker::new(capability, self.fast_trip_threshold, self.server_error_threshold)
        };
        let mut run = AiRun {
            pipeline: self,
            classification: classify.then(|| breaker(Capability::Classification)),
            extraction: extract.then(|| breaker(Capability::Extraction)),
        };

        if !classify && !extract {
            return run;
        }

        match &self.client {
            None => {
                let reason = self
                    .unavailable_reason
                    .clone()
                    .unwrap_or_else(|| "AI client not configured".to_string());
                run.disable_all(&reason);
            }
            Some(client) if self.health_probe => match client.probe().await {
                Ok(()) => {}
                Err(err) if err.kind().is_fast_trip() => {
                    run.disable_all(&format!("health probe failed: {err}"));
                }
                Err(err) => warn!(error = %err, "AI health probe returned an error; continuing"),
            },
            Some(_) => {}
        }

        run
    }
}

/// Result of one capability for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct AiOutcome<T> {
    pub status: AiStatus,
    pub value: Option<T>,
    pub error: Option<String>,
}

impl<T> AiOutcome<T> {
    fn status(status: AiStatus) -> Self {
        Self {
            status,
            value: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiRunReport {
    pub classification: Option<CapabilityReport>,
    pub extraction: Option<CapabilityReport>,
}

impl AiRunReport {
    pub fn summary(&self) -> Vec<String> {
        [&self.classification, &self.extraction]
            .into_iter()
            .flatten()
            .map(CapabilityReport::summary)
            .collect()
    }
}

/// Breakers and counters for a single sync run.
pub struct AiRun<'a> {
    pipeline: &'a AiPipeline,
    classification: Option<CapabilityBreaker>,
    extraction: Option<CapabilityBreaker>,
}

impl AiRun<'_> {
    fn disable_all(&mut self, reason: &str) {
        for breaker in [&mut self.classification, &mut self.extraction]
            .into_iter()
            .flatten()
        {
            breaker.disable(reason);
        }
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.breaker(capability).is_some_and(CapabilityBreaker::is_enabled)
    }

    fn breaker(&self, capability: Capability) -> Option<&CapabilityBreaker> {
        match capability {
            Capability::Classification => self.classification.as_ref(),
            Capability::Extraction => self.extraction.as_ref(),
        }
    }

    fn breaker_mut(&mut self, capability: Capability) -> Option<&mut CapabilityBreaker> {
        match capability {
            Capability::Classification => self.classification.as_mut(),
            Capability::Extraction => self.extraction.as_mut(),
        }
    }

    /// Model classification when available; the value falls back to the
    /// rule-based verdict whenever the model produced none.
    pub async fn classify(&mut self, message_id: &str, email: &ParsedEmail) -> AiOutcome<Classification> {
        let pipeline = self.pipeline;
        let request = pipeline.classifier.build_request(email);
        let mut outcome = self
            .run_capability(Capability::Classification, message_id, email, request, |raw| {
                pipeline.classifier.parse_response(raw)
            })
            .await;
        if outcome.value.is_none() {
            outcome.value = Some(pipeline.fallback.classify(email));
        }
        outcome
    }

    pub async fn extract(&mut self, message_id: &str, email: &ParsedEmail) -> AiOutcome<Extraction> {
        let pipeline = self.pipeline;
        let request = pipeline.extractor.build_request(email);
        self.run_capability(Capability::Extraction, message_id, email, request, |raw| {
            pipeline.extractor.parse_response(raw)
        })
        .await
    }

    /// Rule-based verdict for messages the model is not asked about.
    pub fn fallback_classification(&self, email: &ParsedEmail) -> Classification {
        self.pipeline.fallback.classify(email)
    }

    pub fn should_skip(&self, classification: &Classification) -> bool {
        self.pipeline.classifier.should_skip(classification)
    }

    async fn run_capability<T>(
        &mut self,
        capability: Capability,
        message_id: &str,
        email: &ParsedEmail,
        request: CompletionRequest,
        parse: impl Fn(&str) -> Result<T, LLMError>,
    ) -> AiOutcome<T> {
        let Some(breaker) = self.breaker_mut(capability) else {
            return AiOutcome::status(AiStatus::NotAttempted);
        };
        if !breaker.is_enabled() {
            breaker.record_disabled_skip();
            return AiOutcome::status(AiStatus::Disabled);
        }
        if email.is_empty() {
            return AiOutcome::status(AiStatus::Skipped);
        }
        let Some(client) = self.pipeline.client.clone() else {
            return AiOutcome::status(AiStatus::Disabled);
        };

        let context = LlmCallContext::new(capability).with_message(message_id);
        let result = match self.call_with_rate_limit(client.as_ref(), request, context).await {
            Ok(raw) => parse(&raw),
            Err(err) => Err(err),
        };

        let Some(breaker) = self.breaker_mut(capability) else {
            return AiOutcome::status(AiStatus::NotAttempted);
        };
        match result {
            Ok(value) => {
                breaker.record_success();
                AiOutcome {
                    status: AiStatus::Success,
                    value: Some(value),
                    error: None,
                }
            }
            Err(err) => {
                breaker.record_failure(&err);
                AiOutcome {
                    status: AiStatus::Failed,
                    value: None,
                    error: Some(format!("{capability} {}: {err}", err.kind())),
                }
            }
        }
    }

    async fn call_with_rate_limit(
        &self,
        client: &dyn LLMClient,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<String, LLMError> {
        let policy = self.pipeline.rate_limit;
        let mut attempt = 1;
        loop {
            match client.complete(request.clone(), context.clone()).await {
                Ok(response) => return Ok(response.content),
                Err(LLMError::RateLimited(info)) if attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt, info.retry_after_ms.map(Duration::from_millis));
                    warn!(
                        capability = %context.capability,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "model endpoint rate limited; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn report(&self) -> AiRunReport {
        AiRunReport {
            classification: self.classification.as_ref().map(CapabilityBreaker::report),
            extraction: self.extraction.as_ref().map(CapabilityBreaker::report),
        }
    }
}
