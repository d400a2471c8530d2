use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LLMClient, LLMError, LlmCallContext};

/// Scripted client for tests. Responses are served in enqueue order; an
/// empty queue yields a provider error.
#[derive(Debug, Default, Clone)]
pub struct MockLLMClient {
    responses: Arc<Mutex<VecDeque<Result<CompletionResponse, LLMError>>>>,
    requests: Arc<Mutex<Vec<(CompletionRequest, LlmCallContext)>>>,
    probe_result: Arc<Mutex<Option<LLMError>>>,
    call_count: Arc<AtomicUsize>,
    probe_count: Arc<AtomicUsize>,
}

impl MockLLMClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, response: Result<CompletionResponse, LLMError>) {
        let mut guard = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        guard.push_back(response);
    }

    /// Convenience for a successful completion carrying `content`.
    pub fn enqueue_content(&self, content: impl Into<String>) {
        self.enqueue_response(Ok(CompletionResponse {
            content: content.into(),
            model: "mock".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
        }));
    }

    /// Makes the next probes fail with `err`.
    pub fn fail_probe(&self, err: LLMError) {
        *self.probe_result.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    /// Returns the number of times `complete` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(CompletionRequest, LlmCallContext)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn clone_error(err: &LLMError) -> LLMError {
    match err {
        LLMError::Unreachable(msg) => LLMError::Unreachable(msg.clone()),
        LLMError::Timeout => LLMError::Timeout,
        LLMError::AuthenticationFailed(msg) => LLMError::AuthenticationFailed(msg.clone()),
        LLMError::RateLimited(info) => LLMError::RateLimited(*info),
        LLMError::ServerError(msg) => LLMError::ServerError(msg.clone()),
        LLMError::ParseError(msg) => LLMError::ParseError(msg.clone()),
        LLMError::InvalidRequest(msg) => LLMError::InvalidRequest(msg.clone()),
        LLMError::ProviderError(msg) => LLMError::ProviderError(msg.clone()),
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((request, context));
        let mut guard = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        guard.pop_front().unwrap_or_else(|| {
            Err(LLMError::ProviderError(
                "mock response not provided".to_string(),
            ))
        })
    }

    async fn probe(&self) -> Result<(), LLMError> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        match &*self.probe_result.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(clone_error(err)),
            None => Ok(()),
        }
    }
}
