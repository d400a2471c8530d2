//! Model-backed classification and extraction behind a per-run breaker.

pub mod breaker;
pub mod classify;
pub mod client;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod mock;
pub mod parse;
pub mod session;
pub mod types;

pub use breaker::{CapabilityBreaker, CapabilityReport};
pub use classify::{CLASSIFY_BODY_CHARS, Classification, ClassificationSource, Classifier};
pub use client::{ChatExecutor, GenaiLLMClient, LLMClient};
pub use error::{AiErrorKind, LLMError, RateLimitInfo};
pub use extract::{EXTRACT_BODY_CHARS, Entities, Extraction, Extractor, StructuredData};
pub use fallback::RuleClassifier;
pub use mock::MockLLMClient;
pub use session::{AiOutcome, AiPipeline, AiRun, AiRunReport};
pub use types::{ChatMessage, ChatRole, CompletionRequest, CompletionResponse, LlmCallContext};
