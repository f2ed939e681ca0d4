//! Provider contract and supporting pieces for the pipeline's LLM calls.
//!
//! The pipeline treats the provider as an oracle behind the [`LlmClient`]
//! trait: `complete(request) → text + token usage`. Everything else in this
//! module supports that call site:
//!
//! * [`catalog`] — per-model cost table; unknown models are an error, never
//!   a silent zero cost.
//! * [`extract`] — defensive extraction of JSON from chatty model output.
//! * [`backoff`] — transport-level retry with exponential backoff.
//! * [`mock`] — a scripted client for deterministic tests.
//! * [`openai`] — an OpenAI-compatible HTTP client (feature `openai`).

pub mod backoff;
pub mod catalog;
pub mod extract;
pub mod mock;
#[cfg(feature = "openai")]
pub mod openai;

pub use backoff::{BackoffConfig, with_backoff};
pub use catalog::ModelCatalog;
pub use mock::MockLlm;
#[cfg(feature = "openai")]
pub use openai::OpenAiClient;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Token accounting for one or more provider calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Fold another call's usage into this accumulator.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A normalized chat-completion request, provider-agnostic.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider model identifier.
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Ask the provider for a strict JSON object response.
    pub json_response: bool,
    /// Per-call provider credential, supplied by the pipeline input.
    pub api_key: String,
}

impl ChatRequest {
    pub fn new(
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            json_response: false,
            api_key: api_key.into(),
        }
    }

    #[must_use]
    pub fn expecting_json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

/// A normalized provider response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Raw generated text (may still carry fences or chatter; see
    /// [`extract`]).
    pub text: String,
    pub usage: TokenUsage,
}

/// Transport-level provider errors.
///
/// These describe what went wrong *talking to* the provider; what the model
/// said is judged by the stage executors.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum LlmError {
    /// Non-success HTTP status from the provider.
    #[error("provider returned HTTP {status}: {body}")]
    #[diagnostic(code(claimweave::llm::http))]
    Http {
        status: u16,
        body: String,
        /// Parsed `Retry-After`, when the provider sent one.
        retry_after: Option<Duration>,
    },

    /// Connection/transport failure before any HTTP status.
    #[error("provider request failed: {0}")]
    #[diagnostic(
        code(claimweave::llm::request),
        help("Check network reachability and the provider base URL.")
    )]
    Request(String),

    /// The caller's cancellation signal fired.
    #[error("provider call cancelled")]
    #[diagnostic(code(claimweave::llm::cancelled))]
    Cancelled,

    /// Anything else (malformed provider payload, exhausted mock script, …).
    #[error("provider error: {0}")]
    #[diagnostic(code(claimweave::llm::other))]
    Other(String),
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Abstraction over LLM providers.
///
/// Object-safe; the runner holds an `Arc<dyn LlmClient>`. Implementations
/// must be safe to call concurrently — the claims and deduplication stages
/// fan out over one shared client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Execute one chat completion.
    async fn complete(&self, request: &ChatRequest) -> LlmResult<ChatResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}
