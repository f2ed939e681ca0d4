//! Scripted provider for deterministic tests.
//!
//! [`MockLlm`] serves replies either from a FIFO script
//! ([`enqueue_text`](MockLlm::enqueue_text) and friends) or from a handler
//! closure inspecting each request — the right tool when a stage fans out
//! concurrently and arrival order is not deterministic.
//!
//! # Example
//!
//! ```rust
//! use claimweave::llm::{ChatRequest, LlmClient, MockLlm};
//!
//! # async fn example() {
//! let mock = MockLlm::new();
//! mock.enqueue_text("first reply");
//!
//! let request = ChatRequest::new("gpt-4o-mini", "system", "user", "key");
//! let response = mock.complete(&request).await.unwrap();
//! assert_eq!(response.text, "first reply");
//! assert_eq!(mock.call_count(), 1);
//! # }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ChatRequest, ChatResponse, LlmClient, LlmError, LlmResult, TokenUsage};

type Handler = dyn Fn(&ChatRequest) -> LlmResult<ChatResponse> + Send + Sync;

/// Usage attached to scripted replies that do not specify their own.
const DEFAULT_USAGE: TokenUsage = TokenUsage {
    input_tokens: 100,
    output_tokens: 50,
    total_tokens: 150,
};

/// A test double for [`LlmClient`].
#[derive(Default)]
pub struct MockLlm {
    script: Mutex<VecDeque<LlmResult<ChatResponse>>>,
    handler: Option<Box<Handler>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
    /// Simulated provider latency, slept before every reply.
    latency: Mutex<Option<Duration>>,
}

impl MockLlm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every request through `handler` instead of the FIFO script.
    #[must_use]
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&ChatRequest) -> LlmResult<ChatResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::default()
        }
    }

    /// Queue a plain-text reply with default usage.
    pub fn enqueue_text(&self, text: impl Into<String>) {
        self.script.lock().push_back(Ok(ChatResponse {
            text: text.into(),
            usage: DEFAULT_USAGE,
        }));
    }

    /// Queue a JSON reply with default usage.
    pub fn enqueue_json(&self, value: &serde_json::Value) {
        self.enqueue_text(value.to_string());
    }

    /// Queue a reply with explicit usage.
    pub fn enqueue_with_usage(&self, text: impl Into<String>, usage: TokenUsage) {
        self.script.lock().push_back(Ok(ChatResponse {
            text: text.into(),
            usage,
        }));
    }

    /// Queue a transport error.
    pub fn enqueue_error(&self, error: LlmError) {
        self.script.lock().push_back(Err(error));
    }

    /// Sleep this long before each reply — for exercising timeout and lock
    /// expiry paths under `tokio::time::pause`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Number of completed `complete` calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Copies of every request received, in arrival order.
    #[must_use]
    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(handler) = &self.handler {
            return handler(request);
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Other("mock script exhausted".to_string())))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
