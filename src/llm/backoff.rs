//! Transport-level retry with exponential backoff for provider calls.
//!
//! Only transport failures (429, 5xx, connection errors) are retried;
//! whatever the model *said* is never re-asked here — semantic validation
//! belongs to the stage executors, and the runner retries nothing.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{ChatRequest, ChatResponse, LlmClient, LlmError, LlmResult};

/// Retry policy for one provider call.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Retries after the initial attempt. 0 disables retry.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Honor the provider's `Retry-After` over the computed delay.
    pub respect_retry_after: bool,
    pub retryable_statuses: Vec<u16>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            respect_retry_after: true,
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl BackoffConfig {
    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based): exponential doubling
    /// from `base_delay`, capped at `max_delay`, with up to 25% jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::rng().random_range(0.0..0.25);
        exp.mul_f64(1.0 + jitter).min(self.max_delay)
    }

    fn is_retryable(&self, error: &LlmError) -> bool {
        match error {
            LlmError::Http { status, .. } => self.retryable_statuses.contains(status),
            LlmError::Request(_) => true,
            _ => false,
        }
    }
}

/// Execute `client.complete(request)` with retry per `config`.
///
/// The cancellation flag is checked before each attempt and again after each
/// backoff sleep; an in-flight HTTP call is never interrupted.
pub async fn with_backoff(
    client: &dyn LlmClient,
    request: &ChatRequest,
    config: &BackoffConfig,
    cancel: &AtomicBool,
) -> LlmResult<ChatResponse> {
    let mut last_error: Option<LlmError> = None;

    for attempt in 0..=config.max_retries {
        if cancel.load(Ordering::Relaxed) {
            return Err(LlmError::Cancelled);
        }

        if attempt > 0 {
            let delay = match &last_error {
                Some(LlmError::Http {
                    retry_after: Some(ra),
                    ..
                }) if config.respect_retry_after => *ra,
                _ => config.delay_for_attempt(attempt - 1),
            };
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                provider = client.name(),
                "retrying provider call"
            );
            tokio::time::sleep(delay).await;
            if cancel.load(Ordering::Relaxed) {
                return Err(LlmError::Cancelled);
            }
        }

        match client.complete(request).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                if attempt < config.max_retries && config.is_retryable(&e) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| LlmError::Other("backoff loop exited unexpectedly".to_string())))
}
