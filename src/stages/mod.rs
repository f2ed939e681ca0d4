//! The four stage executors and their shared contract.
//!
//! Every stage is a self-contained async function with the same shape:
//! take the previous stages' validated output, this stage's
//! [`LlmStageConfig`](crate::input::LlmStageConfig), the provider
//! credential, and a [`StageContext`]; return
//! `Result<StageOutput<T>, StageError>`.
//!
//! A stage either completes fully or is re-executed from its start on the
//! next run — there is no partial resumption inside a stage.

pub mod claims;
pub mod clustering;
pub mod dedupe;
pub mod sanitize;
pub mod summaries;

pub use claims::run_claims;
pub use clustering::run_clustering;
pub use dedupe::run_dedupe;
pub use summaries::run_summaries;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::llm::{
    BackoffConfig, ChatRequest, ChatResponse, LlmClient, LlmError, ModelCatalog, TokenUsage,
    catalog::ModelRates, with_backoff,
};
use crate::settings::WorkerSettings;
use crate::state::{ErrorKind, PipelineErrorInfo};
use crate::types::StageKind;

/// A completed stage's payload with its token/cost accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutput<T> {
    pub data: T,
    pub usage: TokenUsage,
    pub cost: f64,
}

/// Tokens and dollars already spent when a stage failed.
///
/// A provider call can succeed (and be billed) before the stage rejects its
/// response; the spend rides the error so failed analytics still account
/// for it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageSpend {
    pub usage: TokenUsage,
    pub cost: f64,
}

/// Why a stage failed. One `match` point at every stage boundary — the
/// runner folds this into the persisted analytic and run error.
///
/// Variants reachable after a successful (billable) provider call carry the
/// [`StageSpend`] incurred up to the failure, so a failed stage's tokens
/// and cost are never silently dropped from the run aggregates.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum StageError {
    /// The provider call itself failed (transport, HTTP error, retries
    /// exhausted). Carries spend when earlier calls in the same stage had
    /// already been billed.
    #[error("provider call failed: {message}")]
    #[diagnostic(code(claimweave::stage::api_call_failed))]
    ApiCallFailed {
        message: String,
        spend: Option<StageSpend>,
    },

    /// The provider answered with empty text (the call was still billed).
    #[error("provider returned an empty response")]
    #[diagnostic(code(claimweave::stage::empty_response))]
    EmptyResponse { spend: Option<StageSpend> },

    /// The response text did not parse into the stage's expected shape.
    #[error("failed to parse provider response: {message}")]
    #[diagnostic(code(claimweave::stage::parse_failed))]
    ParseFailed {
        message: String,
        spend: Option<StageSpend>,
    },

    /// The stage's model is missing from the cost catalog. Raised before
    /// any call is made.
    #[error("unknown model: {model}")]
    #[diagnostic(
        code(claimweave::stage::unknown_model),
        help("Add the model and its per-1K-token rates to the ModelCatalog.")
    )]
    UnknownModel { model: String },

    /// The parsed output violated a stage invariant.
    #[error("stage output validation failed: {message}")]
    #[diagnostic(code(claimweave::stage::validation_failed))]
    ValidationFailed {
        message: String,
        spend: Option<StageSpend>,
    },

    /// The caller's cancellation signal fired. Checked before dispatch,
    /// never after a call.
    #[error("stage cancelled")]
    #[diagnostic(code(claimweave::stage::cancelled))]
    Cancelled,
}

impl StageError {
    pub fn parse_failed(message: impl Into<String>) -> Self {
        StageError::ParseFailed {
            message: message.into(),
            spend: None,
        }
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        StageError::ValidationFailed {
            message: message.into(),
            spend: None,
        }
    }

    /// Attach (or replace with) the spend incurred before this failure.
    /// No-op on variants raised before any billable call.
    #[must_use]
    pub fn with_spend(mut self, usage: TokenUsage, cost: f64) -> Self {
        let incurred = Some(StageSpend { usage, cost });
        match &mut self {
            StageError::ApiCallFailed { spend, .. }
            | StageError::EmptyResponse { spend }
            | StageError::ParseFailed { spend, .. }
            | StageError::ValidationFailed { spend, .. } => *spend = incurred,
            StageError::UnknownModel { .. } | StageError::Cancelled => {}
        }
        self
    }

    /// The spend incurred before this failure, when any call was billed.
    #[must_use]
    pub fn spend(&self) -> Option<StageSpend> {
        match self {
            StageError::ApiCallFailed { spend, .. }
            | StageError::EmptyResponse { spend }
            | StageError::ParseFailed { spend, .. }
            | StageError::ValidationFailed { spend, .. } => *spend,
            StageError::UnknownModel { .. } | StageError::Cancelled => None,
        }
    }

    /// The serializable kind recorded into analytics and the run error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::ApiCallFailed { .. } => ErrorKind::ApiCallFailed,
            StageError::EmptyResponse { .. } => ErrorKind::EmptyResponse,
            StageError::ParseFailed { .. } => ErrorKind::ParseFailed,
            StageError::UnknownModel { .. } => ErrorKind::UnknownModel,
            StageError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The persisted `{step, message, kind}` payload for this error.
    #[must_use]
    pub fn to_error_info(&self, stage: StageKind) -> PipelineErrorInfo {
        PipelineErrorInfo::new(stage.as_str(), self.to_string(), self.kind())
    }
}

impl From<LlmError> for StageError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => StageError::Cancelled,
            other => StageError::ApiCallFailed {
                message: other.to_string(),
                spend: None,
            },
        }
    }
}

/// Execution context threaded through every stage.
///
/// Carries the report identity for structured logging and the explicit
/// dependencies stages need — provider client, cost catalog, retry policy,
/// worker settings, cancellation flag. Nothing in the crate reaches for a
/// module-level singleton.
pub struct StageContext<'a> {
    pub report_id: &'a str,
    pub user_id: &'a str,
    pub llm: &'a dyn LlmClient,
    pub catalog: &'a ModelCatalog,
    pub backoff: &'a BackoffConfig,
    pub settings: &'a WorkerSettings,
    pub cancel: &'a AtomicBool,
}

impl StageContext<'_> {
    /// Whether the caller has asked the run to stop. Checked between stages
    /// and before each intra-stage dispatch — never inside an in-flight
    /// provider call.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Resolve the stage model's rates up front so cost accounting cannot
    /// silently price calls at zero.
    pub fn rates_for(&self, model: &str) -> Result<ModelRates, StageError> {
        self.catalog
            .rates(model)
            .ok_or_else(|| StageError::UnknownModel {
                model: model.to_string(),
            })
    }

    /// One provider round-trip with retry, cancellation, and the
    /// empty-response check applied. `rates` prices the call so an empty
    /// (but billed) response still reports what it cost.
    pub async fn call_model(
        &self,
        request: &ChatRequest,
        rates: ModelRates,
    ) -> Result<ChatResponse, StageError> {
        if self.cancelled() {
            return Err(StageError::Cancelled);
        }
        let response = with_backoff(self.llm, request, self.backoff, self.cancel).await?;
        if response.text.trim().is_empty() {
            return Err(StageError::EmptyResponse {
                spend: Some(StageSpend {
                    usage: response.usage,
                    cost: rates.cost_of(&response.usage),
                }),
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_kinds_map_one_to_one() {
        assert_eq!(
            StageError::ApiCallFailed {
                message: "x".into(),
                spend: None,
            }
            .kind(),
            ErrorKind::ApiCallFailed
        );
        assert_eq!(
            StageError::EmptyResponse { spend: None }.kind(),
            ErrorKind::EmptyResponse
        );
        assert_eq!(
            StageError::parse_failed("x").kind(),
            ErrorKind::ParseFailed
        );
        assert_eq!(
            StageError::UnknownModel { model: "m".into() }.kind(),
            ErrorKind::UnknownModel
        );
        assert_eq!(
            StageError::validation_failed("x").kind(),
            ErrorKind::ValidationFailed
        );
        assert_eq!(StageError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn with_spend_attaches_where_a_call_was_billed() {
        let usage = TokenUsage::new(70, 30);
        let err = StageError::parse_failed("bad json").with_spend(usage, 0.02);
        let spend = err.spend().unwrap();
        assert_eq!(spend.usage.total_tokens, 100);
        assert!((spend.cost - 0.02).abs() < f64::EPSILON);

        // Pre-call variants never carry spend.
        let err = StageError::UnknownModel { model: "m".into() }.with_spend(usage, 0.02);
        assert_eq!(err.spend(), None);
        assert_eq!(StageError::Cancelled.with_spend(usage, 0.02).spend(), None);
    }

    #[test]
    fn llm_cancellation_stays_cancelled() {
        assert!(matches!(
            StageError::from(LlmError::Cancelled),
            StageError::Cancelled
        ));
        assert!(matches!(
            StageError::from(LlmError::Request("refused".into())),
            StageError::ApiCallFailed { .. }
        ));
    }

    #[test]
    fn error_info_carries_stage_name() {
        let info = StageError::EmptyResponse { spend: None }.to_error_info(StageKind::Claims);
        assert_eq!(info.step, "claims");
        assert_eq!(info.kind, ErrorKind::EmptyResponse);
    }
}
