//! Immutable pipeline input: the comment batch and per-stage model configs.

use serde::{Deserialize, Serialize};

use crate::types::SortStrategy;

/// A single free-text comment submitted to the pipeline.
///
/// # Examples
///
/// ```rust
/// use claimweave::input::Comment;
///
/// let plain = Comment::new("c1", "Transit should run later at night");
/// let attributed = Comment::new("c2", "Agreed, buses stop too early")
///     .with_speaker("Rosa")
///     .with_interview("session-4");
/// assert_eq!(attributed.speaker.as_deref(), Some("Rosa"));
/// assert!(plain.speaker.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    /// Caller-assigned identifier, unique within the batch.
    pub id: String,
    /// Raw comment text.
    pub text: String,
    /// Attributed speaker, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    /// Source interview or session identifier, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interview: Option<String>,
}

impl Comment {
    /// Create an unattributed comment.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            speaker: None,
            interview: None,
        }
    }

    /// Attach a speaker name.
    #[must_use]
    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }

    /// Attach an interview identifier.
    #[must_use]
    pub fn with_interview(mut self, interview: impl Into<String>) -> Self {
        self.interview = Some(interview.into());
        self
    }

    /// Speaker name used for attribution, `"Unknown"` when absent.
    #[must_use]
    pub fn speaker_or_unknown(&self) -> &str {
        self.speaker.as_deref().unwrap_or("Unknown")
    }
}

/// Model selection and prompts for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmStageConfig {
    /// Provider model identifier (e.g. `"gpt-4o-mini"`). Must be present in
    /// the [`ModelCatalog`](crate::llm::ModelCatalog) or the stage fails with
    /// an unknown-model error.
    pub model_name: String,
    /// System prompt for the stage.
    pub system_prompt: String,
    /// User prompt template; stage executors append their payload to it.
    pub user_prompt: String,
}

impl LlmStageConfig {
    pub fn new(
        model_name: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
        }
    }
}

/// Per-stage LLM configuration for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfigs {
    pub clustering: LlmStageConfig,
    pub claims: LlmStageConfig,
    pub sort_and_deduplicate: LlmStageConfig,
    pub summaries: LlmStageConfig,
}

/// The immutable input to one pipeline run.
///
/// Constructed by the dispatch layer and handed to
/// [`PipelineRunner::run`](crate::runner::PipelineRunner::run) together with a
/// [`RunnerConfig`](crate::runner::RunnerConfig). Nothing in the crate mutates
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInput {
    /// The comment batch.
    pub comments: Vec<Comment>,
    /// Per-stage model configuration.
    pub configs: StageConfigs,
    /// Provider credential, passed through to the LLM client per call.
    pub api_key: String,
    /// Whether downstream crux scoring is enabled for this report. The
    /// pipeline itself does not act on it; it is carried for the consumers of
    /// the completed state.
    #[serde(default)]
    pub enable_cruxes: bool,
    /// Ordering applied in the sort/deduplicate stage.
    #[serde(default)]
    pub sort_strategy: SortStrategy,
}
