//! Builders for inputs, stores, and scripted providers.
//!
//! Stage configs carry distinct system prompts so a handler-mode
//! [`MockLlm`] can tell which stage is calling even when requests arrive
//! concurrently and out of order.

use std::sync::Arc;

use serde_json::{Value, json};

use std::sync::atomic::AtomicBool;

use claimweave::cache::{Cache, InMemoryCache};
use claimweave::input::{Comment, LlmStageConfig, PipelineInput, StageConfigs};
use claimweave::llm::{
    BackoffConfig, ChatRequest, ChatResponse, LlmResult, MockLlm, ModelCatalog, TokenUsage,
};
use claimweave::settings::WorkerSettings;
use claimweave::stages::StageContext;
use claimweave::store::{PipelineStateStore, StateRetention};

pub const CLUSTERING_SYSTEM: &str = "clustering system prompt";
pub const CLAIMS_SYSTEM: &str = "claims system prompt";
pub const DEDUPE_SYSTEM: &str = "dedupe system prompt";
pub const SUMMARIES_SYSTEM: &str = "summaries system prompt";

/// The stage a request belongs to, recovered from its system prompt.
pub fn stage_of(request: &ChatRequest) -> &'static str {
    match request.system_prompt.as_str() {
        CLUSTERING_SYSTEM => "clustering",
        CLAIMS_SYSTEM => "claims",
        DEDUPE_SYSTEM => "dedupe",
        SUMMARIES_SYSTEM => "summaries",
        other => panic!("request from unknown stage: {other}"),
    }
}

pub fn stage_configs() -> StageConfigs {
    StageConfigs {
        clustering: LlmStageConfig::new("gpt-4o-mini", CLUSTERING_SYSTEM, "Cluster the comments."),
        claims: LlmStageConfig::new("gpt-4o-mini", CLAIMS_SYSTEM, "Extract claims."),
        sort_and_deduplicate: LlmStageConfig::new(
            "gpt-4o-mini",
            DEDUPE_SYSTEM,
            "Group duplicate claims.",
        ),
        summaries: LlmStageConfig::new("gpt-4o-mini", SUMMARIES_SYSTEM, "Summarize the topic."),
    }
}

pub fn pipeline_input(comments: Vec<Comment>) -> PipelineInput {
    PipelineInput {
        comments,
        configs: stage_configs(),
        api_key: "sk-test".to_string(),
        enable_cruxes: false,
        sort_strategy: Default::default(),
    }
}

/// Two attributable comments about a single theme.
pub fn two_ai_comments() -> Vec<Comment> {
    vec![
        Comment::new("c1", "AI is transformative").with_speaker("Alice"),
        Comment::new("c2", "AI will reshape work").with_speaker("Bob"),
    ]
}

pub fn store_on(cache: Arc<dyn Cache>, settings: &WorkerSettings) -> PipelineStateStore {
    PipelineStateStore::new(
        cache,
        StateRetention(settings.state_retention),
        settings.lock_ttl,
    )
}

pub fn memory_store(settings: &WorkerSettings) -> (Arc<InMemoryCache>, PipelineStateStore) {
    let cache = Arc::new(InMemoryCache::new());
    let store = store_on(cache.clone(), settings);
    (cache, store)
}

/// `{"taxonomy": [Technology > AI]}` — the single-topic taxonomy used by
/// the happy-path scenarios.
pub fn tech_taxonomy_json() -> Value {
    json!({
        "taxonomy": [{
            "topicName": "Technology",
            "topicShortDescription": "Technology and its effects",
            "subtopics": [{
                "subtopicName": "AI",
                "subtopicShortDescription": "Artificial intelligence",
                "claims": []
            }]
        }]
    })
}

/// One claim mapping to `(Technology, AI)` for the given comment text.
pub fn tech_claim_json(claim: &str, quote: &str) -> Value {
    json!({
        "claims": [{
            "claim": claim,
            "quote": quote,
            "topicName": "Technology",
            "subtopicName": "AI"
        }]
    })
}

/// A grouping that nests claim 1 under claim 0.
pub fn nest_second_under_first_json() -> Value {
    json!({
        "groupedClaims": [{
            "originalClaimIds": ["claimId0", "claimId1"],
            "claimText": null
        }]
    })
}

/// Owns everything a [`StageContext`] borrows, so stage executors can run
/// outside the full runner.
pub struct StageHarness {
    pub llm: MockLlm,
    pub catalog: ModelCatalog,
    pub backoff: BackoffConfig,
    pub settings: WorkerSettings,
    pub cancel: AtomicBool,
}

impl StageHarness {
    pub fn new(llm: MockLlm) -> Self {
        Self {
            llm,
            catalog: ModelCatalog::builtin(),
            backoff: BackoffConfig::none(),
            settings: WorkerSettings::default(),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn ctx(&self) -> StageContext<'_> {
        StageContext {
            report_id: "report-test",
            user_id: "user-test",
            llm: &self.llm,
            catalog: &self.catalog,
            backoff: &self.backoff,
            settings: &self.settings,
            cancel: &self.cancel,
        }
    }
}

fn ok_text(text: impl Into<String>) -> LlmResult<ChatResponse> {
    Ok(ChatResponse {
        text: text.into(),
        usage: TokenUsage::new(100, 50),
    })
}

/// A provider scripted for the full happy path over [`two_ai_comments`]:
/// one topic, both claims mapping to it, the second claim folded under the
/// first, one summary per topic.
pub fn happy_path_llm() -> MockLlm {
    MockLlm::with_handler(|request| match stage_of(request) {
        "clustering" => ok_text(tech_taxonomy_json().to_string()),
        "claims" => {
            if request.user_prompt.contains("Comment [c1]") {
                ok_text(tech_claim_json("AI is transformative", "AI is transformative").to_string())
            } else {
                ok_text(tech_claim_json("AI will reshape work", "AI will reshape work").to_string())
            }
        }
        "dedupe" => ok_text(nest_second_under_first_json().to_string()),
        "summaries" => ok_text("People see AI as a transformative force."),
        _ => unreachable!(),
    })
}
