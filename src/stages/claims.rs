//! Stage 2: extract claims per comment and slot them into the taxonomy.
//!
//! Comments fan out in batches of `WorkerSettings::batch_size`; each comment
//! task builds its own partial [`ClaimsTree`] which the batch owner merges
//! single-writer at the join. A claim naming a topic/subtopic absent from
//! the taxonomy is rejected and counted — never inserted under a fabricated
//! node. Matching is exact (casing and whitespace included).
//!
//! Individual comment failures are partial: the stage fails only when every
//! comment in a batch failed.

use futures_util::future::join_all;
use serde::Deserialize;
use tracing::{info, warn};

use crate::input::{Comment, LlmStageConfig};
use crate::llm::{ChatRequest, TokenUsage, catalog::ModelRates, extract::parse_json_object};
use crate::taxonomy::{Claim, ClaimsTree, Taxonomy, TaxonomyIndex};

use super::{StageContext, StageError, StageOutput};

#[derive(Debug, Deserialize)]
struct ClaimsEnvelope {
    #[serde(default)]
    claims: Vec<CandidateClaim>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateClaim {
    claim: String,
    #[serde(default)]
    quote: String,
    topic_name: String,
    subtopic_name: String,
}

/// Result of one comment's extraction task.
struct CommentExtraction {
    partial: ClaimsTree,
    usage: TokenUsage,
    cost: f64,
    unmatched: usize,
}

async fn extract_for_comment(
    comment: &Comment,
    taxonomy_json: &str,
    index: &TaxonomyIndex,
    config: &LlmStageConfig,
    api_key: &str,
    rates: ModelRates,
    ctx: &StageContext<'_>,
) -> Result<CommentExtraction, StageError> {
    let user_prompt = format!(
        "{}\n\nTaxonomy:\n{}\n\nComment [{}]:\n{}",
        config.user_prompt, taxonomy_json, comment.id, comment.text
    );
    let request = ChatRequest::new(&config.model_name, &config.system_prompt, user_prompt, api_key)
        .expecting_json();
    let response = ctx.call_model(&request, rates).await?;
    let call_cost = rates.cost_of(&response.usage);

    let value = parse_json_object(&response.text).ok_or_else(|| {
        StageError::parse_failed("claims response is not JSON")
            .with_spend(response.usage, call_cost)
    })?;
    let envelope: ClaimsEnvelope = serde_json::from_value(value).map_err(|e| {
        StageError::parse_failed(format!("claims shape mismatch: {e}"))
            .with_spend(response.usage, call_cost)
    })?;

    let mut partial = ClaimsTree::new();
    let mut unmatched = 0usize;
    for candidate in envelope.claims {
        if !index.contains(&candidate.topic_name, &candidate.subtopic_name) {
            unmatched += 1;
            warn!(
                report_id = %ctx.report_id,
                comment_id = %comment.id,
                topic = %candidate.topic_name,
                subtopic = %candidate.subtopic_name,
                "claim names a topic/subtopic absent from the taxonomy; rejecting"
            );
            continue;
        }
        partial.insert(Claim::new(
            candidate.claim,
            candidate.quote,
            comment.speaker_or_unknown(),
            candidate.topic_name,
            candidate.subtopic_name,
            &comment.id,
        ));
    }

    Ok(CommentExtraction {
        partial,
        usage: response.usage,
        cost: call_cost,
        unmatched,
    })
}

/// Run the claims-extraction stage over every comment.
pub async fn run_claims(
    comments: &[Comment],
    taxonomy: &Taxonomy,
    config: &LlmStageConfig,
    api_key: &str,
    ctx: &StageContext<'_>,
) -> Result<StageOutput<ClaimsTree>, StageError> {
    let rates = ctx.rates_for(&config.model_name)?;
    let index = TaxonomyIndex::build(taxonomy);
    let taxonomy_json = serde_json::to_string(taxonomy)
        .map_err(|e| StageError::validation_failed(format!("taxonomy not serializable: {e}")))?;

    let mut tree = ClaimsTree::new();
    let mut usage = TokenUsage::default();
    let mut cost = 0.0f64;
    let mut unmatched_claims = 0usize;
    let mut failed_comments = 0usize;

    for batch in comments.chunks(ctx.settings.batch_size.max(1)) {
        if ctx.cancelled() {
            return Err(StageError::Cancelled);
        }

        let tasks = batch.iter().map(|comment| {
            extract_for_comment(comment, &taxonomy_json, &index, config, api_key, rates, ctx)
        });
        let results = join_all(tasks).await;

        let mut batch_failures = 0usize;
        let mut first_error: Option<StageError> = None;
        for (comment, result) in batch.iter().zip(results) {
            match result {
                Ok(extraction) => {
                    tree.merge(extraction.partial);
                    usage.add(&extraction.usage);
                    cost += extraction.cost;
                    unmatched_claims += extraction.unmatched;
                }
                Err(StageError::Cancelled) => return Err(StageError::Cancelled),
                Err(e) => {
                    warn!(
                        report_id = %ctx.report_id,
                        comment_id = %comment.id,
                        error = %e,
                        "claim extraction failed for comment"
                    );
                    // A failed comment's call was still billed; its spend
                    // counts toward the stage totals.
                    if let Some(spent) = e.spend() {
                        usage.add(&spent.usage);
                        cost += spent.cost;
                    }
                    batch_failures += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        if !batch.is_empty() && batch_failures == batch.len() {
            // A fully failed batch means the provider is down, not that a few
            // comments were awkward; fail the stage with the first cause,
            // carrying everything the stage has spent so far.
            let err = first_error.unwrap_or(StageError::EmptyResponse { spend: None });
            let err = if usage.total_tokens > 0 || cost > 0.0 {
                err.with_spend(usage, cost)
            } else {
                err
            };
            return Err(err);
        }
        failed_comments += batch_failures;
    }

    info!(
        report_id = %ctx.report_id,
        comments = comments.len(),
        failed_comments,
        unmatched_claims,
        claims = tree.total_claims(),
        total_tokens = usage.total_tokens,
        cost,
        "claims extraction completed"
    );

    Ok(StageOutput {
        data: tree,
        usage,
        cost,
    })
}
