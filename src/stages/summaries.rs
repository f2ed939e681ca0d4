//! Stage 4: one short natural-language summary per topic.
//!
//! Topic failures here are non-fatal: a missing summary is logged and the
//! stage succeeds with whatever completed.

use futures_util::StreamExt;
use futures_util::stream;
use tracing::{info, warn};

use crate::input::LlmStageConfig;
use crate::llm::{ChatRequest, TokenUsage, catalog::ModelRates};
use crate::taxonomy::{SortedTopic, SortedTree, TopicSummary};

use super::{StageContext, StageError, StageOutput};

async fn summarize_topic(
    topic: &SortedTopic,
    config: &LlmStageConfig,
    api_key: &str,
    rates: ModelRates,
    ctx: &StageContext<'_>,
) -> Result<(TopicSummary, TokenUsage, f64), StageError> {
    if ctx.cancelled() {
        return Err(StageError::Cancelled);
    }

    let claim_lines: String = topic
        .subtopics
        .iter()
        .flat_map(|s| s.claims.iter())
        .map(|c| format!("- {}\n", c.claim))
        .collect();
    let user_prompt = format!(
        "{}\n\nTopic: {}\nClaims:\n{claim_lines}",
        config.user_prompt, topic.topic_name
    );
    let request =
        ChatRequest::new(&config.model_name, &config.system_prompt, user_prompt, api_key);
    let response = ctx.call_model(&request, rates).await?;

    let summary = response.text.trim().to_string();
    let cost = rates.cost_of(&response.usage);
    Ok((
        TopicSummary {
            topic_name: topic.topic_name.clone(),
            summary,
        },
        response.usage,
        cost,
    ))
}

/// Run the summaries stage over the sorted tree.
pub async fn run_summaries(
    tree: &SortedTree,
    config: &LlmStageConfig,
    api_key: &str,
    ctx: &StageContext<'_>,
) -> Result<StageOutput<Vec<TopicSummary>>, StageError> {
    let rates = ctx.rates_for(&config.model_name)?;

    let concurrency = ctx.settings.max_concurrent_subtopics.max(1);
    let results: Vec<(String, Result<(TopicSummary, TokenUsage, f64), StageError>)> =
        stream::iter(tree.iter().map(|topic| async move {
            let result = summarize_topic(topic, config, api_key, rates, ctx).await;
            (topic.topic_name.clone(), result)
        }))
        .buffered(concurrency)
        .collect()
        .await;

    let mut summaries = Vec::with_capacity(results.len());
    let mut usage = TokenUsage::default();
    let mut cost = 0.0f64;
    let mut missing = 0usize;

    for (topic_name, result) in results {
        match result {
            Ok((summary, call_usage, call_cost)) => {
                usage.add(&call_usage);
                cost += call_cost;
                summaries.push(summary);
            }
            Err(StageError::Cancelled) => return Err(StageError::Cancelled),
            Err(e) => {
                missing += 1;
                // A billed call that produced no usable summary still counts.
                if let Some(spent) = e.spend() {
                    usage.add(&spent.usage);
                    cost += spent.cost;
                }
                warn!(
                    report_id = %ctx.report_id,
                    topic = %topic_name,
                    error = %e,
                    "topic summary failed; continuing without it"
                );
            }
        }
    }

    info!(
        report_id = %ctx.report_id,
        topics = tree.len(),
        summarized = summaries.len(),
        missing,
        total_tokens = usage.total_tokens,
        cost,
        "summaries completed"
    );

    Ok(StageOutput {
        data: summaries,
        usage,
        cost,
    })
}
