//! Stage 1: derive the topic/subtopic taxonomy from the raw comments.

use serde::Deserialize;
use tracing::{info, warn};

use crate::input::{Comment, LlmStageConfig};
use crate::llm::{ChatRequest, extract::parse_json_object};
use crate::taxonomy::Taxonomy;

use super::sanitize::sanitize_comments;
use super::{StageContext, StageError, StageOutput};

/// Hard cap on the concatenated comment prompt, in characters.
pub const PROMPT_CHAR_CAP: usize = 100_000;

#[derive(Debug, Deserialize)]
struct TaxonomyEnvelope {
    taxonomy: Taxonomy,
}

/// Render the surviving comments into one prompt block, stopping before the
/// cap. Returns the block and how many comments did not fit.
fn build_comment_block(comments: &[Comment]) -> (String, usize) {
    let mut block = String::new();
    let mut omitted = 0usize;
    for comment in comments {
        let line = match &comment.speaker {
            Some(speaker) => format!("[{}] {} ({})\n", comment.id, comment.text, speaker),
            None => format!("[{}] {}\n", comment.id, comment.text),
        };
        if block.len() + line.len() > PROMPT_CHAR_CAP {
            omitted += 1;
            continue;
        }
        block.push_str(&line);
    }
    (block, omitted)
}

/// Run the clustering stage.
///
/// Comments pass through sanitization first; filtered comments are counted
/// and logged but never fail the stage. The provider is called once in
/// strict-JSON mode and must answer `{"taxonomy": [...]}`.
pub async fn run_clustering(
    comments: &[Comment],
    config: &LlmStageConfig,
    api_key: &str,
    ctx: &StageContext<'_>,
) -> Result<StageOutput<Taxonomy>, StageError> {
    let rates = ctx.rates_for(&config.model_name)?;

    let (kept, filter_report) = sanitize_comments(comments);
    info!(
        report_id = %ctx.report_id,
        incoming = comments.len(),
        kept = kept.len(),
        dropped_short = filter_report.dropped_short,
        truncated = filter_report.truncated,
        rejected_injection = filter_report.rejected_injection,
        unsafe_fraction = filter_report.unsafe_fraction(comments.len()),
        "sanitized comment batch"
    );
    if kept.is_empty() {
        return Err(StageError::validation_failed(
            "no meaningful comments survived sanitization",
        ));
    }

    let (comment_block, omitted) = build_comment_block(&kept);
    if omitted > 0 {
        warn!(
            report_id = %ctx.report_id,
            omitted,
            cap = PROMPT_CHAR_CAP,
            "comment block hit the prompt cap; omitting overflow comments"
        );
    }

    let user_prompt = format!("{}\n\nComments:\n{}", config.user_prompt, comment_block);
    let request = ChatRequest::new(&config.model_name, &config.system_prompt, user_prompt, api_key)
        .expecting_json();
    let response = ctx.call_model(&request, rates).await?;
    // The call is billed from here on: every rejection carries its spend.
    let cost = rates.cost_of(&response.usage);

    let value = parse_json_object(&response.text).ok_or_else(|| {
        StageError::parse_failed("clustering response is not JSON").with_spend(response.usage, cost)
    })?;
    let envelope: TaxonomyEnvelope = serde_json::from_value(value).map_err(|e| {
        StageError::parse_failed(format!("taxonomy shape mismatch: {e}"))
            .with_spend(response.usage, cost)
    })?;

    if envelope.taxonomy.is_empty() {
        return Err(StageError::validation_failed("model returned an empty taxonomy")
            .with_spend(response.usage, cost));
    }
    for topic in &envelope.taxonomy {
        if topic.subtopics.is_empty() {
            return Err(StageError::validation_failed(format!(
                "topic '{}' has no subtopics",
                topic.topic_name
            ))
            .with_spend(response.usage, cost));
        }
    }

    info!(
        report_id = %ctx.report_id,
        topics = envelope.taxonomy.len(),
        total_tokens = response.usage.total_tokens,
        cost,
        "clustering completed"
    );

    Ok(StageOutput {
        data: envelope.taxonomy,
        usage: response.usage,
        cost,
    })
}
