//! Stage 3: group near-duplicate claims and order the tree.
//!
//! Subtopics run concurrently through an *ordered* bounded stream capped at
//! `WorkerSettings::max_concurrent_subtopics`, so results join in emission
//! order and every later stable sort is deterministic. A subtopic holding a
//! single claim is emitted verbatim without a provider call.
//!
//! The model's grouping response identifies claims as either `"claimId<n>"`
//! strings or bare integers; both parse once at the boundary into an index,
//! and everything downstream works with that index alone.

use futures_util::StreamExt;
use futures_util::stream;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::input::LlmStageConfig;
use crate::llm::{ChatRequest, TokenUsage, catalog::ModelRates, extract::parse_json_object};
use crate::taxonomy::{Claim, ClaimsTree, SortedSubtopic, SortedTopic, SortedTree, TreeCounts};
use crate::types::SortStrategy;

use super::{StageContext, StageError, StageOutput};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupingEnvelope {
    #[serde(default)]
    grouped_claims: Vec<ClaimGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimGroup {
    #[serde(default)]
    original_claim_ids: Vec<Value>,
    #[serde(default)]
    claim_text: Option<String>,
}

/// Parse one claim identifier from the grouping response.
///
/// Accepts the integer `n`, the string `"claimId<n>"`, or a bare numeric
/// string; anything else, or an index outside `0..len`, is `None`.
fn parse_claim_index(raw: &Value, len: usize) -> Option<usize> {
    let index = match raw {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => {
            let digits = s.strip_prefix("claimId").unwrap_or(s).trim();
            digits.parse::<usize>().ok()
        }
        _ => None,
    }?;
    (index < len).then_some(index)
}

/// One subtopic's work unit, carried through the bounded stream.
struct SubtopicUnit {
    topic_name: String,
    subtopic_name: String,
    claims: Vec<Claim>,
}

struct SubtopicOutcome {
    topic_name: String,
    subtopic: SortedSubtopic,
    usage: TokenUsage,
    cost: f64,
    recovered: usize,
}

fn unique_speakers(claims: &[Claim]) -> Vec<String> {
    let mut seen = Vec::new();
    for claim in claims {
        if !seen.contains(&claim.speaker) {
            seen.push(claim.speaker.clone());
        }
        for dup in &claim.duplicates {
            if !seen.contains(&dup.speaker) {
                seen.push(dup.speaker.clone());
            }
        }
    }
    seen
}

fn total_claims(claims: &[Claim]) -> usize {
    claims.iter().map(|c| 1 + c.duplicates.len()).sum()
}

fn finish_subtopic(subtopic_name: String, mut claims: Vec<Claim>) -> SortedSubtopic {
    // Primaries with the most duplicates first; stable for ties.
    claims.sort_by(|a, b| b.duplicates.len().cmp(&a.duplicates.len()));
    let speakers = unique_speakers(&claims);
    let counts = TreeCounts {
        claims: total_claims(&claims),
        speakers: speakers.len(),
    };
    SortedSubtopic {
        subtopic_name,
        claims,
        speakers,
        counts,
    }
}

/// Fold the model's grouping back onto the claim list.
fn apply_grouping(
    groups: &[ClaimGroup],
    claims: &[Claim],
    ctx: &StageContext<'_>,
) -> (Vec<Claim>, usize) {
    let mut accounted = vec![false; claims.len()];
    let mut output: Vec<Claim> = Vec::with_capacity(claims.len());

    for group in groups {
        let mut indexes = Vec::with_capacity(group.original_claim_ids.len());
        for raw in &group.original_claim_ids {
            match parse_claim_index(raw, claims.len()) {
                Some(index) if !accounted[index] => {
                    accounted[index] = true;
                    indexes.push(index);
                }
                Some(index) => {
                    warn!(report_id = %ctx.report_id, index, "claim id listed in more than one group; keeping first");
                }
                None => {
                    warn!(report_id = %ctx.report_id, token = %raw, "unparseable or out-of-range claim id in grouping");
                }
            }
        }
        let Some((&primary_index, duplicate_indexes)) = indexes.split_first() else {
            continue;
        };
        let mut primary = claims[primary_index].clone();
        if let Some(text) = group.claim_text.as_deref() {
            if !text.trim().is_empty() {
                primary.claim = text.to_string();
            }
        }
        for &index in duplicate_indexes {
            let mut dup = claims[index].clone();
            dup.duplicated = true;
            primary.duplicates.push(dup);
        }
        output.push(primary);
    }

    // Claims the model never mentioned become their own single-item groups.
    let mut recovered = 0usize;
    for (index, claim) in claims.iter().enumerate() {
        if !accounted[index] {
            recovered += 1;
            output.push(claim.clone());
        }
    }
    (output, recovered)
}

async fn dedupe_subtopic(
    unit: SubtopicUnit,
    config: &LlmStageConfig,
    api_key: &str,
    rates: ModelRates,
    ctx: &StageContext<'_>,
) -> Result<SubtopicOutcome, StageError> {
    if ctx.cancelled() {
        return Err(StageError::Cancelled);
    }
    let SubtopicUnit {
        topic_name,
        subtopic_name,
        claims,
    } = unit;

    // A lone claim has nothing to deduplicate against.
    if claims.len() == 1 {
        return Ok(SubtopicOutcome {
            topic_name,
            subtopic: finish_subtopic(subtopic_name, claims),
            usage: TokenUsage::default(),
            cost: 0.0,
            recovered: 0,
        });
    }

    let claim_lines: String = claims
        .iter()
        .enumerate()
        .map(|(i, c)| format!("claimId{i}: {}\n", c.claim))
        .collect();
    let user_prompt = format!(
        "{}\n\nSubtopic: {subtopic_name}\nClaims:\n{claim_lines}",
        config.user_prompt
    );
    let request = ChatRequest::new(&config.model_name, &config.system_prompt, user_prompt, api_key)
        .expecting_json();
    let response = ctx.call_model(&request, rates).await?;
    let call_cost = rates.cost_of(&response.usage);

    let value = parse_json_object(&response.text).ok_or_else(|| {
        StageError::parse_failed("grouping response is not JSON")
            .with_spend(response.usage, call_cost)
    })?;
    let envelope: GroupingEnvelope = serde_json::from_value(value).map_err(|e| {
        StageError::parse_failed(format!("grouping shape mismatch: {e}"))
            .with_spend(response.usage, call_cost)
    })?;

    let (grouped, recovered) = apply_grouping(&envelope.grouped_claims, &claims, ctx);
    if recovered > 0 {
        warn!(
            report_id = %ctx.report_id,
            subtopic = %subtopic_name,
            recovered,
            "model grouping missed claims; appended as single-item groups"
        );
    }

    Ok(SubtopicOutcome {
        topic_name,
        subtopic: finish_subtopic(subtopic_name, grouped),
        usage: response.usage,
        cost: call_cost,
        recovered,
    })
}

fn strategy_key(counts: &TreeCounts, strategy: SortStrategy) -> usize {
    match strategy {
        SortStrategy::NumPeople => counts.speakers,
        SortStrategy::NumClaims => counts.claims,
    }
}

/// Order subtopics within each topic and topics within the tree, descending
/// by the strategy's count. Sorts are stable, so ties keep emission order.
pub fn order_tree(tree: &mut SortedTree, strategy: SortStrategy) {
    for topic in tree.iter_mut() {
        topic
            .subtopics
            .sort_by(|a, b| strategy_key(&b.counts, strategy).cmp(&strategy_key(&a.counts, strategy)));
    }
    tree.sort_by(|a, b| strategy_key(&b.counts, strategy).cmp(&strategy_key(&a.counts, strategy)));
}

/// Run the sort/deduplicate stage over the claims tree.
pub async fn run_dedupe(
    tree: &ClaimsTree,
    strategy: SortStrategy,
    config: &LlmStageConfig,
    api_key: &str,
    ctx: &StageContext<'_>,
) -> Result<StageOutput<SortedTree>, StageError> {
    let rates = ctx.rates_for(&config.model_name)?;

    // Canonical emission order: alphabetical by topic then subtopic. The
    // claims tree is a map, so this pins tie-break order across runs.
    let mut topic_names: Vec<&String> = tree.topics.keys().collect();
    topic_names.sort();
    let mut units: Vec<SubtopicUnit> = Vec::new();
    for topic_name in topic_names {
        let topic = &tree.topics[topic_name];
        let mut subtopic_names: Vec<&String> = topic.subtopics.keys().collect();
        subtopic_names.sort();
        for subtopic_name in subtopic_names {
            let claims = &topic.subtopics[subtopic_name].claims;
            if claims.is_empty() {
                continue;
            }
            units.push(SubtopicUnit {
                topic_name: topic_name.clone(),
                subtopic_name: subtopic_name.clone(),
                claims: claims.clone(),
            });
        }
    }

    let concurrency = ctx.settings.max_concurrent_subtopics.max(1);
    let outcomes: Vec<(String, String, Result<SubtopicOutcome, StageError>)> =
        stream::iter(units.into_iter().map(|unit| {
            let names = (unit.topic_name.clone(), unit.subtopic_name.clone());
            async move {
                let result = dedupe_subtopic(unit, config, api_key, rates, ctx).await;
                (names.0, names.1, result)
            }
        }))
        .buffered(concurrency)
        .collect()
        .await;

    let mut usage = TokenUsage::default();
    let mut cost = 0.0f64;
    let mut recovered_total = 0usize;
    let mut by_topic: FxHashMap<String, Vec<SortedSubtopic>> = FxHashMap::default();
    let mut topic_order: Vec<String> = Vec::new();

    for (topic_name, subtopic_name, result) in outcomes {
        match result {
            Ok(outcome) => {
                usage.add(&outcome.usage);
                cost += outcome.cost;
                recovered_total += outcome.recovered;
                if !by_topic.contains_key(&outcome.topic_name) {
                    topic_order.push(outcome.topic_name.clone());
                }
                by_topic
                    .entry(outcome.topic_name)
                    .or_default()
                    .push(outcome.subtopic);
            }
            Err(StageError::Cancelled) => return Err(StageError::Cancelled),
            Err(e) => {
                // Dropping the subtopic does not refund its billed call.
                if let Some(spent) = e.spend() {
                    usage.add(&spent.usage);
                    cost += spent.cost;
                }
                warn!(
                    report_id = %ctx.report_id,
                    topic = %topic_name,
                    subtopic = %subtopic_name,
                    error = %e,
                    "subtopic deduplication failed; dropping subtopic"
                );
            }
        }
    }

    let mut sorted: SortedTree = Vec::new();
    for topic_name in topic_order {
        let Some(subtopics) = by_topic.remove(&topic_name) else {
            continue;
        };
        if subtopics.is_empty() {
            warn!(report_id = %ctx.report_id, topic = %topic_name, "topic lost all subtopics; dropping topic");
            continue;
        }
        let speakers = {
            let mut seen: Vec<String> = Vec::new();
            for subtopic in &subtopics {
                for speaker in &subtopic.speakers {
                    if !seen.contains(speaker) {
                        seen.push(speaker.clone());
                    }
                }
            }
            seen
        };
        let counts = TreeCounts {
            claims: subtopics.iter().map(|s| s.counts.claims).sum(),
            speakers: speakers.len(),
        };
        sorted.push(SortedTopic {
            topic_name,
            subtopics,
            speakers,
            counts,
        });
    }

    if sorted.is_empty() {
        let err = StageError::validation_failed("deduplication produced no topics");
        let err = if usage.total_tokens > 0 || cost > 0.0 {
            err.with_spend(usage, cost)
        } else {
            err
        };
        return Err(err);
    }
    order_tree(&mut sorted, strategy);

    info!(
        report_id = %ctx.report_id,
        topics = sorted.len(),
        recovered_claims = recovered_total,
        total_tokens = usage.total_tokens,
        cost,
        "sort and deduplicate completed"
    );

    Ok(StageOutput {
        data: sorted,
        usage,
        cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claim_index_accepts_both_wire_forms() {
        assert_eq!(parse_claim_index(&json!(2), 5), Some(2));
        assert_eq!(parse_claim_index(&json!("claimId3"), 5), Some(3));
        assert_eq!(parse_claim_index(&json!("4"), 5), Some(4));
    }

    #[test]
    fn claim_index_rejects_out_of_range_and_garbage() {
        assert_eq!(parse_claim_index(&json!(5), 5), None);
        assert_eq!(parse_claim_index(&json!("claimId99"), 5), None);
        assert_eq!(parse_claim_index(&json!("claimIdx"), 5), None);
        assert_eq!(parse_claim_index(&json!(-1), 5), None);
        assert_eq!(parse_claim_index(&json!(null), 5), None);
        assert_eq!(parse_claim_index(&json!([0]), 5), None);
    }

    #[test]
    fn order_tree_sorts_descending_and_stable() {
        fn subtopic(name: &str, claims: usize, speakers: usize) -> SortedSubtopic {
            SortedSubtopic {
                subtopic_name: name.into(),
                claims: vec![],
                speakers: vec![],
                counts: TreeCounts { claims, speakers },
            }
        }
        let mut tree = vec![
            SortedTopic {
                topic_name: "A".into(),
                subtopics: vec![subtopic("a1", 1, 1), subtopic("a2", 5, 2)],
                speakers: vec![],
                counts: TreeCounts {
                    claims: 6,
                    speakers: 2,
                },
            },
            SortedTopic {
                topic_name: "B".into(),
                subtopics: vec![],
                speakers: vec![],
                counts: TreeCounts {
                    claims: 9,
                    speakers: 2,
                },
            },
        ];
        order_tree(&mut tree, SortStrategy::NumClaims);
        assert_eq!(tree[0].topic_name, "B");
        assert_eq!(tree[1].subtopics[0].subtopic_name, "a2");

        // Equal speaker counts: NumPeople keeps emission order (A before B).
        let mut tied = tree.clone();
        tied.swap(0, 1);
        order_tree(&mut tied, SortStrategy::NumPeople);
        assert_eq!(tied[0].topic_name, "A");
    }
}
