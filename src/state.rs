/*!
The pipeline checkpoint object and its persisted JSON contract.

Design goals:
- Explicit serde-friendly shapes, camelCase keys, millisecond ISO-8601
  timestamps — the wire contract consumed by other workers and the
  reporting surface.
- All aggregate bookkeeping (tokens/cost/duration) funnels through
  [`PipelineState::recompute_aggregates`], so the invariant
  `totals == Σ analytics over completed|failed stages` holds at every
  save point.
- `completedResults` carries a stage's key iff that stage's analytic is
  `completed`; both transitions happen inside one method per outcome.

This module performs no I/O. Persistence lives in [`crate::store`].
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;
use crate::stages::StageOutput;
use crate::taxonomy::{ClaimsTree, SortedTree, Taxonomy, TopicSummary};
use crate::types::StageKind;

/// Version stamped into every persisted state. Bump on any change to the
/// serialized shape.
pub const SCHEMA_VERSION: u32 = 1;

/// Millisecond-precision ISO-8601 codec (`2024-01-02T03:04:05.678Z`).
///
/// `chrono`'s default RFC 3339 output varies its sub-second precision; the
/// KV contract pins exactly three fractional digits.
pub mod ts_ms {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

/// [`ts_ms`] for optional timestamps (serialized as `null` when absent).
pub mod ts_ms_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        dt: &Option<DateTime<Utc>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => ser.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(D::Error::custom)
        })
        .transpose()
    }
}

/// Lifecycle of the whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Clustering,
    ExtractingClaims,
    Sorting,
    Summarizing,
    Completed,
    Failed,
}

impl PipelineStatus {
    /// The in-flight status corresponding to a running stage.
    #[must_use]
    pub fn running(stage: StageKind) -> Self {
        match stage {
            StageKind::Clustering => PipelineStatus::Clustering,
            StageKind::Claims => PipelineStatus::ExtractingClaims,
            StageKind::SortAndDeduplicate => PipelineStatus::Sorting,
            StageKind::Summaries => PipelineStatus::Summarizing,
        }
    }
}

/// Lifecycle of one stage: `pending → running → (completed | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Serializable error kind recorded on failed states and analytics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ApiCallFailed,
    EmptyResponse,
    ParseFailed,
    UnknownModel,
    ValidationFailed,
    Cancelled,
    PermanentlyCorrupted,
}

/// Current time truncated to millisecond precision, matching what the wire
/// codec can represent so loaded states compare equal to saved ones.
fn now_ms() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// The error payload persisted on a failed state (`{step, message, kind}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineErrorInfo {
    /// Stage name, or `"state"` for corruption detected outside any stage.
    pub step: String,
    pub message: String,
    pub kind: ErrorKind,
}

impl PipelineErrorInfo {
    pub fn new(step: impl Into<String>, message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
            kind,
        }
    }
}

/// Per-stage execution record: status, timing, token/cost accounting, and
/// the error when the stage failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAnalytics {
    pub status: StageStatus,
    #[serde(default, with = "ts_ms_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_ms_opt")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    #[serde(default)]
    pub error: Option<PipelineErrorInfo>,
}

impl StageAnalytics {
    fn record_usage(&mut self, usage: &TokenUsage, cost: f64) {
        self.input_tokens = usage.input_tokens;
        self.output_tokens = usage.output_tokens;
        self.total_tokens = usage.total_tokens;
        self.cost = cost;
    }
}

/// Analytics for all four stages, keyed by stable stage names on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepAnalytics {
    #[serde(rename = "clustering")]
    pub clustering: StageAnalytics,
    #[serde(rename = "claims")]
    pub claims: StageAnalytics,
    #[serde(rename = "sort_and_deduplicate")]
    pub sort_and_deduplicate: StageAnalytics,
    #[serde(rename = "summaries")]
    pub summaries: StageAnalytics,
}

impl StepAnalytics {
    #[must_use]
    pub fn get(&self, stage: StageKind) -> &StageAnalytics {
        match stage {
            StageKind::Clustering => &self.clustering,
            StageKind::Claims => &self.claims,
            StageKind::SortAndDeduplicate => &self.sort_and_deduplicate,
            StageKind::Summaries => &self.summaries,
        }
    }

    pub fn get_mut(&mut self, stage: StageKind) -> &mut StageAnalytics {
        match stage {
            StageKind::Clustering => &mut self.clustering,
            StageKind::Claims => &mut self.claims,
            StageKind::SortAndDeduplicate => &mut self.sort_and_deduplicate,
            StageKind::Summaries => &mut self.summaries,
        }
    }

    /// Analytics over all stages in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (StageKind, &StageAnalytics)> {
        StageKind::ALL.into_iter().map(move |s| (s, self.get(s)))
    }
}

/// Validated stage outputs, present iff the stage completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletedResults {
    #[serde(
        rename = "clustering",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub clustering: Option<StageOutput<Taxonomy>>,
    #[serde(rename = "claims", default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<StageOutput<ClaimsTree>>,
    #[serde(
        rename = "sort_and_deduplicate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sort_and_deduplicate: Option<StageOutput<SortedTree>>,
    #[serde(
        rename = "summaries",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub summaries: Option<StageOutput<Vec<TopicSummary>>>,
}

impl CompletedResults {
    /// Whether a given stage's result is present.
    #[must_use]
    pub fn contains(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Clustering => self.clustering.is_some(),
            StageKind::Claims => self.claims.is_some(),
            StageKind::SortAndDeduplicate => self.sort_and_deduplicate.is_some(),
            StageKind::Summaries => self.summaries.is_some(),
        }
    }
}

/// A completed stage's typed output, carried from executor to state.
#[derive(Debug, Clone)]
pub enum StageData {
    Clustering(StageOutput<Taxonomy>),
    Claims(StageOutput<ClaimsTree>),
    SortAndDeduplicate(StageOutput<SortedTree>),
    Summaries(StageOutput<Vec<TopicSummary>>),
}

impl StageData {
    #[must_use]
    pub fn kind(&self) -> StageKind {
        match self {
            StageData::Clustering(_) => StageKind::Clustering,
            StageData::Claims(_) => StageKind::Claims,
            StageData::SortAndDeduplicate(_) => StageKind::SortAndDeduplicate,
            StageData::Summaries(_) => StageKind::Summaries,
        }
    }

    #[must_use]
    pub fn usage(&self) -> &TokenUsage {
        match self {
            StageData::Clustering(o) => &o.usage,
            StageData::Claims(o) => &o.usage,
            StageData::SortAndDeduplicate(o) => &o.usage,
            StageData::Summaries(o) => &o.usage,
        }
    }

    #[must_use]
    pub fn cost(&self) -> f64 {
        match self {
            StageData::Clustering(o) => o.cost,
            StageData::Claims(o) => o.cost,
            StageData::SortAndDeduplicate(o) => o.cost,
            StageData::Summaries(o) => o.cost,
        }
    }
}

/// The pipeline checkpoint: exactly one exists per report id, and it is the
/// sole source of truth for resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub report_id: String,
    pub user_id: String,
    pub schema_version: u32,
    pub status: PipelineStatus,
    #[serde(with = "ts_ms")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_ms")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_results: CompletedResults,
    pub step_analytics: StepAnalytics,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_duration_ms: u64,
    #[serde(default)]
    pub error: Option<PipelineErrorInfo>,
}

impl PipelineState {
    /// Fresh state for a report that has never run: everything pending,
    /// no results, zero aggregates.
    #[must_use]
    pub fn new(report_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            report_id: report_id.into(),
            user_id: user_id.into(),
            schema_version: SCHEMA_VERSION,
            status: PipelineStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_results: CompletedResults::default(),
            step_analytics: StepAnalytics::default(),
            total_tokens: 0,
            total_cost: 0.0,
            total_duration_ms: 0,
            error: None,
        }
    }

    /// Mark a stage running and move the run status with it.
    pub fn begin_stage(&mut self, stage: StageKind) {
        let now = now_ms();
        let analytic = self.step_analytics.get_mut(stage);
        analytic.status = StageStatus::Running;
        analytic.started_at = Some(now);
        self.status = PipelineStatus::running(stage);
        self.updated_at = now;
    }

    /// Finalize a successful stage: analytic to `completed`, result attached,
    /// aggregates recomputed. The two writes stay in one method so the
    /// result/analytic pairing invariant cannot drift.
    pub fn complete_stage(&mut self, data: StageData, duration_ms: u64) {
        let stage = data.kind();
        let now = now_ms();
        {
            let analytic = self.step_analytics.get_mut(stage);
            analytic.status = StageStatus::Completed;
            analytic.finished_at = Some(now);
            analytic.duration_ms = duration_ms;
            analytic.record_usage(data.usage(), data.cost());
            analytic.error = None;
        }
        match data {
            StageData::Clustering(o) => self.completed_results.clustering = Some(o),
            StageData::Claims(o) => self.completed_results.claims = Some(o),
            StageData::SortAndDeduplicate(o) => {
                self.completed_results.sort_and_deduplicate = Some(o)
            }
            StageData::Summaries(o) => self.completed_results.summaries = Some(o),
        }
        self.recompute_aggregates();
        self.updated_at = now;
    }

    /// Finalize a failed stage and fail the run. Partial usage (tokens spent
    /// before the failure) still counts toward the aggregates.
    pub fn fail_stage(
        &mut self,
        stage: StageKind,
        error: PipelineErrorInfo,
        usage: Option<&TokenUsage>,
        cost: f64,
        duration_ms: u64,
    ) {
        let now = now_ms();
        {
            let analytic = self.step_analytics.get_mut(stage);
            analytic.status = StageStatus::Failed;
            analytic.finished_at = Some(now);
            analytic.duration_ms = duration_ms;
            if let Some(usage) = usage {
                analytic.record_usage(usage, cost);
            }
            analytic.error = Some(error.clone());
        }
        self.status = PipelineStatus::Failed;
        self.error = Some(error);
        self.recompute_aggregates();
        self.updated_at = now;
    }

    /// Mark the whole run completed.
    pub fn mark_completed(&mut self) {
        self.status = PipelineStatus::Completed;
        self.error = None;
        self.updated_at = now_ms();
    }

    /// Mark the state permanently failed after the validation-failure counter
    /// overflowed. This is terminal: resumption refuses such states.
    pub fn mark_permanently_corrupted(&mut self, message: impl Into<String>) {
        self.status = PipelineStatus::Failed;
        self.error = Some(PipelineErrorInfo::new(
            "state",
            message,
            ErrorKind::PermanentlyCorrupted,
        ));
        self.updated_at = now_ms();
    }

    /// Recompute run aggregates from per-stage analytics over stages whose
    /// status is `completed` or `failed`.
    pub fn recompute_aggregates(&mut self) {
        let mut tokens = 0u64;
        let mut cost = 0.0f64;
        let mut duration = 0u64;
        for (_, analytic) in self.step_analytics.iter() {
            if matches!(analytic.status, StageStatus::Completed | StageStatus::Failed) {
                tokens += analytic.total_tokens;
                cost += analytic.cost;
                duration += analytic.duration_ms;
            }
        }
        self.total_tokens = tokens;
        self.total_cost = cost;
        self.total_duration_ms = duration;
    }

    /// Whether a stage already holds a validated result.
    #[must_use]
    pub fn is_stage_completed(&self, stage: StageKind) -> bool {
        self.completed_results.contains(stage)
    }

    /// Stages with validated results, in execution order.
    #[must_use]
    pub fn completed_stages(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|s| self.is_stage_completed(*s))
            .collect()
    }

    /// The first stage without a validated result, if any.
    #[must_use]
    pub fn first_incomplete_stage(&self) -> Option<StageKind> {
        StageKind::ALL
            .into_iter()
            .find(|s| !self.is_stage_completed(*s))
    }
}
