//! The pipeline runner: lock protocol, resumable stage loop, and the
//! verify-then-save gate.
//!
//! # Lock and save protocol
//!
//! A run owns its report through an opaque token in
//! `pipeline_lock:{reportId}`. The runner either mints a token and acquires
//! the lock itself, or inherits a token the dispatch layer already holds
//! (`RunnerConfig::lock_value`), in which case release stays the caller's
//! responsibility.
//!
//! Before *every* state write the runner re-reads the lock and compares
//! tokens. A mismatch means the TTL lapsed mid-stage and another worker took
//! over: the run aborts with [`RunnerError::LockLostDuringSave`], deliberately
//! neither saving (the successor owns the state now) nor releasing (the lock
//! is not ours anymore). On a match, the save goes through and the lock TTL
//! is refreshed opportunistically.
//!
//! # Resumption
//!
//! `completedResults` drives the stage loop: a stage with a validated result
//! is skipped, everything else re-executes from its start. Corrupt persisted
//! states are tolerated a bounded number of times (the validation-failure
//! counter); past the bound the state is rewritten as permanently failed.
//!
//! The runner retries nothing — transport retry lives in the provider
//! client, and run-level retry belongs to the job queue.

use miette::Diagnostic;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::input::PipelineInput;
use crate::llm::{BackoffConfig, LlmClient, ModelCatalog};
use crate::settings::WorkerSettings;
use crate::stages::{
    StageContext, StageError, run_claims, run_clustering, run_dedupe, run_summaries,
};
use crate::state::{PipelineErrorInfo, PipelineState, PipelineStatus, StageData};
use crate::store::{PipelineStateStore, StateLoad, StoreError};
use crate::types::StageKind;

/// Per-run configuration supplied by the dispatch layer.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Globally unique report identifier.
    pub report_id: String,
    pub user_id: String,
    /// Resume from the persisted checkpoint instead of starting fresh.
    pub resume_from_state: bool,
    /// Lock token the caller already owns. When absent the runner mints one
    /// and takes over release responsibility.
    pub lock_value: Option<String>,
}

impl RunnerConfig {
    pub fn new(report_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            report_id: report_id.into(),
            user_id: user_id.into(),
            resume_from_state: false,
            lock_value: None,
        }
    }

    #[must_use]
    pub fn resuming(mut self) -> Self {
        self.resume_from_state = true;
        self
    }

    #[must_use]
    pub fn with_lock_value(mut self, token: impl Into<String>) -> Self {
        self.lock_value = Some(token.into());
        self
    }
}

/// What a finished run hands back to the dispatch layer.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub success: bool,
    /// The state as last persisted (or as constructed, when the lock was
    /// lost before any save).
    pub state: PipelineState,
    /// Mirror of `state.error` for failed runs.
    pub error: Option<PipelineErrorInfo>,
}

impl RunResult {
    fn from_state(state: PipelineState) -> Self {
        let error = state.error.clone();
        Self {
            success: state.status == PipelineStatus::Completed,
            state,
            error,
        }
    }
}

/// Entry-level and protocol failures. Stage failures are *not* errors at
/// this boundary — they come back as a failed [`RunResult`] with the cause
/// recorded in the state.
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    /// Another worker holds the report lock.
    #[error("report {report_id} is locked by another worker")]
    #[diagnostic(
        code(claimweave::runner::lock_contended),
        help("Re-enqueue the job; the holder's lock expires after its TTL.")
    )]
    LockContended { report_id: String },

    /// The lock changed hands mid-run; the state was deliberately not saved.
    #[error("lock for report {report_id} was lost before saving stage {stage}")]
    #[diagnostic(
        code(claimweave::runner::lock_lost),
        help("Another worker owns the report now; this run's partial work is discarded.")
    )]
    LockLostDuringSave { report_id: String, stage: String },

    /// Resume was requested but no checkpoint exists.
    #[error("no persisted state to resume for report {report_id}")]
    #[diagnostic(code(claimweave::runner::missing_state))]
    MissingStateForResume { report_id: String },

    /// A fresh start was requested over a live (non-failed) state.
    #[error("report {report_id} already has in-progress or completed state")]
    #[diagnostic(
        code(claimweave::runner::already_exists),
        help("Pass resume_from_state to continue the existing run instead.")
    )]
    AlreadyExists { report_id: String },

    /// The persisted state failed validation, but the failure budget is not
    /// yet exhausted. The caller may retry.
    #[error(
        "persisted state for report {report_id} failed validation ({failures}/{max_failures}): {reason}"
    )]
    #[diagnostic(
        code(claimweave::runner::transient_corruption),
        help("Retry the job; after {max_failures} failures the state is marked permanently corrupted.")
    )]
    TransientCorruption {
        report_id: String,
        failures: i64,
        max_failures: i64,
        reason: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Executes pipelines for one worker process.
///
/// All collaborators are injected: the state store, the provider client,
/// the cost catalog, the retry policy, and the worker settings. The runner
/// is shared-reference callable, so one instance serves concurrent jobs.
pub struct PipelineRunner {
    store: PipelineStateStore,
    llm: Arc<dyn LlmClient>,
    catalog: ModelCatalog,
    backoff: BackoffConfig,
    settings: WorkerSettings,
}

impl PipelineRunner {
    #[must_use]
    pub fn new(store: PipelineStateStore, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            store,
            llm,
            catalog: ModelCatalog::builtin(),
            backoff: BackoffConfig::default(),
            settings: WorkerSettings::default(),
        }
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Run the pipeline without external cancellation.
    pub async fn run(
        &self,
        input: &PipelineInput,
        config: &RunnerConfig,
    ) -> Result<RunResult, RunnerError> {
        let cancel = AtomicBool::new(false);
        self.run_with_cancel(input, config, &cancel).await
    }

    /// Run the pipeline, checking `cancel` between stages and before each
    /// intra-stage dispatch (never inside an in-flight provider call).
    #[instrument(
        skip(self, input, config, cancel),
        fields(report_id = %config.report_id, user_id = %config.user_id, resume = config.resume_from_state)
    )]
    pub async fn run_with_cancel(
        &self,
        input: &PipelineInput,
        config: &RunnerConfig,
        cancel: &AtomicBool,
    ) -> Result<RunResult, RunnerError> {
        let (token, acquired_here) = match &config.lock_value {
            Some(token) => (token.clone(), false),
            None => {
                let token = Uuid::new_v4().to_string();
                if !self
                    .store
                    .acquire_pipeline_lock(&config.report_id, &token)
                    .await?
                {
                    return Err(RunnerError::LockContended {
                        report_id: config.report_id.clone(),
                    });
                }
                (token, true)
            }
        };

        let result = self.run_locked(input, config, &token, cancel).await;

        // Release discipline: only locks we took ourselves, and never after
        // losing ownership (the lock belongs to a successor then).
        let lock_lost = matches!(&result, Err(RunnerError::LockLostDuringSave { .. }));
        if acquired_here && !lock_lost {
            if let Err(e) = self
                .store
                .release_pipeline_lock(&config.report_id, &token)
                .await
            {
                warn!(error = %e, "failed to release report lock on exit");
            }
        }
        result
    }

    async fn run_locked(
        &self,
        input: &PipelineInput,
        config: &RunnerConfig,
        token: &str,
        cancel: &AtomicBool,
    ) -> Result<RunResult, RunnerError> {
        let mut state = match self.resolve_state(config, token).await? {
            ResolvedState::Run(state) => state,
            ResolvedState::Finished(result) => return Ok(result),
        };

        let ctx = StageContext {
            report_id: &config.report_id,
            user_id: &config.user_id,
            llm: self.llm.as_ref(),
            catalog: &self.catalog,
            backoff: &self.backoff,
            settings: &self.settings,
            cancel,
        };

        for stage in StageKind::ALL {
            if state.is_stage_completed(stage) {
                info!(stage = %stage, "stage already completed; skipping");
                continue;
            }

            state.begin_stage(stage);
            let started = Instant::now();
            let outcome = self.execute_stage(stage, input, &state, &ctx).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(data) => {
                    state.complete_stage(data, duration_ms);
                    self.save_gated(&state, token, stage).await?;
                    info!(stage = %stage, duration_ms, "stage completed");
                }
                Err(stage_error) => {
                    let error_info = stage_error.to_error_info(stage);
                    // Tokens billed before the failure still count toward
                    // the run aggregates.
                    let spend = stage_error.spend();
                    warn!(stage = %stage, error = %stage_error, "stage failed; run aborts");
                    state.fail_stage(
                        stage,
                        error_info,
                        spend.as_ref().map(|s| &s.usage),
                        spend.map_or(0.0, |s| s.cost),
                        duration_ms,
                    );
                    self.save_gated(&state, token, stage).await?;
                    return Ok(RunResult::from_state(state));
                }
            }
        }

        state.mark_completed();
        self.save_gated(&state, token, StageKind::Summaries).await?;
        info!(
            total_tokens = state.total_tokens,
            total_cost = state.total_cost,
            total_duration_ms = state.total_duration_ms,
            "pipeline completed"
        );
        Ok(RunResult::from_state(state))
    }

    async fn execute_stage(
        &self,
        stage: StageKind,
        input: &PipelineInput,
        state: &PipelineState,
        ctx: &StageContext<'_>,
    ) -> Result<StageData, StageError> {
        if ctx.cancelled() {
            return Err(StageError::Cancelled);
        }
        let configs = &input.configs;
        let api_key = &input.api_key;
        match stage {
            StageKind::Clustering => {
                run_clustering(&input.comments, &configs.clustering, api_key, ctx)
                    .await
                    .map(StageData::Clustering)
            }
            StageKind::Claims => {
                let taxonomy = state
                    .completed_results
                    .clustering
                    .as_ref()
                    .map(|o| &o.data)
                    .ok_or_else(|| {
                        StageError::validation_failed("clustering result missing for claims stage")
                    })?;
                run_claims(&input.comments, taxonomy, &configs.claims, api_key, ctx)
                    .await
                    .map(StageData::Claims)
            }
            StageKind::SortAndDeduplicate => {
                let tree = state
                    .completed_results
                    .claims
                    .as_ref()
                    .map(|o| &o.data)
                    .ok_or_else(|| {
                        StageError::validation_failed("claims result missing for dedupe stage")
                    })?;
                run_dedupe(
                    tree,
                    input.sort_strategy,
                    &configs.sort_and_deduplicate,
                    api_key,
                    ctx,
                )
                .await
                .map(StageData::SortAndDeduplicate)
            }
            StageKind::Summaries => {
                let tree = state
                    .completed_results
                    .sort_and_deduplicate
                    .as_ref()
                    .map(|o| &o.data)
                    .ok_or_else(|| {
                        StageError::validation_failed("dedupe result missing for summaries stage")
                    })?;
                run_summaries(tree, &configs.summaries, api_key, ctx)
                    .await
                    .map(StageData::Summaries)
            }
        }
    }

    /// Load-or-create the run's state per the resumption decision table.
    async fn resolve_state(
        &self,
        config: &RunnerConfig,
        token: &str,
    ) -> Result<ResolvedState, RunnerError> {
        match self.store.get(&config.report_id).await? {
            StateLoad::Missing if config.resume_from_state => {
                Err(RunnerError::MissingStateForResume {
                    report_id: config.report_id.clone(),
                })
            }
            StateLoad::Missing => {
                let state = PipelineState::new(&config.report_id, &config.user_id);
                // Persist the fresh checkpoint so the report is observable
                // before the first stage lands.
                self.save_gated(&state, token, StageKind::Clustering)
                    .await?;
                Ok(ResolvedState::Run(state))
            }
            StateLoad::Invalid { reason } => {
                let failures = self
                    .store
                    .increment_validation_failure(&config.report_id, "state")
                    .await?;
                let max_failures = self.settings.max_validation_failures;
                if failures >= max_failures {
                    warn!(
                        failures,
                        max_failures, "validation-failure budget exhausted; marking state permanently corrupted"
                    );
                    let mut state = PipelineState::new(&config.report_id, &config.user_id);
                    state.mark_permanently_corrupted(format!(
                        "state failed validation {failures} times (last: {reason})"
                    ));
                    self.save_gated(&state, token, StageKind::Clustering)
                        .await?;
                    Ok(ResolvedState::Finished(RunResult::from_state(state)))
                } else {
                    Err(RunnerError::TransientCorruption {
                        report_id: config.report_id.clone(),
                        failures,
                        max_failures,
                        reason,
                    })
                }
            }
            StateLoad::Valid(state) => {
                let state = *state;
                if state
                    .error
                    .as_ref()
                    .is_some_and(|e| e.kind == crate::state::ErrorKind::PermanentlyCorrupted)
                {
                    // Terminal: report the corrupted state as-is, never re-run.
                    return Ok(ResolvedState::Finished(RunResult::from_state(state)));
                }
                if !config.resume_from_state && state.status != PipelineStatus::Failed {
                    // Overwrite-start over a live state is forbidden.
                    return Err(RunnerError::AlreadyExists {
                        report_id: config.report_id.clone(),
                    });
                }
                if !config.resume_from_state {
                    info!("existing failed state; resuming from last completed stage");
                }
                Ok(ResolvedState::Run(state))
            }
        }
    }

    /// The atomic save gate: verify we still own the lock, then persist and
    /// opportunistically refresh the lock TTL.
    async fn save_gated(
        &self,
        state: &PipelineState,
        token: &str,
        stage: StageKind,
    ) -> Result<(), RunnerError> {
        if !self
            .store
            .verify_lock_ownership(&state.report_id, token)
            .await?
        {
            return Err(RunnerError::LockLostDuringSave {
                report_id: state.report_id.clone(),
                stage: stage.as_str().to_string(),
            });
        }
        self.store.save(state).await?;
        self.store
            .extend_pipeline_lock(&state.report_id, token)
            .await?;
        Ok(())
    }
}

enum ResolvedState {
    Run(PipelineState),
    Finished(RunResult),
}
