//! End-to-end runner scenarios: happy path, resume, contention, lock loss,
//! and permanent corruption.

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use claimweave::cache::{Cache, InMemoryCache};
use claimweave::llm::{BackoffConfig, ChatResponse, LlmError, MockLlm, TokenUsage};
use claimweave::runner::{PipelineRunner, RunnerConfig, RunnerError};
use claimweave::settings::WorkerSettings;
use claimweave::state::{ErrorKind, PipelineStatus, StageStatus};
use claimweave::store::{StateLoad, keys};
use claimweave::types::StageKind;

use common::fixtures::{
    happy_path_llm, pipeline_input, stage_of, store_on, tech_taxonomy_json, two_ai_comments,
};

fn runner_on(
    cache: Arc<InMemoryCache>,
    llm: MockLlm,
    settings: WorkerSettings,
) -> PipelineRunner {
    let store = store_on(cache, &settings);
    PipelineRunner::new(store, Arc::new(llm))
        .with_settings(settings)
        .with_backoff(BackoffConfig::none())
}

/// Scenario: the full four-stage run over two comments about one theme.
#[tokio::test]
async fn happy_path_completes_with_deduplicated_tree() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    let runner = runner_on(cache.clone(), happy_path_llm(), settings.clone());

    let input = pipeline_input(two_ai_comments());
    let result = runner
        .run(&input, &RunnerConfig::new("report-1", "user-1"))
        .await
        .unwrap();

    assert!(result.success);
    let state = &result.state;
    assert_eq!(state.status, PipelineStatus::Completed);
    assert!(state.error.is_none());

    // One topic, one subtopic, the second claim folded under the first.
    let sorted = &state.completed_results.sort_and_deduplicate.as_ref().unwrap().data;
    assert_eq!(sorted.len(), 1);
    assert_eq!(sorted[0].topic_name, "Technology");
    assert_eq!(sorted[0].subtopics.len(), 1);
    let first_claim = &sorted[0].subtopics[0].claims[0];
    assert_eq!(first_claim.duplicates.len(), 1);

    let summaries = &state.completed_results.summaries.as_ref().unwrap().data;
    assert_eq!(summaries.len(), 1);

    assert!(state.total_cost > 0.0);
    assert!(state.total_tokens > 0);
    for stage in StageKind::ALL {
        assert_eq!(state.step_analytics.get(stage).status, StageStatus::Completed);
    }

    // The persisted checkpoint matches what the runner handed back, and the
    // lock was released on exit.
    let store = store_on(cache.clone(), &settings);
    match store.get("report-1").await.unwrap() {
        StateLoad::Valid(persisted) => assert_eq!(*persisted, result.state),
        other => panic!("expected persisted state, got {other:?}"),
    }
    assert_eq!(cache.get(&keys::lock("report-1")).await.unwrap(), None);
}

/// Scenario: claims fails on the first run; the resume skips clustering and
/// finishes the remaining stages.
#[tokio::test]
async fn resume_after_claims_failure_skips_clustering() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());

    // First run: clustering succeeds, every claims call errors.
    let broken = MockLlm::with_handler(|req| match stage_of(req) {
        "clustering" => Ok(ChatResponse {
            text: tech_taxonomy_json().to_string(),
            usage: TokenUsage::new(100, 50),
        }),
        "claims" => Err(LlmError::Http {
            status: 500,
            body: "provider outage".into(),
            retry_after: None,
        }),
        other => panic!("unexpected stage {other} in first run"),
    });
    let runner = runner_on(cache.clone(), broken, settings.clone());
    let input = pipeline_input(two_ai_comments());

    let result = runner
        .run(&input, &RunnerConfig::new("report-1", "user-1"))
        .await
        .unwrap();

    assert!(!result.success);
    let state = &result.state;
    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(state.step_analytics.clustering.status, StageStatus::Completed);
    assert_eq!(state.step_analytics.claims.status, StageStatus::Failed);
    assert_eq!(
        state.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::ApiCallFailed)
    );
    assert!(state.completed_results.contains(StageKind::Clustering));
    assert!(!state.completed_results.contains(StageKind::Claims));

    // Second run, provider recovered: clustering must not re-execute.
    let healthy = happy_path_llm();
    let runner = runner_on(cache.clone(), healthy, settings.clone());
    let result = runner
        .run(
            &input,
            &RunnerConfig::new("report-1", "user-1").resuming(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.state.status, PipelineStatus::Completed);
    assert!(result.state.error.is_none());
    // completedResults kept the first run's clustering output verbatim.
    assert_eq!(
        result.state.step_analytics.clustering.status,
        StageStatus::Completed
    );
}

#[tokio::test]
async fn resume_skip_is_visible_in_the_providers_traffic() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    let input = pipeline_input(two_ai_comments());

    let broken = MockLlm::with_handler(|req| match stage_of(req) {
        "clustering" => Ok(ChatResponse {
            text: tech_taxonomy_json().to_string(),
            usage: TokenUsage::new(100, 50),
        }),
        _ => Err(LlmError::Request("down".into())),
    });
    let runner = runner_on(cache.clone(), broken, settings.clone());
    runner
        .run(&input, &RunnerConfig::new("report-1", "user-1"))
        .await
        .unwrap();

    let store = store_on(cache.clone(), &settings);
    let healthy = Arc::new(happy_path_llm());
    let runner = PipelineRunner::new(store, healthy.clone()).with_settings(settings);
    runner
        .run(&input, &RunnerConfig::new("report-1", "user-1").resuming())
        .await
        .unwrap();

    // No request in the second run belonged to the clustering stage.
    assert!(
        healthy
            .recorded_requests()
            .iter()
            .all(|req| stage_of(req) != "clustering")
    );
}

/// Scenario: two workers contend for one report; exactly one runs.
#[tokio::test(start_paused = true)]
async fn concurrent_workers_one_wins_one_gets_lock_contended() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());

    let make_runner = || {
        let llm = happy_path_llm();
        // Latency keeps the winner inside a stage while the loser arrives.
        llm.set_latency(Duration::from_millis(200));
        Arc::new(runner_on(cache.clone(), llm, settings.clone()))
    };
    let runner_a = make_runner();
    let runner_b = make_runner();
    let input = Arc::new(pipeline_input(two_ai_comments()));

    let a = {
        let input = input.clone();
        let runner = runner_a.clone();
        tokio::spawn(async move {
            runner
                .run(&input, &RunnerConfig::new("report-1", "worker-a"))
                .await
        })
    };
    let b = {
        let input = input.clone();
        let runner = runner_b.clone();
        tokio::spawn(async move {
            runner
                .run(&input, &RunnerConfig::new("report-1", "worker-b"))
                .await
        })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    let mut successes = 0;
    let mut contended = 0;
    for outcome in [a, b] {
        match outcome {
            Ok(result) => {
                assert!(result.success);
                successes += 1;
            }
            Err(RunnerError::LockContended { .. }) => contended += 1,
            Err(other) => panic!("unexpected outcome: {other}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(contended, 1);
}

/// Scenario: the lock TTL lapses inside a slow stage; the save gate rejects
/// the write and the persisted state stays at its entry snapshot.
#[tokio::test(start_paused = true)]
async fn lock_expiry_mid_stage_aborts_without_saving() {
    let settings = WorkerSettings::default().with_lock_ttl(Duration::from_secs(1));
    let cache = Arc::new(InMemoryCache::new());
    let llm = happy_path_llm();
    llm.set_latency(Duration::from_millis(1_500));
    let runner = runner_on(cache.clone(), llm, settings.clone());

    let input = pipeline_input(two_ai_comments());
    let err = runner
        .run(&input, &RunnerConfig::new("report-1", "user-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::LockLostDuringSave { .. }));

    // The state is unchanged from entry: still pending, no stage landed.
    let store = store_on(cache.clone(), &settings);
    match store.get("report-1").await.unwrap() {
        StateLoad::Valid(state) => {
            assert_eq!(state.status, PipelineStatus::Pending);
            assert!(state.completed_stages().is_empty());
        }
        other => panic!("expected the entry snapshot, got {other:?}"),
    }
}

/// Scenario: malformed persisted state is tolerated twice, then marked
/// permanently corrupted on the third validation failure.
#[tokio::test]
async fn corruption_becomes_permanent_after_three_failures() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    cache
        .set(&keys::state("report-1"), "{malformed", None)
        .await
        .unwrap();

    let input = pipeline_input(two_ai_comments());
    let config = RunnerConfig::new("report-1", "user-1").resuming();

    for expected_failures in 1..=2 {
        let runner = runner_on(cache.clone(), MockLlm::new(), settings.clone());
        match runner.run(&input, &config).await.unwrap_err() {
            RunnerError::TransientCorruption { failures, .. } => {
                assert_eq!(failures, expected_failures);
            }
            other => panic!("expected transient corruption, got {other}"),
        }
    }

    let runner = runner_on(cache.clone(), MockLlm::new(), settings.clone());
    let result = runner.run(&input, &config).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.state.status, PipelineStatus::Failed);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::PermanentlyCorrupted)
    );
    assert_eq!(
        cache
            .get(&keys::validation_failure("report-1", "state"))
            .await
            .unwrap()
            .as_deref(),
        Some("3")
    );

    // Terminal thereafter: further runs report the same failed state and
    // never re-execute.
    let runner = runner_on(cache.clone(), MockLlm::new(), settings.clone());
    let again = runner.run(&input, &config).await.unwrap();
    assert!(!again.success);
    assert_eq!(
        again.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::PermanentlyCorrupted)
    );
}

#[tokio::test]
async fn fresh_start_over_live_state_is_rejected() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    let input = pipeline_input(two_ai_comments());

    let runner = runner_on(cache.clone(), happy_path_llm(), settings.clone());
    runner
        .run(&input, &RunnerConfig::new("report-1", "user-1"))
        .await
        .unwrap();

    let runner = runner_on(cache.clone(), happy_path_llm(), settings.clone());
    let err = runner
        .run(&input, &RunnerConfig::new("report-1", "user-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::AlreadyExists { .. }));
}

#[tokio::test]
async fn fresh_start_over_failed_state_resumes_instead() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    let input = pipeline_input(two_ai_comments());

    let broken = MockLlm::with_handler(|req| match stage_of(req) {
        "clustering" => Ok(ChatResponse {
            text: tech_taxonomy_json().to_string(),
            usage: TokenUsage::new(100, 50),
        }),
        _ => Err(LlmError::Request("down".into())),
    });
    let runner = runner_on(cache.clone(), broken, settings.clone());
    let first = runner
        .run(&input, &RunnerConfig::new("report-1", "user-1"))
        .await
        .unwrap();
    assert!(!first.success);

    // resume_from_state is false, but the existing state is failed: treat as
    // a fresh resume from the last completed stage.
    let runner = runner_on(cache.clone(), happy_path_llm(), settings.clone());
    let second = runner
        .run(&input, &RunnerConfig::new("report-1", "user-1"))
        .await
        .unwrap();
    assert!(second.success);
}

#[tokio::test]
async fn resume_without_state_is_an_error() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    let runner = runner_on(cache.clone(), MockLlm::new(), settings);

    let err = runner
        .run(
            &pipeline_input(two_ai_comments()),
            &RunnerConfig::new("report-1", "user-1").resuming(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::MissingStateForResume { .. }));
}

#[tokio::test]
async fn caller_held_lock_is_trusted_and_never_released() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    let store = store_on(cache.clone(), &settings);
    // The dispatch layer took the lock before handing us the job.
    assert!(store.acquire_pipeline_lock("report-1", "queue-token").await.unwrap());

    let runner = runner_on(cache.clone(), happy_path_llm(), settings.clone());
    let result = runner
        .run(
            &pipeline_input(two_ai_comments()),
            &RunnerConfig::new("report-1", "user-1").with_lock_value("queue-token"),
        )
        .await
        .unwrap();
    assert!(result.success);

    // Release stays the caller's responsibility.
    assert_eq!(
        cache.get(&keys::lock("report-1")).await.unwrap().as_deref(),
        Some("queue-token")
    );
}

#[tokio::test]
async fn pre_cancelled_run_fails_with_cancelled() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    let runner = runner_on(cache.clone(), happy_path_llm(), settings.clone());

    let cancel = AtomicBool::new(true);
    let result = runner
        .run_with_cancel(
            &pipeline_input(two_ai_comments()),
            &RunnerConfig::new("report-1", "user-1"),
            &cancel,
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Cancelled)
    );
    // Lock released even on the cancelled path.
    assert_eq!(cache.get(&keys::lock("report-1")).await.unwrap(), None);
}

#[tokio::test]
async fn failed_stage_spend_lands_in_the_aggregates() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    // The clustering call is billed (default mock usage) but unparseable.
    let llm = MockLlm::new();
    llm.enqueue_text("this is not a taxonomy");
    let runner = runner_on(cache.clone(), llm, settings);

    let result = runner
        .run(
            &pipeline_input(two_ai_comments()),
            &RunnerConfig::new("report-1", "user-1"),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::ParseFailed)
    );
    let analytic = result.state.step_analytics.get(StageKind::Clustering);
    assert_eq!(analytic.status, StageStatus::Failed);
    assert_eq!(analytic.total_tokens, 150);
    assert!(analytic.cost > 0.0);
    // The billed-but-failed call is not lost from the run totals.
    assert_eq!(result.state.total_tokens, 150);
    assert!(result.state.total_cost > 0.0);
}

#[tokio::test]
async fn aggregates_match_analytics_after_a_full_run() {
    let settings = WorkerSettings::default();
    let cache = Arc::new(InMemoryCache::new());
    let runner = runner_on(cache.clone(), happy_path_llm(), settings);

    let result = runner
        .run(
            &pipeline_input(two_ai_comments()),
            &RunnerConfig::new("report-1", "user-1"),
        )
        .await
        .unwrap();

    let state = &result.state;
    let mut tokens = 0;
    let mut cost = 0.0;
    let mut duration = 0;
    for (_, analytic) in state.step_analytics.iter() {
        if matches!(analytic.status, StageStatus::Completed | StageStatus::Failed) {
            tokens += analytic.total_tokens;
            cost += analytic.cost;
            duration += analytic.duration_ms;
        }
    }
    assert_eq!(state.total_tokens, tokens);
    assert!((state.total_cost - cost).abs() < 1e-9);
    assert_eq!(state.total_duration_ms, duration);
}
