//! # Claimweave: Resumable Topic/Claim Distillation Pipeline
//!
//! Claimweave is the execution engine of a worker that turns a batch of
//! free-text comments into a structured, deduplicated topic/claim taxonomy.
//! Many workers run concurrently across a fleet; they coordinate through a
//! shared key-value store with a single-writer lock per report.
//!
//! ## Core Concepts
//!
//! - **Report**: one pipeline run for one comment batch, identified by a
//!   globally unique `report_id`.
//! - **Stages**: clustering → claim extraction → sort/deduplicate → topic
//!   summaries, executed strictly in order with per-stage analytics.
//! - **Checkpoint**: after every stage the [`state::PipelineState`] is
//!   persisted, so a crashed or preempted run resumes from the last
//!   completed stage.
//! - **Lock protocol**: state writes happen only while the worker still
//!   owns the report lock; a worker whose lock expired mid-stage aborts
//!   without saving.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use claimweave::cache::InMemoryCache;
//! use claimweave::input::{Comment, LlmStageConfig, PipelineInput, StageConfigs};
//! use claimweave::llm::MockLlm;
//! use claimweave::runner::{PipelineRunner, RunnerConfig};
//! use claimweave::settings::WorkerSettings;
//! use claimweave::store::{PipelineStateStore, StateRetention};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = WorkerSettings::from_env();
//! let store = PipelineStateStore::new(
//!     Arc::new(InMemoryCache::new()),
//!     StateRetention(settings.state_retention),
//!     settings.lock_ttl,
//! );
//! let runner = PipelineRunner::new(store, Arc::new(MockLlm::new()))
//!     .with_settings(settings);
//!
//! let stage = |prompt: &str| LlmStageConfig::new("gpt-4o-mini", "You are careful.", prompt);
//! let input = PipelineInput {
//!     comments: vec![Comment::new("c1", "Buses should run past midnight")],
//!     configs: StageConfigs {
//!         clustering: stage("Cluster these comments."),
//!         claims: stage("Extract claims."),
//!         sort_and_deduplicate: stage("Group duplicate claims."),
//!         summaries: stage("Summarize the topic."),
//!     },
//!     api_key: "sk-test".into(),
//!     enable_cruxes: false,
//!     sort_strategy: Default::default(),
//! };
//!
//! let result = runner.run(&input, &RunnerConfig::new("report-1", "user-1")).await?;
//! println!("completed: {}", result.success);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`input`] - The immutable pipeline input (comments, stage configs)
//! - [`taxonomy`] - Topics, subtopics, claims, and the trees built from them
//! - [`state`] - The persisted checkpoint object and its JSON contract
//! - [`cache`] - Typed KV operations with atomic lock/counter primitives
//! - [`store`] - Redis-backed state store, key layout, retention policy
//! - [`llm`] - Provider contract, cost catalog, defensive parsing, retry
//! - [`stages`] - The four stage executors and comment sanitization
//! - [`runner`] - Lock protocol, stage loop, resumption, save gate
//! - [`settings`] - Environment-resolved worker knobs
//! - [`telemetry`] - Tracing bootstrap

pub mod cache;
pub mod input;
pub mod llm;
pub mod runner;
pub mod settings;
pub mod stages;
pub mod state;
pub mod store;
pub mod taxonomy;
pub mod telemetry;
pub mod types;
