/*!
Redis-backed persistence for pipeline state, the report lock, and the
validation-failure counter.

This module owns only KV I/O and the key layout; the serialized shape
itself lives in [`crate::state`]. All operations are scoped to a
`report_id`.

## Key layout

| Key | Value |
|---|---|
| `pipeline_state:{reportId}` | UTF-8 JSON [`PipelineState`] |
| `pipeline_lock:{reportId}` | opaque lock token, TTL-bearing |
| `pipeline_validation_failure:{reportId}:{step}` | decimal counter |

Every key carries the store's retention window so stale reports are
eventually reclaimed (the lock uses its own shorter TTL).
*/

use miette::Diagnostic;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cache::{Cache, CacheError};
use crate::state::{PipelineState, SCHEMA_VERSION};

/// Key builders for the `pipeline_*` namespace.
pub mod keys {
    pub fn state(report_id: &str) -> String {
        format!("pipeline_state:{report_id}")
    }

    pub fn lock(report_id: &str) -> String {
        format!("pipeline_lock:{report_id}")
    }

    pub fn validation_failure(report_id: &str, step: &str) -> String {
        format!("pipeline_validation_failure:{report_id}:{step}")
    }
}

/// Retention window applied to every persisted `pipeline_*` key.
///
/// Held as an explicit policy value rather than an ambient TTL so the
/// reclamation semantics are visible at the store's construction site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRetention(pub Duration);

impl StateRetention {
    #[must_use]
    pub fn window(&self) -> Duration {
        self.0
    }
}

/// Errors from state-store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] CacheError),

    #[error("state serialization failed: {source}")]
    #[diagnostic(
        code(claimweave::store::serialize),
        help("The in-memory state no longer matches the persisted schema.")
    )]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of loading a report's persisted state.
#[derive(Debug)]
pub enum StateLoad {
    /// No state exists for the report.
    Missing,
    /// A value exists but failed schema validation. The caller decides
    /// whether to increment the validation-failure counter.
    Invalid { reason: String },
    /// A valid state.
    Valid(Box<PipelineState>),
}

/// The pipeline's persistence facade over a shared [`Cache`].
///
/// Construction fixes the [`StateRetention`] window (applied to the state
/// object and validation counters) and the lock TTL (refreshed on every
/// save while a worker makes progress).
pub struct PipelineStateStore {
    cache: Arc<dyn Cache>,
    retention: StateRetention,
    lock_ttl: Duration,
}

impl PipelineStateStore {
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>, retention: StateRetention, lock_ttl: Duration) -> Self {
        Self {
            cache,
            retention,
            lock_ttl,
        }
    }

    #[must_use]
    pub fn retention(&self) -> StateRetention {
        self.retention
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Persist the state under the retention window.
    ///
    /// The caller is responsible for verifying lock ownership first; the
    /// store writes whatever it is handed.
    #[instrument(skip(self, state), fields(report_id = %state.report_id), err)]
    pub async fn save(&self, state: &PipelineState) -> Result<()> {
        let json =
            serde_json::to_string(state).map_err(|source| StoreError::Serialize { source })?;
        self.cache
            .set(&keys::state(&state.report_id), &json, Some(self.retention.0))
            .await?;
        debug!(bytes = json.len(), "state saved");
        Ok(())
    }

    /// Load and validate a report's state.
    #[instrument(skip(self), err)]
    pub async fn get(&self, report_id: &str) -> Result<StateLoad> {
        let Some(raw) = self.cache.get(&keys::state(report_id)).await? else {
            return Ok(StateLoad::Missing);
        };
        match serde_json::from_str::<PipelineState>(&raw) {
            Ok(state) if state.schema_version != SCHEMA_VERSION => {
                warn!(
                    found = state.schema_version,
                    expected = SCHEMA_VERSION,
                    "state schema version mismatch"
                );
                Ok(StateLoad::Invalid {
                    reason: format!(
                        "schema version {} (expected {})",
                        state.schema_version, SCHEMA_VERSION
                    ),
                })
            }
            Ok(state) if state.report_id != report_id => Ok(StateLoad::Invalid {
                reason: format!(
                    "state belongs to report '{}' but was stored under '{report_id}'",
                    state.report_id
                ),
            }),
            Ok(state) => Ok(StateLoad::Valid(Box::new(state))),
            Err(e) => {
                warn!(error = %e, "persisted state failed schema validation");
                Ok(StateLoad::Invalid {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Try to take the report lock. `true` iff this call created it.
    pub async fn acquire_pipeline_lock(&self, report_id: &str, token: &str) -> Result<bool> {
        Ok(self
            .cache
            .acquire_lock(&keys::lock(report_id), token, self.lock_ttl)
            .await?)
    }

    /// Release the report lock iff `token` still owns it.
    pub async fn release_pipeline_lock(&self, report_id: &str, token: &str) -> Result<bool> {
        Ok(self
            .cache
            .release_lock(&keys::lock(report_id), token)
            .await?)
    }

    /// Refresh the lock TTL iff `token` still owns it.
    pub async fn extend_pipeline_lock(&self, report_id: &str, token: &str) -> Result<bool> {
        Ok(self
            .cache
            .extend_lock(&keys::lock(report_id), token, self.lock_ttl)
            .await?)
    }

    /// Whether the lock currently holds exactly `token`. Checked before
    /// every save so a worker whose TTL lapsed cannot clobber a successor.
    pub async fn verify_lock_ownership(&self, report_id: &str, token: &str) -> Result<bool> {
        let current = self.cache.get(&keys::lock(report_id)).await?;
        Ok(current.as_deref() == Some(token))
    }

    /// Bump the validation-failure counter for `(report, step)` and return
    /// the post-increment value. The counter carries the retention window.
    pub async fn increment_validation_failure(&self, report_id: &str, step: &str) -> Result<i64> {
        Ok(self
            .cache
            .increment(
                &keys::validation_failure(report_id, step),
                Some(self.retention.0),
            )
            .await?)
    }
}
