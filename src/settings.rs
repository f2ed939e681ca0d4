//! Worker configuration knobs, resolved once at startup.
//!
//! Nothing else in the crate reads the environment; the resolved
//! [`WorkerSettings`] value travels explicitly through the runner and the
//! stage context.

use std::time::Duration;

/// Environment variable names, kept together so operators can grep one place.
pub const ENV_STATE_RETENTION_SECONDS: &str = "STATE_RETENTION_SECONDS";
pub const ENV_LOCK_TTL_SECONDS: &str = "LOCK_TTL_SECONDS";
pub const ENV_MAX_VALIDATION_FAILURES: &str = "MAX_VALIDATION_FAILURES";
pub const ENV_BATCH_SIZE: &str = "BATCH_SIZE";
pub const ENV_MAX_CONCURRENT_SUBTOPICS: &str = "MAX_CONCURRENT_SUBTOPICS";

/// Tunable limits for one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// TTL applied to every `pipeline_*` key so stale reports are reclaimed.
    pub state_retention: Duration,
    /// Report lock TTL; refreshed at each save, and an implicit stage
    /// timeout — a worker that outlives it fails the next save gate.
    pub lock_ttl: Duration,
    /// Validation failures tolerated before a state is marked permanently
    /// corrupted.
    pub max_validation_failures: i64,
    /// Claims-stage fanout: comments processed concurrently per batch.
    pub batch_size: usize,
    /// Dedupe/summary fanout: subtopics (or topics) in flight at once.
    pub max_concurrent_subtopics: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            state_retention: Duration::from_secs(86_400),
            lock_ttl: Duration::from_secs(300),
            max_validation_failures: 3,
            batch_size: 10,
            max_concurrent_subtopics: 6,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

impl WorkerSettings {
    /// Resolve settings from the environment (a `.env` file is honored),
    /// falling back to the defaults above for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            state_retention: env_parse::<u64>(ENV_STATE_RETENTION_SECONDS)
                .map(Duration::from_secs)
                .unwrap_or(defaults.state_retention),
            lock_ttl: env_parse::<u64>(ENV_LOCK_TTL_SECONDS)
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            max_validation_failures: env_parse(ENV_MAX_VALIDATION_FAILURES)
                .unwrap_or(defaults.max_validation_failures),
            batch_size: env_parse(ENV_BATCH_SIZE).unwrap_or(defaults.batch_size),
            max_concurrent_subtopics: env_parse(ENV_MAX_CONCURRENT_SUBTOPICS)
                .unwrap_or(defaults.max_concurrent_subtopics),
        }
    }

    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_state_retention(mut self, retention: Duration) -> Self {
        self.state_retention = retention;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_subtopics(mut self, limit: usize) -> Self {
        self.max_concurrent_subtopics = limit;
        self
    }

    #[must_use]
    pub fn with_max_validation_failures(mut self, limit: i64) -> Self {
        self.max_validation_failures = limit;
        self
    }
}
