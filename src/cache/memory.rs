//! Process-local cache backend for tests and single-worker runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{Cache, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// `None` means the entry never expires.
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`Cache`] with TTL support.
///
/// Expiry is evaluated lazily against `tokio::time`, so tests running under
/// `tokio::time::pause` can advance the clock deterministically instead of
/// sleeping. One mutex guards the whole table; every compound lock/counter
/// transition happens under a single acquisition, which satisfies the trait's
/// atomicity contract within a process.
#[derive(Default)]
pub struct InMemoryCache {
    inner: Mutex<FxHashMap<String, Entry>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FxHashMap::default()),
        }
    }

    fn live_value(map: &mut FxHashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match map.get(key) {
            Some(entry) if entry.expired(now) => {
                map.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.inner.lock();
        Ok(Self::live_value(&mut map, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self.inner.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().remove(key);
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.inner.lock();
        if Self::live_value(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: token.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.inner.lock();
        match Self::live_value(&mut map, key, now) {
            Some(current) if current == token => {
                map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.inner.lock();
        match Self::live_value(&mut map, key, now) {
            Some(current) if current == token => {
                if let Some(entry) = map.get_mut(key) {
                    entry.expires_at = Some(now + ttl);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let now = Instant::now();
        let mut map = self.inner.lock();
        let current = Self::live_value(&mut map, key, now)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        map.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(next)
    }
}
