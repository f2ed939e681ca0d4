//! Typed key-value operations with atomic lock and counter primitives.
//!
//! The [`Cache`] trait is the narrow waist between the pipeline and its
//! coordination store. Two implementations ship with the crate:
//!
//! * [`InMemoryCache`] — volatile, process-local. Fast, non-durable;
//!   suitable for tests and single-process runs.
//! * [`RedisCache`] — shared across the worker fleet (behind the default-on
//!   `redis-store` feature). Every lock operation rides a native Redis
//!   atomic primitive: `SET NX EX` for acquisition and server-side Lua
//!   scripts for compare-and-delete / compare-and-expire.
//!
//! # Atomicity contract
//!
//! `acquire_lock`, `release_lock`, `extend_lock`, and `increment` must be
//! atomic against arbitrary concurrent callers from *other processes*.
//! Implementations must never compose them from separate `get` + `set`
//! round-trips. The in-memory implementation satisfies this trivially by
//! holding one mutex across each compound transition.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

pub use memory::InMemoryCache;
#[cfg(feature = "redis-store")]
pub use redis::RedisCache;

use async_trait::async_trait;
use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// Errors from cache operations, wrapping the underlying transport failure.
#[derive(Debug, Error, Diagnostic)]
pub enum CacheError {
    /// Backend/transport error (connection refused, protocol error, …).
    #[error("cache backend error: {message}")]
    #[diagnostic(
        code(claimweave::cache::backend),
        help("Check KV store connectivity and credentials; backend message: {message}.")
    )]
    Backend { message: String },
}

impl CacheError {
    pub fn backend(message: impl Into<String>) -> Self {
        CacheError::Backend {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Shared KV operations used by the pipeline state store.
///
/// All values are UTF-8 strings; callers own (de)serialization. Keys are
/// namespaced by the caller (see [`crate::store::keys`]).
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a value, `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, with an optional time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically create `key = token` with a TTL iff no value exists.
    ///
    /// Returns `true` when the lock was taken by this call.
    async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Atomic compare-and-delete: release iff the current value equals
    /// `token`; otherwise a no-op returning `false`.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool>;

    /// Atomic compare-and-set-ttl: extend iff the current value equals
    /// `token`; otherwise a no-op returning `false`.
    async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Atomic increment returning the post-increment value. An absent key
    /// starts from 0. When `ttl` is given it is (re)applied in the same
    /// atomic step, so counters inherit the caller's retention window.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64>;
}
