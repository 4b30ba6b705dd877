//! Shared store trait and error types

use crate::clock::Millis;
use crate::state::{DomainState, FrontierEntry, RetryState};
use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur talking to the shared store
///
/// Any of these invalidates the guarantees the scheduler relies on, so the worker pool
/// treats them as fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Corrupt store record: {0}")]
    Corrupt(String),

    #[error("Blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result of an atomic per-domain reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns the current politeness window and may fetch now
    Ready,

    /// Another request holds the window; retry no earlier than `until`
    Deferred { until: Millis },
}

impl Reservation {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Atomic operations over the crawl state shared by every worker
///
/// Each method is a single indivisible operation on the backend. Callers never combine a
/// read with a later write to implement a guarantee; if a guarantee needs both, it lives
/// in one method here.
#[async_trait]
pub trait SharedStore: Send + Sync {
    // ===== Frontier and dedup =====

    /// Adds `entry.url` to the seen set and, only if it was not already there, adds the
    /// entry to the frontier. Returns whether the URL was newly admitted.
    async fn admit(&self, entry: &FrontierEntry) -> StoreResult<bool>;

    /// Puts an already-admitted URL back into the frontier, replacing any queued copy
    async fn requeue(&self, entry: &FrontierEntry) -> StoreResult<()>;

    /// Removes and returns the smallest entry with `ready_at <= now`
    async fn pop_ready(&self, now: Millis) -> StoreResult<Option<FrontierEntry>>;

    /// Number of entries currently queued
    async fn frontier_len(&self) -> StoreResult<u64>;

    async fn is_seen(&self, url: &str) -> StoreResult<bool>;

    /// Number of URLs ever admitted
    async fn seen_count(&self) -> StoreResult<u64>;

    // ===== Domains =====

    /// Compare-and-advance on the domain's next-allowed time
    ///
    /// If there is no record or `now >= next_allowed_at`, sets it to `now + cooldown_ms`
    /// and returns `Ready`; otherwise leaves it untouched and returns `Deferred`.
    async fn reserve_domain(
        &self,
        domain: &str,
        now: Millis,
        cooldown_ms: Millis,
    ) -> StoreResult<Reservation>;

    async fn domain_state(&self, domain: &str) -> StoreResult<Option<DomainState>>;

    /// Stores robots.txt content for a domain without touching its politeness window
    async fn record_robots(
        &self,
        domain: &str,
        rules: &str,
        fetched_at: Millis,
        expires_at: Millis,
    ) -> StoreResult<()>;

    // ===== Locks =====

    /// Sets `name` if it is absent or expired. Returns whether the caller now holds it.
    async fn try_lock(&self, name: &str, now: Millis, ttl_ms: Millis) -> StoreResult<bool>;

    async fn release_lock(&self, name: &str) -> StoreResult<()>;

    // ===== Counters =====

    /// Increments a named counter and returns the new value
    async fn incr(&self, name: &str) -> StoreResult<i64>;

    async fn counter(&self, name: &str) -> StoreResult<i64>;

    async fn reset_counter(&self, name: &str) -> StoreResult<()>;

    // ===== Retries =====

    /// Increments the attempt count for a URL and records the error label
    async fn bump_attempts(&self, url: &str, error: &str) -> StoreResult<RetryState>;

    async fn clear_attempts(&self, url: &str) -> StoreResult<()>;

    // ===== Maintenance =====

    /// Drops all crawl state: frontier, seen set, domains, locks, counters and retries
    async fn clear(&self) -> StoreResult<()>;
}
