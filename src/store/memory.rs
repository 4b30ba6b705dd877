//! In-process shared store
//!
//! Every operation runs inside one critical section over the whole state, which makes
//! each of them atomic with respect to the others.

use crate::clock::Millis;
use crate::state::{DomainState, FrontierEntry, RetryState};
use crate::store::traits::{Reservation, SharedStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    frontier: BTreeSet<FrontierEntry>,
    queued: HashMap<String, FrontierEntry>,
    seen: HashSet<String>,
    domains: HashMap<String, DomainState>,
    locks: HashMap<String, Millis>,
    counters: HashMap<String, i64>,
    retries: HashMap<String, RetryState>,
}

impl Inner {
    fn enqueue(&mut self, entry: FrontierEntry) {
        if let Some(previous) = self.queued.insert(entry.url.clone(), entry.clone()) {
            self.frontier.remove(&previous);
        }
        self.frontier.insert(entry);
    }
}

/// Shared store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn admit(&self, entry: &FrontierEntry) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        if !inner.seen.insert(entry.url.clone()) {
            return Ok(false);
        }
        inner.enqueue(entry.clone());
        Ok(true)
    }

    async fn requeue(&self, entry: &FrontierEntry) -> StoreResult<()> {
        self.lock()?.enqueue(entry.clone());
        Ok(())
    }

    async fn pop_ready(&self, now: Millis) -> StoreResult<Option<FrontierEntry>> {
        let mut inner = self.lock()?;
        let next = match inner.frontier.first() {
            Some(first) if first.ready_at <= now => first.clone(),
            _ => return Ok(None),
        };
        inner.frontier.remove(&next);
        inner.queued.remove(&next.url);
        Ok(Some(next))
    }

    async fn frontier_len(&self) -> StoreResult<u64> {
        Ok(self.lock()?.frontier.len() as u64)
    }

    async fn is_seen(&self, url: &str) -> StoreResult<bool> {
        Ok(self.lock()?.seen.contains(url))
    }

    async fn seen_count(&self) -> StoreResult<u64> {
        Ok(self.lock()?.seen.len() as u64)
    }

    async fn reserve_domain(
        &self,
        domain: &str,
        now: Millis,
        cooldown_ms: Millis,
    ) -> StoreResult<Reservation> {
        let mut inner = self.lock()?;
        let state = inner
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(domain));

        if state.can_request(now) {
            state.next_allowed_at = now.saturating_add(cooldown_ms);
            Ok(Reservation::Ready)
        } else {
            Ok(Reservation::Deferred {
                until: state.next_allowed_at,
            })
        }
    }

    async fn domain_state(&self, domain: &str) -> StoreResult<Option<DomainState>> {
        Ok(self.lock()?.domains.get(domain).cloned())
    }

    async fn record_robots(
        &self,
        domain: &str,
        rules: &str,
        fetched_at: Millis,
        expires_at: Millis,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let state = inner
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainState::new(domain));
        state.robots_rules = Some(rules.to_string());
        state.robots_fetched_at = Some(fetched_at);
        state.robots_expires_at = Some(expires_at);
        Ok(())
    }

    async fn try_lock(&self, name: &str, now: Millis, ttl_ms: Millis) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner.locks.get(name) {
            Some(&expires_at) if expires_at > now => Ok(false),
            _ => {
                inner
                    .locks
                    .insert(name.to_string(), now.saturating_add(ttl_ms));
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        self.lock()?.locks.remove(name);
        Ok(())
    }

    async fn incr(&self, name: &str) -> StoreResult<i64> {
        let mut inner = self.lock()?;
        let value = inner.counters.entry(name.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn counter(&self, name: &str) -> StoreResult<i64> {
        Ok(self.lock()?.counters.get(name).copied().unwrap_or(0))
    }

    async fn reset_counter(&self, name: &str) -> StoreResult<()> {
        self.lock()?.counters.remove(name);
        Ok(())
    }

    async fn bump_attempts(&self, url: &str, error: &str) -> StoreResult<RetryState> {
        let mut inner = self.lock()?;
        let state = inner
            .retries
            .entry(url.to_string())
            .or_insert_with(|| RetryState {
                url: url.to_string(),
                attempts: 0,
                last_error: String::new(),
            });
        state.attempts += 1;
        state.last_error = error.to_string();
        Ok(state.clone())
    }

    async fn clear_attempts(&self, url: &str) -> StoreResult<()> {
        self.lock()?.retries.remove(url);
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        *self.lock()? = Inner::default();
        Ok(())
    }
}
