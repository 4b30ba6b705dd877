//! Store-backed robots.txt cache
//!
//! Rules live in each domain's record in the shared store so every worker, in any
//! process, sees the same copy. Fetches are coalesced through a per-domain lock.

use crate::clock::{duration_ms, Clock};
use crate::robots::ParsedRobots;
use crate::store::{SharedStore, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Whether robots.txt lets us fetch a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsVerdict {
    Allowed,
    Disallowed,
    /// No rules cached, or the cached rules have expired
    Unknown,
}

/// Fresh rules for one domain as read from the store, if any
pub struct RobotsLookup<'a> {
    cache: &'a RobotsCache,
    rules: Option<ParsedRobots>,
}

impl RobotsLookup<'_> {
    pub fn verdict(&self, url: &str) -> RobotsVerdict {
        match &self.rules {
            None => RobotsVerdict::Unknown,
            Some(rules) if rules.is_allowed(url, &self.cache.crawler_name) => {
                RobotsVerdict::Allowed
            }
            Some(_) => RobotsVerdict::Disallowed,
        }
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.rules
            .as_ref()
            .and_then(|rules| rules.crawl_delay(&self.cache.crawler_name))
    }
}

/// Robots rules cache over the shared store
#[derive(Clone)]
pub struct RobotsCache {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    crawler_name: String,
    ttl: Duration,
    lock_ttl: Duration,
}

fn lock_name(domain: &str) -> String {
    format!("robots:{}", domain)
}

fn failure_counter(domain: &str) -> String {
    format!("robots_failures:{}", domain)
}

impl RobotsCache {
    /// Creates a cache matching rules against `crawler_name`
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        crawler_name: impl Into<String>,
        ttl: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            crawler_name: crawler_name.into(),
            ttl,
            lock_ttl,
        }
    }

    /// How long recorded rules stay valid
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reads the cached rules for `domain` once
    ///
    /// The returned lookup answers both the verdict and the crawl delay without going
    /// back to the store.
    pub async fn lookup(&self, domain: &str) -> StoreResult<RobotsLookup<'_>> {
        let now = self.clock.now_ms();
        let state = self.store.domain_state(domain).await?;
        let rules = state
            .as_ref()
            .and_then(|s| s.fresh_robots(now))
            .map(ParsedRobots::from_content);
        Ok(RobotsLookup { cache: self, rules })
    }

    /// Checks `url` (full URL or path) against the cached rules for `domain`
    pub async fn is_allowed(&self, domain: &str, url: &str) -> StoreResult<RobotsVerdict> {
        Ok(self.lookup(domain).await?.verdict(url))
    }

    /// Crawl-delay from the cached rules, if any are cached
    pub async fn crawl_delay(&self, domain: &str) -> StoreResult<Option<Duration>> {
        Ok(self.lookup(domain).await?.crawl_delay())
    }

    /// Stores robots.txt content for `domain`, valid for `ttl`
    ///
    /// Empty content allows everything. Resets the domain's fetch-failure count.
    pub async fn record(&self, domain: &str, rules: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now_ms();
        self.store
            .record_robots(domain, rules, now, now.saturating_add(duration_ms(ttl)))
            .await?;
        self.store.reset_counter(&failure_counter(domain)).await?;
        debug!(domain, bytes = rules.len(), "Recorded robots.txt");
        Ok(())
    }

    /// Tries to become the one worker fetching robots.txt for `domain`
    pub async fn begin_fetch(&self, domain: &str) -> StoreResult<bool> {
        self.store
            .try_lock(
                &lock_name(domain),
                self.clock.now_ms(),
                duration_ms(self.lock_ttl),
            )
            .await
    }

    pub async fn end_fetch(&self, domain: &str) -> StoreResult<()> {
        self.store.release_lock(&lock_name(domain)).await
    }

    /// Records a failed robots.txt fetch (network error or 5xx)
    ///
    /// The first failure leaves the domain unknown so the next claim tries again. The
    /// second records allow-all rules for the normal TTL. Returns true when that happened.
    pub async fn record_fetch_failure(&self, domain: &str) -> StoreResult<bool> {
        let failures = self.store.incr(&failure_counter(domain)).await?;
        if failures < 2 {
            debug!(domain, failures, "robots.txt fetch failed, will retry");
            return Ok(false);
        }

        warn!(domain, failures, "Allowed by default after one retry");
        self.record(domain, "", self.ttl).await?;
        Ok(true)
    }
}
