//! Worker pipeline
//!
//! One iteration: claim → politeness → robots → fetch → classify → parse → emit. Every
//! decision that other workers depend on goes through the shared store; a worker only
//! holds what it needs for the URL in hand.

use crate::clock::{duration_ms, Clock, Millis};
use crate::config::Config;
use crate::crawler::fetcher::{FetchError, FetchResponse, Fetcher};
use crate::crawler::frontier::{Claim, Frontier};
use crate::crawler::parser::{HtmlLinkExtractor, LinkExtractor};
use crate::crawler::politeness::{PolitenessTracker, Reservation};
use crate::crawler::pool::StopHandle;
use crate::crawler::retry::{ErrorKind, RetryPolicy};
use crate::output::{MetricsSink, OutcomeEvent};
use crate::robots::{RobotsCache, RobotsVerdict};
use crate::state::{FrontierEntry, Outcome};
use crate::storage::{PageDocument, PageStore};
use crate::store::SharedStore;
use crate::url::{extract_domain, robots_url, AllowedDomains};
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Store counter of successful fetches
pub const PAGES_FETCHED_COUNTER: &str = "metrics:pages_fetched";

/// Store counter of URLs skipped because robots.txt disallowed them
pub const ROBOTS_BLOCKED_COUNTER: &str = "metrics:robots_blocked";

/// Per-request limits and link filters applied by every worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub request_timeout: Duration,
    pub max_content_size: usize,
    pub idle_poll: Duration,
    pub robots_wait: Duration,
    pub max_depth: Option<u32>,
    pub allowed_domains: AllowedDomains,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.crawler.request_timeout(),
            max_content_size: config.crawler.max_content_size_bytes,
            idle_poll: config.crawler.idle_poll(),
            robots_wait: config.robots.wait(),
            max_depth: config.crawler.max_depth,
            allowed_domains: AllowedDomains::new(&config.crawler.allowed_domains),
        }
    }
}

/// Handles shared by all workers of a pool
#[derive(Clone)]
pub struct WorkerContext {
    pub frontier: Frontier,
    pub politeness: PolitenessTracker,
    pub robots: RobotsCache,
    pub retry: RetryPolicy,
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn LinkExtractor>,
    pub pages: Arc<dyn PageStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub settings: Arc<WorkerSettings>,
}

impl WorkerContext {
    /// Wires the scheduler components over `store` from the configuration
    pub fn from_config(
        config: &Config,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        fetcher: Arc<dyn Fetcher>,
        pages: Arc<dyn PageStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            frontier: Frontier::new(store.clone(), clock.clone()),
            politeness: PolitenessTracker::new(
                store.clone(),
                config.crawler.domain_cooldown(),
                config.robots.max_crawl_delay(),
            ),
            robots: RobotsCache::new(
                store,
                clock,
                config.user_agent.crawler_name.clone(),
                config.robots.ttl(),
                config.robots.lock_ttl(),
            ),
            retry: RetryPolicy::from_config(&config.retry),
            fetcher,
            extractor: Arc::new(HtmlLinkExtractor),
            pages,
            metrics,
            settings: Arc::new(WorkerSettings::from_config(config)),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn LinkExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    fn store(&self) -> &Arc<dyn SharedStore> {
        self.frontier.store()
    }

    fn now(&self) -> Millis {
        self.frontier.clock().now_ms()
    }
}

/// Counts kept by one worker over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub claimed: u64,
    pub fetched: u64,
    /// Claims put back for politeness or robots.txt
    pub deferred: u64,
    pub retried: u64,
    /// 3xx answers whose target went back to the frontier
    pub redirected: u64,
    /// Terminal failures and robots.txt skips
    pub terminal: u64,
}

/// How one iteration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing in the frontier was ready
    Idle,

    /// The claim went back to the frontier without a fetch
    Deferred,

    /// The claim was fetched or skipped
    Done(Outcome),
}

/// A single crawl worker
pub struct Worker {
    id: usize,
    ctx: WorkerContext,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        Self {
            id,
            ctx,
            stats: WorkerStats {
                worker_id: id,
                ..WorkerStats::default()
            },
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Runs iterations until `stop` is raised or a store operation fails
    ///
    /// The flag is only checked between iterations.
    pub async fn run(mut self, stop: StopHandle) -> Result<WorkerStats> {
        debug!(worker = self.id, "Worker started");

        while !stop.is_stopped() {
            let step = {
                let _active = stop.enter();
                self.step().await
            };

            match step {
                Ok(Step::Idle) => tokio::time::sleep(self.ctx.settings.idle_poll).await,
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(worker = self.id, error = %e, "Worker stopping on store failure");
                    return Err(e);
                }
                Err(e) => warn!(worker = self.id, error = %e, "Iteration failed"),
            }
        }

        debug!(worker = self.id, stats = ?self.stats, "Worker stopped");
        Ok(self.stats)
    }

    /// Claims one ready URL and takes it through the pipeline
    pub async fn step(&mut self) -> Result<Step> {
        let Some(claim) = self.ctx.frontier.claim_next(self.id).await? else {
            return Ok(Step::Idle);
        };
        self.stats.claimed += 1;
        self.process(claim).await
    }

    async fn process(&mut self, claim: Claim) -> Result<Step> {
        let started = Instant::now();
        let entry = &claim.entry;

        let url = match Url::parse(&entry.url) {
            Ok(url) => url,
            Err(e) => {
                let error = FetchError::new(ErrorKind::Malformed, e.to_string());
                return self.fail(entry, "", error, started).await;
            }
        };
        let Some(domain) = extract_domain(&url) else {
            let error = FetchError::new(ErrorKind::Malformed, "URL has no host");
            return self.fail(entry, "", error, started).await;
        };

        let (verdict, crawl_delay) = {
            let robots = self.ctx.robots.lookup(&domain).await?;
            (robots.verdict(url.as_str()), robots.crawl_delay())
        };
        let cooldown = self.ctx.politeness.effective_cooldown(crawl_delay);

        // Nothing but the fetch itself sits between the reservation and the request
        let now = self.ctx.now();
        if let Reservation::Deferred { until } = self
            .ctx
            .politeness
            .check_and_reserve(&domain, now, cooldown)
            .await?
        {
            trace!(worker = self.id, url = %entry.url, until, "Domain cooling down");
            return self.defer(entry, until).await;
        }

        match verdict {
            RobotsVerdict::Allowed => {}
            RobotsVerdict::Disallowed => {
                self.ctx.store().incr(ROBOTS_BLOCKED_COUNTER).await?;
                self.ctx.store().clear_attempts(&entry.url).await?;
                debug!(worker = self.id, url = %entry.url, "Blocked by robots.txt");
                self.stats.terminal += 1;
                self.emit(entry, 0, None, started, Outcome::RobotsBlocked);
                return Ok(Step::Done(Outcome::RobotsBlocked));
            }
            RobotsVerdict::Unknown => {
                // The robots.txt request uses this claim's politeness window
                let not_before = if self.ctx.robots.begin_fetch(&domain).await? {
                    let fetched = self.refresh_robots(&url, &domain).await;
                    self.ctx.robots.end_fetch(&domain).await?;
                    fetched?;
                    now.saturating_add(duration_ms(cooldown))
                } else {
                    now.saturating_add(duration_ms(self.ctx.settings.robots_wait))
                };
                return self.defer(entry, not_before).await;
            }
        }

        let settings = &self.ctx.settings;
        let response = self
            .ctx
            .fetcher
            .fetch(&url, settings.request_timeout, settings.max_content_size)
            .await;

        match response {
            Ok(response) if response.is_redirect() => {
                self.redirect(&claim, &url, &domain, response, started).await
            }
            Ok(response) => match classify_response(response) {
                Ok(response) => self.succeed(&claim, &url, &domain, response, started).await,
                Err(error) => self.fail(entry, &domain, error, started).await,
            },
            Err(error) => self.fail(entry, &domain, error, started).await,
        }
    }

    /// Fetches and records robots.txt for `domain`; the caller holds the fetch lock
    async fn refresh_robots(&self, url: &Url, domain: &str) -> Result<()> {
        let robots = &self.ctx.robots;

        let location = match robots_url(url) {
            Ok(location) => location,
            Err(e) => {
                debug!(domain, error = %e, "No robots.txt location");
                robots.record_fetch_failure(domain).await?;
                return Ok(());
            }
        };

        let settings = &self.ctx.settings;
        match self
            .ctx
            .fetcher
            .fetch(&location, settings.request_timeout, settings.max_content_size)
            .await
        {
            Ok(response) if response.is_success() => {
                robots.record(domain, &response.body, robots.ttl()).await?;
            }
            Ok(response) if (400..500).contains(&response.status) => {
                debug!(domain, status = response.status, "No robots.txt, allowing all");
                robots.record(domain, "", robots.ttl()).await?;
            }
            Ok(response) => {
                debug!(domain, status = response.status, "robots.txt fetch failed");
                robots.record_fetch_failure(domain).await?;
            }
            Err(e) => {
                debug!(domain, error = %e, "robots.txt fetch failed");
                robots.record_fetch_failure(domain).await?;
            }
        }

        Ok(())
    }

    async fn defer(&mut self, entry: &FrontierEntry, not_before: Millis) -> Result<Step> {
        self.ctx.frontier.requeue(entry, not_before).await?;
        self.stats.deferred += 1;
        Ok(Step::Deferred)
    }

    async fn succeed(
        &mut self,
        claim: &Claim,
        url: &Url,
        domain: &str,
        response: FetchResponse,
        started: Instant,
    ) -> Result<Step> {
        let entry = &claim.entry;
        self.ctx.store().clear_attempts(&entry.url).await?;

        let parsed = self.ctx.extractor.extract_links(url, &response.body);
        let admitted = self.enqueue_links(entry, &parsed.links).await?;

        let doc = PageDocument {
            url: entry.url.clone(),
            domain: domain.to_string(),
            title: parsed.title,
            links: parsed.links,
            status: response.status,
            content_type: response.content_type().map(str::to_string),
            html: response.body,
            error_kind: None,
            fetched_at: self.ctx.now(),
        };
        self.save(&doc).await;

        self.ctx.store().incr(PAGES_FETCHED_COUNTER).await?;
        self.stats.fetched += 1;

        debug!(
            worker = claim.token.worker_id,
            url = %claim.token.url,
            claimed_at = claim.token.claimed_at,
            status = doc.status,
            links = doc.links.len(),
            admitted,
            "Fetched"
        );
        self.emit(entry, doc.status, None, started, Outcome::Fetched);
        Ok(Step::Done(Outcome::Fetched))
    }

    /// Records a 3xx and hands its target back to the frontier at the same depth
    ///
    /// The target is claimed later like any other URL, so it gets its own politeness
    /// reservation and robots.txt check.
    async fn redirect(
        &mut self,
        claim: &Claim,
        url: &Url,
        domain: &str,
        response: FetchResponse,
        started: Instant,
    ) -> Result<Step> {
        let entry = &claim.entry;
        let location = response.location().unwrap_or_default();
        let target = match url.join(location) {
            Ok(target) => target,
            Err(e) => {
                let error = FetchError::new(
                    ErrorKind::Malformed,
                    format!("HTTP {} to bad location {:?}: {}", response.status, location, e),
                );
                return self.fail(entry, domain, error, started).await;
            }
        };

        self.ctx.store().clear_attempts(&entry.url).await?;
        let admitted = self.admit_link(target.as_str(), entry.priority).await?;

        let doc = PageDocument {
            url: entry.url.clone(),
            domain: domain.to_string(),
            title: None,
            html: String::new(),
            links: vec![target.to_string()],
            status: response.status,
            content_type: response.content_type().map(str::to_string),
            error_kind: None,
            fetched_at: self.ctx.now(),
        };
        self.save(&doc).await;

        self.stats.redirected += 1;
        debug!(
            worker = self.id,
            url = %entry.url,
            status = response.status,
            target = %target,
            admitted,
            "Redirected"
        );
        self.emit(entry, response.status, None, started, Outcome::Redirected);
        Ok(Step::Done(Outcome::Redirected))
    }

    /// Applies the retry policy to a failed fetch
    async fn fail(
        &mut self,
        entry: &FrontierEntry,
        domain: &str,
        error: FetchError,
        started: Instant,
    ) -> Result<Step> {
        let store = self.ctx.store();

        if error.kind.is_transient() {
            let state = store.bump_attempts(&entry.url, &error.to_string()).await?;
            let decision = self.ctx.retry.decide(state.attempts, error.kind);

            if decision.retry {
                let not_before = self
                    .ctx
                    .now()
                    .saturating_add(duration_ms(decision.delay));
                self.ctx.frontier.requeue(entry, not_before).await?;
                self.stats.retried += 1;

                debug!(
                    worker = self.id,
                    url = %entry.url,
                    attempts = state.attempts,
                    delay_ms = duration_ms(decision.delay),
                    error = %error,
                    "Retrying"
                );
                let status = error.kind.status().unwrap_or(0);
                self.emit(entry, status, Some(error.kind), started, Outcome::Retrying);
                return Ok(Step::Done(Outcome::Retrying));
            }

            info!(url = %entry.url, attempts = state.attempts, error = %error, "Giving up");
        } else {
            debug!(worker = self.id, url = %entry.url, error = %error, "Permanent failure");
        }

        store.clear_attempts(&entry.url).await?;

        let doc = PageDocument {
            url: entry.url.clone(),
            domain: domain.to_string(),
            title: None,
            html: String::new(),
            links: Vec::new(),
            status: 0,
            content_type: None,
            error_kind: Some(error.kind.to_string()),
            fetched_at: self.ctx.now(),
        };
        self.save(&doc).await;

        self.stats.terminal += 1;
        self.emit(entry, 0, Some(error.kind), started, Outcome::Failed);
        Ok(Step::Done(Outcome::Failed))
    }

    /// Admits discovered links one level deeper than `parent`
    async fn enqueue_links(&self, parent: &FrontierEntry, links: &[String]) -> Result<usize> {
        let settings = &self.ctx.settings;
        let depth = parent.priority.saturating_add(1);

        if settings.max_depth.is_some_and(|max| depth > max) {
            trace!(url = %parent.url, depth, "Max depth reached, links not followed");
            return Ok(0);
        }

        let mut admitted = 0;
        for link in links {
            if self.admit_link(link, depth).await? {
                admitted += 1;
            }
        }

        Ok(admitted)
    }

    /// Inserts one link if its domain is allowed; true when it was new
    async fn admit_link(&self, link: &str, depth: u32) -> Result<bool> {
        let allowed = Url::parse(link)
            .ok()
            .as_ref()
            .and_then(extract_domain)
            .is_some_and(|domain| self.ctx.settings.allowed_domains.allows(&domain));
        if !allowed {
            trace!(link, "Outside allowed domains");
            return Ok(false);
        }

        match self.ctx.frontier.insert(link, depth, 0).await {
            Ok(admitted) => Ok(admitted),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                trace!(link, error = %e, "Link rejected");
                Ok(false)
            }
        }
    }

    async fn save(&self, doc: &PageDocument) {
        if let Err(e) = self.ctx.pages.save(doc).await {
            warn!(url = %doc.url, error = %e, "Failed to store page");
        }
    }

    fn emit(
        &self,
        entry: &FrontierEntry,
        status: u16,
        error_kind: Option<ErrorKind>,
        started: Instant,
        outcome: Outcome,
    ) {
        self.ctx.metrics.record(OutcomeEvent {
            url: entry.url.clone(),
            status,
            error_kind,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome,
        });
    }
}

/// Turns non-2xx and non-HTML responses into failures
fn classify_response(response: FetchResponse) -> std::result::Result<FetchResponse, FetchError> {
    if !response.is_success() {
        return Err(FetchError::new(
            ErrorKind::from_status(response.status),
            format!("HTTP {}", response.status),
        ));
    }

    if !response.is_html() {
        return Err(FetchError::new(
            ErrorKind::DisallowedContentType,
            response.content_type().unwrap_or_default().to_string(),
        ));
    }

    Ok(response)
}
