//! Integration tests for the crawler
//!
//! Pipeline scenarios run workers step by step against a manual clock and a scripted
//! fetcher. The end-to-end tests use wiremock to serve a small site to the real
//! `HttpFetcher` and a full `WorkerPool`.

use async_trait::async_trait;
use driftnet::clock::{Clock, ManualClock, Millis, SystemClock};
use driftnet::config::{parse_config, Config};
use driftnet::crawler::{
    ErrorKind, FetchError, FetchResponse, Fetcher, HttpFetcher, Step, StopReason, Worker,
    WorkerContext, WorkerPool, ROBOTS_BLOCKED_COUNTER,
};
use driftnet::output::MetricsAggregator;
use driftnet::state::Outcome;
use driftnet::storage::{MemoryPageStore, PageStore};
use driftnet::store::{MemoryStore, SharedStore};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const START: Millis = 1_700_000_000_000;

fn test_config(cooldown_ms: u64, extra_crawler: &str, seeds: &[String]) -> Config {
    let seeds = seeds
        .iter()
        .map(|s| format!("\"{}\"", s))
        .collect::<Vec<_>>()
        .join(", ");

    parse_config(&format!(
        r#"
[crawler]
domain-cooldown-ms = {cooldown_ms}
idle-poll-ms = 10
request-timeout-secs = 5
seeds = [{seeds}]
{extra_crawler}

[retry]
max-attempts = 3
base-delay-ms = 100
max-delay-ms = 1000

[user-agent]
crawler-name = "TestBot"
crawler-version = "1.0"
contact-url = "https://example.com/about"
contact-email = "admin@example.com"

[store]
backend = "memory"

[output]
database-path = "./unused.db"
"#
    ))
    .expect("test config is valid")
}

/// What a scripted URL answers with
#[derive(Clone)]
enum Reply {
    Html(&'static str),
    Fail(ErrorKind),
}

/// Fetcher that answers from a script and records when each request happened
struct ScriptedFetcher {
    clock: Arc<ManualClock>,
    replies: Vec<(String, Reply)>,
    requests: Mutex<Vec<(String, Millis)>>,
}

impl ScriptedFetcher {
    fn new(clock: Arc<ManualClock>, replies: Vec<(&str, Reply)>) -> Self {
        Self {
            clock,
            replies: replies
                .into_iter()
                .map(|(url, reply)| (url.to_string(), reply))
                .collect(),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<(String, Millis)> {
        self.requests.lock().unwrap().clone()
    }

    fn request_times(&self, prefix: &str) -> Vec<Millis> {
        self.requests()
            .into_iter()
            .filter(|(url, _)| url.starts_with(prefix))
            .map(|(_, at)| at)
            .collect()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        url: &Url,
        _timeout: Duration,
        _max_bytes: usize,
    ) -> Result<FetchResponse, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), self.clock.now_ms()));

        let reply = self
            .replies
            .iter()
            .find(|(scripted, _)| scripted == url.as_str())
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(Reply::Html(body)) => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
                Ok(FetchResponse {
                    status: 200,
                    headers,
                    body: body.to_string(),
                })
            }
            Some(Reply::Fail(kind)) => Err(FetchError::new(kind, "scripted failure")),
            None => Ok(FetchResponse {
                status: 404,
                headers: HeaderMap::new(),
                body: String::new(),
            }),
        }
    }
}

struct Scenario {
    ctx: WorkerContext,
    clock: Arc<ManualClock>,
    fetcher: Arc<ScriptedFetcher>,
    store: Arc<MemoryStore>,
    pages: Arc<MemoryPageStore>,
    metrics: Arc<MetricsAggregator>,
}

fn scenario(config: &Config, replies: Vec<(&str, Reply)>) -> Scenario {
    let clock = Arc::new(ManualClock::new(START));
    let fetcher = Arc::new(ScriptedFetcher::new(clock.clone(), replies));
    let store = Arc::new(MemoryStore::new());
    let pages = Arc::new(MemoryPageStore::new());
    let metrics = Arc::new(MetricsAggregator::new());

    let ctx = WorkerContext::from_config(
        config,
        store.clone(),
        clock.clone(),
        fetcher.clone(),
        pages.clone(),
        metrics.clone(),
    );

    Scenario {
        ctx,
        clock,
        fetcher,
        store,
        pages,
        metrics,
    }
}

/// Steps every worker concurrently, advancing the clock whenever all of them were idle,
/// until the frontier is drained
async fn drive(scenario: &Scenario, mut workers: Vec<Worker>, tick: Duration) -> Vec<Worker> {
    for _ in 0..10_000 {
        let mut round = JoinSet::new();
        for mut worker in workers.drain(..) {
            round.spawn(async move {
                let step = worker.step().await.expect("store operations succeed");
                (worker, step)
            });
        }

        let mut all_idle = true;
        while let Some(joined) = round.join_next().await {
            let (worker, step) = joined.unwrap();
            all_idle &= step == Step::Idle;
            workers.push(worker);
        }

        if all_idle {
            if scenario.ctx.frontier.is_empty().await.unwrap() {
                return workers;
            }
            scenario.clock.advance(tick);
        }
    }
    panic!("frontier never drained");
}

async fn allow_all(scenario: &Scenario, domains: &[&str]) {
    for domain in domains {
        scenario
            .ctx
            .robots
            .record(domain, "", Duration::from_secs(3600))
            .await
            .unwrap();
    }
}

/// Scenario A: two URLs on one domain and one on another, three workers
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_politeness_across_concurrent_workers() {
    let config = test_config(2000, "", &[]);
    let s = scenario(
        &config,
        vec![
            ("https://a.com/one", Reply::Html("<p>one</p>")),
            ("https://a.com/two", Reply::Html("<p>two</p>")),
            ("https://b.com/", Reply::Html("<p>b</p>")),
        ],
    );
    allow_all(&s, &["a.com", "b.com"]).await;

    for url in ["https://a.com/one", "https://a.com/two", "https://b.com/"] {
        assert!(s.ctx.frontier.insert(url, 0, 0).await.unwrap());
    }

    let workers = (0..3).map(|id| Worker::new(id, s.ctx.clone())).collect();
    let workers = drive(&s, workers, Duration::from_millis(100)).await;

    // Every URL fetched exactly once
    let mut fetched: Vec<String> = s.fetcher.requests().into_iter().map(|(u, _)| u).collect();
    fetched.sort();
    assert_eq!(
        fetched,
        vec!["https://a.com/one", "https://a.com/two", "https://b.com/"]
    );

    let a_times = s.fetcher.request_times("https://a.com/");
    assert_eq!(a_times.len(), 2);
    assert!(
        (a_times[1] - a_times[0]).abs() >= 2000,
        "a.com fetched {}ms apart",
        (a_times[1] - a_times[0]).abs()
    );

    let fetched_by_workers: u64 = workers.iter().map(|w| w.stats().fetched).sum();
    assert_eq!(fetched_by_workers, 3);
    assert_eq!(s.pages.count_pages().await.unwrap(), 3);
}

/// Scenario B: a URL that always times out
#[tokio::test]
async fn test_timeouts_end_terminal_after_max_attempts() {
    let config = test_config(2000, "", &[]);
    let s = scenario(
        &config,
        vec![("https://slow.com/page", Reply::Fail(ErrorKind::Timeout))],
    );
    allow_all(&s, &["slow.com"]).await;
    s.ctx
        .frontier
        .insert("https://slow.com/page", 0, 0)
        .await
        .unwrap();

    let workers = drive(&s, vec![Worker::new(0, s.ctx.clone())], Duration::from_millis(100)).await;

    assert_eq!(s.fetcher.requests().len(), 3);

    let page = s
        .pages
        .get_page("https://slow.com/page")
        .await
        .unwrap()
        .expect("terminal failure is stored");
    assert_eq!(page.status, 0);
    assert_eq!(page.error_kind.as_deref(), Some("timeout"));

    // Attempts are discarded once the URL is terminal
    let attempts = s.store.bump_attempts("https://slow.com/page", "timeout").await.unwrap();
    assert_eq!(attempts.attempts, 1);

    let stats = workers[0].stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.terminal, 1);

    let now = chrono::Utc::now();
    let snapshot = s.metrics.snapshot(now, now).unwrap();
    assert_eq!(snapshot.status_counts.get("0"), Some(&1));
    assert_eq!(snapshot.error_kinds.get("timeout"), Some(&3));
}

/// Scenario C: robots.txt disallows the only URL
#[tokio::test]
async fn test_robots_disallow_skips_fetch() {
    let config = test_config(2000, "", &[]);
    let s = scenario(&config, vec![]);
    s.ctx
        .robots
        .record(
            "private.com",
            "User-agent: *\nDisallow: /secret\n",
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
    s.ctx
        .frontier
        .insert("https://private.com/secret/plans", 0, 0)
        .await
        .unwrap();

    let mut worker = Worker::new(0, s.ctx.clone());
    assert_eq!(
        worker.step().await.unwrap(),
        Step::Done(Outcome::RobotsBlocked)
    );
    assert_eq!(worker.step().await.unwrap(), Step::Idle);

    assert!(s.fetcher.requests().is_empty());
    assert_eq!(s.store.counter(ROBOTS_BLOCKED_COUNTER).await.unwrap(), 1);
    assert_eq!(s.pages.count_pages().await.unwrap(), 0);

    let now = chrono::Utc::now();
    assert_eq!(s.metrics.snapshot(now, now).unwrap().robots_blocked, 1);
}

/// Scenario D: the same URL inserted concurrently
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_insert_admits_once() {
    let config = test_config(2000, "", &[]);
    let s = scenario(&config, vec![]);

    let mut inserts = JoinSet::new();
    for variant in [
        "https://dup.com/page",
        "HTTPS://DUP.com:443/page/",
        "https://dup.com/page#top",
        "https://dup.com/./page",
    ] {
        let frontier = s.ctx.frontier.clone();
        inserts.spawn(async move { frontier.insert(variant, 0, 0).await.unwrap() });
    }

    let mut admitted = 0;
    while let Some(joined) = inserts.join_next().await {
        if joined.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(s.ctx.frontier.len().await.unwrap(), 1);
    assert_eq!(s.ctx.frontier.seen_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_robots_fetch_failure_allows_after_one_retry() {
    let config = test_config(2000, "", &[]);
    let s = scenario(
        &config,
        vec![
            ("https://down.com/robots.txt", Reply::Fail(ErrorKind::Connect)),
            ("https://down.com/", Reply::Html("<p>up</p>")),
        ],
    );
    s.ctx.frontier.insert("https://down.com/", 0, 0).await.unwrap();

    let mut worker = Worker::new(0, s.ctx.clone());
    assert_eq!(worker.step().await.unwrap(), Step::Deferred);
    s.clock.advance(Duration::from_secs(2));
    assert_eq!(worker.step().await.unwrap(), Step::Deferred);
    s.clock.advance(Duration::from_secs(2));
    assert_eq!(worker.step().await.unwrap(), Step::Done(Outcome::Fetched));

    let urls: Vec<String> = s.fetcher.requests().into_iter().map(|(u, _)| u).collect();
    assert_eq!(
        urls,
        vec![
            "https://down.com/robots.txt",
            "https://down.com/robots.txt",
            "https://down.com/",
        ]
    );
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/html")
}

fn live_context(config: &Config, pages: Arc<MemoryPageStore>) -> (WorkerContext, Arc<dyn SharedStore>) {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let ctx = WorkerContext::from_config(
        config,
        store.clone(),
        Arc::new(SystemClock),
        Arc::new(HttpFetcher::from_config(&config.user_agent).unwrap()),
        pages,
        Arc::new(MetricsAggregator::new()),
    );
    (ctx, store)
}

#[tokio::test]
async fn test_full_crawl_single_domain() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(
            r#"<html><head><title>Home</title></head><body>
            <a href="{base}/page1">Page 1</a>
            <a href="/page2#section">Page 2</a>
            <a href="/page1">Page 1 again</a>
            </body></html>"#
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page1"))
        .respond_with(html("<title>Page 1</title><a href=\"/\">home</a>".to_string()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page2"))
        .respond_with(html("<title>Page 2</title>".to_string()))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(20, "", &[format!("{}/", base)]);
    let pages = Arc::new(MemoryPageStore::new());
    let (ctx, store) = live_context(&config, pages.clone());
    for seed in &config.crawler.seeds {
        ctx.frontier.insert(seed, 0, 0).await.unwrap();
    }

    let report = tokio::time::timeout(
        Duration::from_secs(30),
        WorkerPool::new(ctx, 3).run(),
    )
    .await
    .expect("pool stops once idle")
    .unwrap();

    assert_eq!(report.stop_reason, StopReason::Idle);
    assert_eq!(report.pages_fetched, 3);
    assert_eq!(report.workers.len(), 3);
    assert_eq!(store.seen_count().await.unwrap(), 3);
    assert_eq!(pages.pages().unwrap().len(), 3);

    let home = pages.get_page(&format!("{}/", base)).await.unwrap().unwrap();
    assert_eq!(home.title.as_deref(), Some("Home"));
    assert_eq!(home.status, 200);
    assert_eq!(
        home.links,
        vec![format!("{}/page1", base), format!("{}/page2", base)]
    );
}

#[tokio::test]
async fn test_robots_txt_respect() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /admin"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(
            r#"<a href="/allowed">Allowed</a><a href="/admin">Admin</a>"#.to_string(),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/allowed"))
        .respond_with(html("<title>Allowed</title>".to_string()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin"))
        .respond_with(html("<title>Admin</title>".to_string()))
        .expect(0)
        .mount(&server)
        .await;

    let config = test_config(20, "", &[format!("{}/", base)]);
    let pages = Arc::new(MemoryPageStore::new());
    let (ctx, store) = live_context(&config, pages.clone());
    ctx.frontier.insert(&format!("{}/", base), 0, 0).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(30), WorkerPool::new(ctx, 2).run())
        .await
        .expect("pool stops once idle")
        .unwrap();

    assert_eq!(report.pages_fetched, 2);
    assert_eq!(store.counter(ROBOTS_BLOCKED_COUNTER).await.unwrap(), 1);
    assert!(pages
        .get_page(&format!("{}/admin", base))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_redirects_are_scheduled_not_followed() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /secret"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/go"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/secret/dir/page"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/secret/dir/page"))
        .respond_with(html("<title>S</title>".to_string()))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new/dir/page"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new/dir/page"))
        .respond_with(html(r#"<title>New</title><a href="sibling">s</a>"#.to_string()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new/dir/sibling"))
        .respond_with(html("<title>Sibling</title>".to_string()))
        .expect(1)
        .mount(&server)
        .await;

    let seeds = [format!("{}/go", base), format!("{}/old", base)];
    let config = test_config(20, "", &seeds);
    let pages = Arc::new(MemoryPageStore::new());
    let (ctx, store) = live_context(&config, pages.clone());
    for seed in &seeds {
        ctx.frontier.insert(seed, 0, 0).await.unwrap();
    }

    let report = tokio::time::timeout(Duration::from_secs(30), WorkerPool::new(ctx, 2).run())
        .await
        .expect("pool stops once idle")
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Idle);
    assert_eq!(report.pages_fetched, 2);
    assert_eq!(report.totals().redirected, 2);
    assert_eq!(store.counter(ROBOTS_BLOCKED_COUNTER).await.unwrap(), 1);

    let source = pages.get_page(&seeds[0]).await.unwrap().unwrap();
    assert_eq!(source.status, 301);
    assert_eq!(source.title, None);
    assert_eq!(source.links, vec![format!("{}/secret/dir/page", base)]);
    assert!(pages
        .get_page(&format!("{}/secret/dir/page", base))
        .await
        .unwrap()
        .is_none());

    // Relative links resolve against the page that actually served them
    let target = pages
        .get_page(&format!("{}/new/dir/page", base))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target.links, vec![format!("{}/new/dir/sibling", base)]);
}

#[tokio::test]
async fn test_max_pages_stops_pool() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(html(
            r#"<a href="/a">a</a><a href="/b">b</a><a href="/c">c</a><a href="/d">d</a>"#
                .to_string(),
        ))
        .mount(&server)
        .await;

    let config = test_config(50, "", &[]);
    let pages = Arc::new(MemoryPageStore::new());
    let (ctx, _store) = live_context(&config, pages.clone());
    ctx.frontier.insert(&format!("{}/", base), 0, 0).await.unwrap();

    let report = tokio::time::timeout(
        Duration::from_secs(30),
        WorkerPool::new(ctx, 2).with_max_pages(Some(2)).run(),
    )
    .await
    .expect("pool stops at the page limit")
    .unwrap();

    assert_eq!(report.stop_reason, StopReason::MaxPages);
    assert!(report.pages_fetched >= 2);
    assert!(report.pages_fetched < 5);
}

#[tokio::test]
async fn test_stop_handle_interrupts_pool() {
    let config = test_config(20, "stop-when-idle = false", &[]);
    let pages = Arc::new(MemoryPageStore::new());
    let (ctx, _store) = live_context(&config, pages);

    let pool = WorkerPool::new(ctx, 2).with_stop_when_idle(false);
    let stop = pool.stop_handle();
    let running = tokio::spawn(pool.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.stop();

    let report = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("pool observes the stop flag")
        .unwrap()
        .unwrap();
    assert_eq!(report.stop_reason, StopReason::Requested);
    assert_eq!(report.pages_fetched, 0);
}

#[tokio::test]
async fn test_http_fetcher_sends_user_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header(
            "user-agent",
            "TestBot/1.0 (+https://example.com/about; admin@example.com)",
        ))
        .respond_with(html("<p>hi</p>".to_string()))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(2000, "", &[]);
    let fetcher = HttpFetcher::from_config(&config.user_agent).unwrap();
    let url = Url::parse(&format!("{}/", server.uri())).unwrap();

    let response = fetcher
        .fetch(&url, Duration::from_secs(5), 1024)
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.is_html());
    assert_eq!(response.body, "<p>hi</p>");
}

#[tokio::test]
async fn test_http_fetcher_rejects_oversize_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big"))
        .respond_with(html("x".repeat(4096)))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::from_config(&test_config(2000, "", &[]).user_agent).unwrap();
    let url = Url::parse(&format!("{}/big", server.uri())).unwrap();

    let error = fetcher
        .fetch(&url, Duration::from_secs(5), 1024)
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Oversize);
}

#[tokio::test]
async fn test_http_fetcher_classifies_timeout_and_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(html("late".to_string()).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::from_config(&test_config(2000, "", &[]).user_agent).unwrap();

    let slow = Url::parse(&format!("{}/slow", server.uri())).unwrap();
    let error = fetcher
        .fetch(&slow, Duration::from_millis(200), 1024)
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Timeout);

    // Non-2xx responses come back as responses
    let busy = Url::parse(&format!("{}/busy", server.uri())).unwrap();
    let response = fetcher
        .fetch(&busy, Duration::from_secs(5), 1024)
        .await
        .unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(
        ErrorKind::from_status(response.status),
        ErrorKind::ServerError(503)
    );
}
