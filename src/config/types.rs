use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Driftnet
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub robots: RobotsConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub output: OutputConfig,
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrawlerConfig {
    /// Number of concurrent workers
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Minimum time between requests to the same domain (milliseconds)
    #[serde(default = "default_domain_cooldown_ms")]
    pub domain_cooldown_ms: u64,

    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bodies larger than this are rejected
    #[serde(default = "default_max_content_size_bytes")]
    pub max_content_size_bytes: usize,

    /// Stop after this many successful fetches in one run
    #[serde(default)]
    pub max_pages: Option<u64>,

    /// Links found deeper than this are not admitted
    #[serde(default)]
    pub max_depth: Option<u32>,

    /// Sleep between claim attempts when nothing is ready (milliseconds)
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Stop the pool once the frontier is drained and every worker is idle
    #[serde(default = "default_true")]
    pub stop_when_idle: bool,

    /// Seed URLs inserted at the start of `run`
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Domain patterns (e.g., "example.com" or "*.example.com") links must match.
    /// Empty means every domain is allowed.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

/// Retry/backoff configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Fetch attempts before a transient failure becomes terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Robots.txt cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RobotsConfig {
    /// How long fetched rules stay valid (seconds)
    #[serde(default = "default_robots_ttl_secs")]
    pub ttl_secs: u64,

    /// Lifetime of the per-domain fetch lock (seconds)
    #[serde(default = "default_robots_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Requeue delay for URLs whose robots.txt is being fetched by another worker (milliseconds)
    #[serde(default = "default_robots_wait_ms")]
    pub wait_ms: u64,

    /// Upper bound applied to Crawl-delay directives (seconds)
    #[serde(default = "default_max_crawl_delay_secs")]
    pub max_crawl_delay_secs: u64,
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserAgentConfig {
    /// Name of the crawler, also the robots.txt product token
    pub crawler_name: String,

    /// Version of the crawler
    pub crawler_version: String,

    /// URL with information about the crawler
    pub contact_url: String,

    /// Email address for crawler-related contact
    pub contact_email: String,
}

/// Shared store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process only; workers of one pool share it
    Memory,
    /// SQLite file; processes on one host can share it
    #[default]
    Sqlite,
    /// Redis server; any number of hosts can share it
    Redis,
}

/// Shared store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database path (sqlite backend)
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Connection URL (redis backend)
    #[serde(default = "default_store_url")]
    pub url: String,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Path to the SQLite page database
    pub database_path: String,

    /// Where `run` writes its metrics snapshot
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl CrawlerConfig {
    pub fn domain_cooldown(&self) -> Duration {
        Duration::from_millis(self.domain_cooldown_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl RobotsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn max_crawl_delay(&self) -> Duration {
        Duration::from_secs(self.max_crawl_delay_secs)
    }
}

impl UserAgentConfig {
    /// Format: CrawlerName/Version (+ContactURL; ContactEmail)
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_robots_ttl_secs(),
            lock_ttl_secs: default_robots_lock_ttl_secs(),
            wait_ms: default_robots_wait_ms(),
            max_crawl_delay_secs: default_max_crawl_delay_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            url: default_store_url(),
        }
    }
}

fn default_concurrency() -> u32 {
    16
}

fn default_domain_cooldown_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_max_content_size_bytes() -> usize {
    3 * 1024 * 1024
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_robots_ttl_secs() -> u64 {
    24 * 3600
}

fn default_robots_lock_ttl_secs() -> u64 {
    30
}

fn default_robots_wait_ms() -> u64 {
    500
}

fn default_max_crawl_delay_secs() -> u64 {
    30
}

fn default_store_path() -> String {
    "./frontier.db".to_string()
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_metrics_path() -> String {
    "./output/metrics.json".to_string()
}
