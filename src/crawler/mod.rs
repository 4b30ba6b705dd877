//! Crawler module: the frontier scheduler and the workers that drain it
//!
//! This module contains:
//! - The frontier, with its atomic claim and dedup-gated insert
//! - Per-domain politeness reservations
//! - Failure classification and retry/backoff
//! - The HTTP fetcher and HTML link extractor seams
//! - The worker pipeline and the pool that runs it

mod fetcher;
mod frontier;
mod parser;
mod politeness;
mod pool;
mod retry;
mod worker;

pub use fetcher::{build_http_client, FetchError, FetchResponse, Fetcher, HttpFetcher};
pub use frontier::{Claim, ClaimToken, Frontier, FrontierEntry};
pub use parser::{parse_html, HtmlLinkExtractor, LinkExtractor, ParsedPage};
pub use politeness::{PolitenessTracker, Reservation};
pub use pool::{PoolReport, StopHandle, StopReason, WorkerPool};
pub use retry::{ErrorKind, RetryDecision, RetryPolicy};
pub use worker::{
    Step, Worker, WorkerContext, WorkerSettings, WorkerStats, PAGES_FETCHED_COUNTER,
    ROBOTS_BLOCKED_COUNTER,
};
