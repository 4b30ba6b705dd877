//! Statistics from the shared store and the page database

use crate::crawler::Frontier;
use crate::crawler::{PAGES_FETCHED_COUNTER, ROBOTS_BLOCKED_COUNTER};
use crate::storage::PageStore;
use crate::Result;
use std::collections::BTreeMap;

/// Crawl statistics summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlStatistics {
    /// URLs waiting in the frontier
    pub frontier_size: u64,

    /// URLs ever admitted
    pub seen: u64,

    /// Documents in the page database
    pub pages_stored: u64,

    /// Successful fetches since the shared store was last cleared
    pub pages_fetched: i64,

    /// robots.txt skips since the shared store was last cleared
    pub robots_blocked: i64,

    /// Stored documents grouped by HTTP status
    pub status_counts: BTreeMap<u16, u64>,
}

/// Loads statistics from the frontier store and page storage
pub async fn load_statistics(
    frontier: &Frontier,
    pages: &dyn PageStore,
) -> Result<CrawlStatistics> {
    let store = frontier.store();

    Ok(CrawlStatistics {
        frontier_size: frontier.len().await?,
        seen: frontier.seen_count().await?,
        pages_stored: pages.count_pages().await?,
        pages_fetched: store.counter(PAGES_FETCHED_COUNTER).await?,
        robots_blocked: store.counter(ROBOTS_BLOCKED_COUNTER).await?,
        status_counts: pages.status_counts().await?,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Crawl Statistics ===\n");

    println!("Overview:");
    println!("  Frontier: {}", stats.frontier_size);
    println!("  Seen: {}", stats.seen);
    println!("  Pages stored: {}", stats.pages_stored);
    println!("  Pages fetched: {}", stats.pages_fetched);
    println!("  Robots blocked: {}", stats.robots_blocked);
    println!();

    if !stats.status_counts.is_empty() {
        println!("Pages by Status:");
        let mut status_counts: Vec<_> = stats.status_counts.iter().collect();
        status_counts.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

        for (status, count) in status_counts {
            let percentage = if stats.pages_stored > 0 {
                (*count as f64 / stats.pages_stored as f64) * 100.0
            } else {
                0.0
            };
            let label = if *status == 0 {
                "failed".to_string()
            } else {
                status.to_string()
            };
            println!("  {}: {} ({:.1}%)", label, count, percentage);
        }
        println!();
    }
}
