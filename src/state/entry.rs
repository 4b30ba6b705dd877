use crate::clock::Millis;
use std::cmp::Ordering;

/// A URL waiting in the frontier
///
/// Entries order by `(ready_at, priority, url)`: the earliest ready entry wins, and among
/// entries ready at the same instant the shallower one (lower priority value) goes first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrontierEntry {
    /// Normalized URL, also the dedup key
    pub url: String,

    /// Earliest time the entry may be claimed (epoch milliseconds)
    pub ready_at: Millis,

    /// Crawl depth from the seed set; seeds are 0
    pub priority: u32,
}

impl FrontierEntry {
    pub fn new(url: impl Into<String>, ready_at: Millis, priority: u32) -> Self {
        Self {
            url: url.into(),
            ready_at,
            priority,
        }
    }

    pub fn is_ready(&self, now: Millis) -> bool {
        self.ready_at <= now
    }

    /// Same URL and priority, later ready time
    pub fn deferred_to(&self, ready_at: Millis) -> Self {
        Self {
            url: self.url.clone(),
            ready_at,
            priority: self.priority,
        }
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then(self.priority.cmp(&other.priority))
            .then_with(|| self.url.cmp(&other.url))
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Transient failures recorded for one URL across workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub url: String,

    /// Fetch attempts made so far, including the most recent failed one
    pub attempts: u32,

    /// Label of the most recent error kind
    pub last_error: String,
}
