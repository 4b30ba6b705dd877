//! Frontier scheduler
//!
//! Decides which URL a worker fetches next. Claims are a single atomic pop on the shared
//! store, so a URL is handed to at most one worker no matter how many processes drain
//! the same store.

use crate::clock::{Clock, Millis};
use crate::store::{SharedStore, StoreResult};
use crate::url::normalize_url;
use crate::Result;
use std::sync::Arc;
use tracing::trace;

pub use crate::state::FrontierEntry;

/// Identifies one claim of one URL by one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub worker_id: usize,
    pub url: String,
    pub claimed_at: Millis,
}

/// An entry removed from the frontier for exclusive processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub entry: FrontierEntry,
    pub token: ClaimToken,
}

/// Scheduler over the shared frontier and seen set
#[derive(Clone)]
pub struct Frontier {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl Frontier {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Atomically takes the best ready entry, if any
    ///
    /// Best means smallest `(ready_at, priority, url)` among entries with
    /// `ready_at <= now`.
    pub async fn claim_next(&self, worker_id: usize) -> StoreResult<Option<Claim>> {
        let now = self.clock.now_ms();
        let Some(entry) = self.store.pop_ready(now).await? else {
            return Ok(None);
        };

        trace!(worker_id, url = %entry.url, priority = entry.priority, "Claimed");
        Ok(Some(Claim {
            token: ClaimToken {
                worker_id,
                url: entry.url.clone(),
                claimed_at: now,
            },
            entry,
        }))
    }

    /// Normalizes `url` and admits it if it has never been seen
    ///
    /// The entry becomes ready at `max(now, not_before)`. Returns false for duplicates.
    pub async fn insert(&self, url: &str, priority: u32, not_before: Millis) -> Result<bool> {
        let normalized = normalize_url(url)?;
        let ready_at = self.clock.now_ms().max(not_before);
        let entry = FrontierEntry::new(normalized.as_str(), ready_at, priority);

        let admitted = self.store.admit(&entry).await?;
        trace!(url = %entry.url, priority, admitted, "Insert");
        Ok(admitted)
    }

    /// Puts a claimed entry back, ready at `max(now, not_before)`
    ///
    /// The seen set is not touched.
    pub async fn requeue(&self, entry: &FrontierEntry, not_before: Millis) -> StoreResult<()> {
        let ready_at = self.clock.now_ms().max(not_before);
        trace!(url = %entry.url, ready_at, "Requeue");
        self.store.requeue(&entry.deferred_to(ready_at)).await
    }

    /// Number of queued entries
    pub async fn len(&self) -> StoreResult<u64> {
        self.store.frontier_len().await
    }

    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Number of URLs ever admitted
    pub async fn seen_count(&self) -> StoreResult<u64> {
        self.store.seen_count().await
    }
}
