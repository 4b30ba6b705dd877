//! Per-domain politeness
//!
//! The minimum interval between requests to one domain is enforced by a compare-and-advance
//! on the domain's next-allowed time in the shared store. Whoever advances it owns the
//! window; everyone else is told when the window opens.

use crate::clock::{duration_ms, Millis};
use crate::store::{SharedStore, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

pub use crate::store::Reservation;

/// Reserves per-domain request windows in the shared store
#[derive(Clone)]
pub struct PolitenessTracker {
    store: Arc<dyn SharedStore>,
    default_cooldown: Duration,
    max_crawl_delay: Duration,
}

impl PolitenessTracker {
    pub fn new(
        store: Arc<dyn SharedStore>,
        default_cooldown: Duration,
        max_crawl_delay: Duration,
    ) -> Self {
        Self {
            store,
            default_cooldown,
            max_crawl_delay,
        }
    }

    /// Cooldown for a domain given its robots Crawl-delay, if any
    ///
    /// The larger of the configured cooldown and the crawl delay, with the crawl delay
    /// capped at the configured maximum.
    pub fn effective_cooldown(&self, crawl_delay: Option<Duration>) -> Duration {
        match crawl_delay {
            Some(delay) => self.default_cooldown.max(delay.min(self.max_crawl_delay)),
            None => self.default_cooldown,
        }
    }

    /// Atomically claims the domain's next request window
    ///
    /// Returns `Ready` and moves the window to `now + cooldown` if `now` is past it,
    /// otherwise `Deferred` with the time the window opens.
    pub async fn check_and_reserve(
        &self,
        domain: &str,
        now: Millis,
        cooldown: Duration,
    ) -> StoreResult<Reservation> {
        let reservation = self
            .store
            .reserve_domain(domain, now, duration_ms(cooldown))
            .await?;
        trace!(domain, now, ?reservation, "Politeness reservation");
        Ok(reservation)
    }
}
