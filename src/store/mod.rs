//! Shared store adapters
//!
//! All crawl state that workers share (frontier, seen set, per-domain politeness and robots
//! records, retry attempts, locks, counters) lives behind [`SharedStore`]. Three backends:
//!
//! - [`MemoryStore`]: one process
//! - [`SqliteStore`]: processes sharing a database file
//! - [`RedisStore`]: processes on any number of hosts

mod memory;
mod redis;
mod schema;
mod sqlite;
mod traits;

pub use self::redis::RedisStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{Reservation, SharedStore, StoreError, StoreResult};

use crate::config::{StoreBackend, StoreConfig};
use std::path::Path;
use std::sync::Arc;

/// Opens the store selected by the configuration
pub async fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn SharedStore>> {
    let store: Arc<dyn SharedStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(Path::new(&config.path))?),
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.url).await?),
    };
    Ok(store)
}
