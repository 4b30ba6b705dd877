//! Page storage trait and error types

use crate::storage::{PageDocument, RunRecord, RunStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Storage lock poisoned")]
    Poisoned,

    #[error("Blocking storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistent storage for fetched pages and run records
///
/// Saving is an upsert keyed by URL, so a page fetched twice keeps its latest version.
#[async_trait]
pub trait PageStore: Send + Sync {
    // ===== Pages =====

    /// Inserts or replaces the document for `doc.url`
    async fn save(&self, doc: &PageDocument) -> StorageResult<()>;

    async fn get_page(&self, url: &str) -> StorageResult<Option<PageDocument>>;

    async fn count_pages(&self) -> StorageResult<u64>;

    /// Stored documents grouped by HTTP status (0 for terminal failures)
    async fn status_counts(&self) -> StorageResult<BTreeMap<u16, u64>>;

    // ===== Runs =====

    /// Records the start of a run and returns its ID
    async fn create_run(&self, config_hash: &str) -> StorageResult<i64>;

    /// Marks a run finished with its final status and successful fetch count
    async fn finish_run(&self, run_id: i64, status: RunStatus, pages: u64) -> StorageResult<()>;

    async fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    async fn latest_run(&self) -> StorageResult<Option<RunRecord>>;
}
