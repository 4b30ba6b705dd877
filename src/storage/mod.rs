//! Storage module for persisting fetched pages
//!
//! This module handles the page database, separate from the shared frontier store:
//! - Page documents keyed by normalized URL, with their outgoing links
//! - Run records tagged with the configuration hash

mod memory;
mod schema;
mod sqlite;
mod traits;

pub use memory::MemoryPageStore;
pub use sqlite::SqlitePageStore;
pub use traits::{PageStore, StorageError, StorageResult};

use crate::clock::Millis;
use serde::Serialize;
use std::path::Path;

/// Opens or creates the SQLite page database at `path`
pub fn open_page_store(path: &Path) -> StorageResult<SqlitePageStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    SqlitePageStore::open(path)
}

/// What a worker hands to page storage for one URL
///
/// Terminal failures are stored too, with status 0 and the classified error kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageDocument {
    pub url: String,
    pub domain: String,
    pub title: Option<String>,
    pub html: String,
    pub links: Vec<String>,
    pub status: u16,
    pub content_type: Option<String>,
    pub error_kind: Option<String>,
    pub fetched_at: Millis,
}

/// Represents a crawl run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
    pub pages_fetched: u64,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
