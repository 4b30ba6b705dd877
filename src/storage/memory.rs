//! In-memory page store for tests and throwaway crawls

use crate::storage::traits::{PageStore, StorageError, StorageResult};
use crate::storage::{PageDocument, RunRecord, RunStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    pages: HashMap<String, PageDocument>,
    runs: Vec<RunRecord>,
}

/// Page store that keeps everything in process memory
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    inner: Mutex<Inner>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }

    /// All stored documents, in no particular order
    pub fn pages(&self) -> StorageResult<Vec<PageDocument>> {
        Ok(self.lock()?.pages.values().cloned().collect())
    }
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn save(&self, doc: &PageDocument) -> StorageResult<()> {
        self.lock()?.pages.insert(doc.url.clone(), doc.clone());
        Ok(())
    }

    async fn get_page(&self, url: &str) -> StorageResult<Option<PageDocument>> {
        Ok(self.lock()?.pages.get(url).cloned())
    }

    async fn count_pages(&self) -> StorageResult<u64> {
        Ok(self.lock()?.pages.len() as u64)
    }

    async fn status_counts(&self) -> StorageResult<BTreeMap<u16, u64>> {
        let inner = self.lock()?;
        let mut counts = BTreeMap::new();
        for page in inner.pages.values() {
            *counts.entry(page.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn create_run(&self, config_hash: &str) -> StorageResult<i64> {
        let mut inner = self.lock()?;
        let id = inner.runs.len() as i64 + 1;
        inner.runs.push(RunRecord {
            id,
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
            config_hash: config_hash.to_string(),
            status: RunStatus::Running,
            pages_fetched: 0,
        });
        Ok(id)
    }

    async fn finish_run(&self, run_id: i64, status: RunStatus, pages: u64) -> StorageResult<()> {
        let mut inner = self.lock()?;
        let run = inner
            .runs
            .iter_mut()
            .find(|run| run.id == run_id)
            .ok_or(StorageError::RunNotFound(run_id))?;
        run.status = status;
        run.finished_at = Some(Utc::now().to_rfc3339());
        run.pages_fetched = pages;
        Ok(())
    }

    async fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.lock()?
            .runs
            .iter()
            .find(|run| run.id == run_id)
            .cloned()
            .ok_or(StorageError::RunNotFound(run_id))
    }

    async fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
        Ok(self.lock()?.runs.last().cloned())
    }
}
