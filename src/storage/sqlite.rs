//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the PageStore trait.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{PageStore, StorageError, StorageResult};
use crate::storage::{PageDocument, RunRecord, RunStatus};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// SQLite storage backend
#[derive(Clone)]
pub struct SqlitePageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePageStore {
    /// Opens or creates the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?).unwrap_or(RunStatus::Running),
        pages_fetched: row.get::<_, i64>(5)?.max(0) as u64,
    })
}

#[async_trait]
impl PageStore for SqlitePageStore {
    // ===== Page Management =====

    async fn save(&self, doc: &PageDocument) -> StorageResult<()> {
        let doc = doc.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO pages (url, domain, title, html, status, content_type, error_kind, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(url) DO UPDATE SET
                    domain = excluded.domain,
                    title = excluded.title,
                    html = excluded.html,
                    status = excluded.status,
                    content_type = excluded.content_type,
                    error_kind = excluded.error_kind,
                    fetched_at = excluded.fetched_at",
                params![
                    doc.url,
                    doc.domain,
                    doc.title,
                    doc.html,
                    doc.status,
                    doc.content_type,
                    doc.error_kind,
                    doc.fetched_at,
                ],
            )?;

            tx.execute("DELETE FROM links WHERE from_url = ?1", params![doc.url])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO links (from_url, position, to_url) VALUES (?1, ?2, ?3)",
                )?;
                for (position, link) in doc.links.iter().enumerate() {
                    stmt.execute(params![doc.url, position as i64, link])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_page(&self, url: &str) -> StorageResult<Option<PageDocument>> {
        let url = url.to_string();
        self.with_conn(move |conn| {
            let page = conn
                .query_row(
                    "SELECT url, domain, title, html, status, content_type, error_kind, fetched_at
                     FROM pages WHERE url = ?1",
                    params![url],
                    |row| {
                        Ok(PageDocument {
                            url: row.get(0)?,
                            domain: row.get(1)?,
                            title: row.get(2)?,
                            html: row.get(3)?,
                            links: Vec::new(),
                            status: row.get(4)?,
                            content_type: row.get(5)?,
                            error_kind: row.get(6)?,
                            fetched_at: row.get(7)?,
                        })
                    },
                )
                .optional()?;

            let Some(mut page) = page else {
                return Ok(None);
            };

            let mut stmt =
                conn.prepare("SELECT to_url FROM links WHERE from_url = ?1 ORDER BY position")?;
            page.links = stmt
                .query_map(params![url], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;

            Ok(Some(page))
        })
        .await
    }

    async fn count_pages(&self) -> StorageResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM pages", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn status_counts(&self) -> StorageResult<BTreeMap<u16, u64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM pages GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, u16>(0)?, row.get::<_, i64>(1)?)))?;

            let mut counts = BTreeMap::new();
            for row in rows {
                let (status, count) = row?;
                counts.insert(status, count.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }

    // ===== Run Management =====

    async fn create_run(&self, config_hash: &str) -> StorageResult<i64> {
        let config_hash = config_hash.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
                params![now, config_hash, RunStatus::Running.to_db_string()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn finish_run(&self, run_id: i64, status: RunStatus, pages: u64) -> StorageResult<()> {
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let updated = conn.execute(
                "UPDATE runs SET status = ?1, finished_at = ?2, pages_fetched = ?3 WHERE id = ?4",
                params![status.to_db_string(), now, pages as i64, run_id],
            )?;
            if updated == 0 {
                return Err(StorageError::RunNotFound(run_id));
            }
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, started_at, finished_at, config_hash, status, pages_fetched
                 FROM runs WHERE id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
        })
        .await
    }

    async fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
        self.with_conn(|conn| {
            let run = conn
                .query_row(
                    "SELECT id, started_at, finished_at, config_hash, status, pages_fetched
                     FROM runs ORDER BY id DESC LIMIT 1",
                    [],
                    run_from_row,
                )
                .optional()?;
            Ok(run)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(url: &str, status: u16, links: &[&str]) -> PageDocument {
        PageDocument {
            url: url.to_string(),
            domain: "example.com".to_string(),
            title: Some("Title".to_string()),
            html: "<html></html>".to_string(),
            links: links.iter().map(|l| l.to_string()).collect(),
            status,
            content_type: Some("text/html".to_string()),
            error_kind: None,
            fetched_at: 1_000,
        }
    }

    #[tokio::test]
    async fn test_save_and_get_page() {
        let storage = SqlitePageStore::open_in_memory().unwrap();
        let page = doc("https://example.com/", 200, &["https://example.com/b", "https://example.com/a"]);
        storage.save(&page).await.unwrap();

        let stored = storage.get_page("https://example.com/").await.unwrap().unwrap();
        assert_eq!(stored, page);
        assert!(storage.get_page("https://example.com/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_idempotent_upsert() {
        let storage = SqlitePageStore::open_in_memory().unwrap();
        storage
            .save(&doc("https://example.com/", 503, &["https://example.com/x"]))
            .await
            .unwrap();
        storage
            .save(&doc("https://example.com/", 200, &["https://example.com/y"]))
            .await
            .unwrap();

        assert_eq!(storage.count_pages().await.unwrap(), 1);
        let stored = storage.get_page("https://example.com/").await.unwrap().unwrap();
        assert_eq!(stored.status, 200);
        assert_eq!(stored.links, vec!["https://example.com/y"]);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let storage = SqlitePageStore::open_in_memory().unwrap();
        storage.save(&doc("https://example.com/1", 200, &[])).await.unwrap();
        storage.save(&doc("https://example.com/2", 200, &[])).await.unwrap();
        storage.save(&doc("https://example.com/3", 0, &[])).await.unwrap();

        let counts = storage.status_counts().await.unwrap();
        assert_eq!(counts.get(&200), Some(&2));
        assert_eq!(counts.get(&0), Some(&1));
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let storage = SqlitePageStore::open_in_memory().unwrap();
        assert!(storage.latest_run().await.unwrap().is_none());

        let run_id = storage.create_run("abc123").await.unwrap();
        let run = storage.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.config_hash, "abc123");
        assert!(run.finished_at.is_none());

        storage
            .finish_run(run_id, RunStatus::Completed, 42)
            .await
            .unwrap();
        let run = storage.latest_run().await.unwrap().unwrap();
        assert_eq!(run.id, run_id);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.pages_fetched, 42);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_finish_unknown_run() {
        let storage = SqlitePageStore::open_in_memory().unwrap();
        let result = storage.finish_run(99, RunStatus::Failed, 0).await;
        assert!(matches!(result, Err(StorageError::RunNotFound(99))));
    }
}
