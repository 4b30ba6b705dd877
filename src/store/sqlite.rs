//! SQLite shared store
//!
//! Several processes on one host can share a database file. Each guarantee maps onto a
//! single statement or an IMMEDIATE transaction, so SQLite's write lock serializes them.
//! Blocking calls run on tokio's blocking pool.

use crate::clock::Millis;
use crate::state::{DomainState, FrontierEntry, RetryState};
use crate::store::schema::initialize_schema;
use crate::store::traits::{Reservation, SharedStore, StoreError, StoreResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed shared store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates the store database at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }
}

fn to_priority(value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("priority out of range: {}", value)))
}

fn to_attempts(value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("attempts out of range: {}", value)))
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn admit(&self, entry: &FrontierEntry) -> StoreResult<bool> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO seen (url) VALUES (?1)",
                params![entry.url],
            )?;
            if inserted == 1 {
                tx.execute(
                    "INSERT OR REPLACE INTO frontier (url, ready_at, priority) VALUES (?1, ?2, ?3)",
                    params![entry.url, entry.ready_at, entry.priority],
                )?;
            }
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn requeue(&self, entry: &FrontierEntry) -> StoreResult<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO frontier (url, ready_at, priority) VALUES (?1, ?2, ?3)",
                params![entry.url, entry.ready_at, entry.priority],
            )?;
            Ok(())
        })
        .await
    }

    async fn pop_ready(&self, now: Millis) -> StoreResult<Option<FrontierEntry>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "DELETE FROM frontier WHERE url = (
                        SELECT url FROM frontier
                        WHERE ready_at <= ?1
                        ORDER BY ready_at, priority, url
                        LIMIT 1
                    )
                    RETURNING url, ready_at, priority",
                    params![now],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(url, ready_at, priority)| {
                Ok(FrontierEntry {
                    url,
                    ready_at,
                    priority: to_priority(priority)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn frontier_len(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM frontier", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn is_seen(&self, url: &str) -> StoreResult<bool> {
        let url = url.to_string();
        self.with_conn(move |conn| {
            let found = conn
                .query_row("SELECT 1 FROM seen WHERE url = ?1", params![url], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn seen_count(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM seen", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn reserve_domain(
        &self,
        domain: &str,
        now: Millis,
        cooldown_ms: Millis,
    ) -> StoreResult<Reservation> {
        let domain = domain.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let advanced = tx.execute(
                "INSERT INTO domains (domain, next_allowed_at) VALUES (?1, ?2)
                 ON CONFLICT(domain) DO UPDATE SET next_allowed_at = excluded.next_allowed_at
                 WHERE domains.next_allowed_at <= ?3",
                params![domain, now.saturating_add(cooldown_ms), now],
            )?;

            let reservation = if advanced == 1 {
                Reservation::Ready
            } else {
                let until: i64 = tx.query_row(
                    "SELECT next_allowed_at FROM domains WHERE domain = ?1",
                    params![domain],
                    |row| row.get(0),
                )?;
                Reservation::Deferred { until }
            };
            tx.commit()?;
            Ok(reservation)
        })
        .await
    }

    async fn domain_state(&self, domain: &str) -> StoreResult<Option<DomainState>> {
        let domain = domain.to_string();
        self.with_conn(move |conn| {
            let state = conn
                .query_row(
                    "SELECT domain, next_allowed_at, robots_rules, robots_fetched_at, robots_expires_at
                     FROM domains WHERE domain = ?1",
                    params![domain],
                    |row| {
                        Ok(DomainState {
                            domain: row.get(0)?,
                            next_allowed_at: row.get(1)?,
                            robots_rules: row.get(2)?,
                            robots_fetched_at: row.get(3)?,
                            robots_expires_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(state)
        })
        .await
    }

    async fn record_robots(
        &self,
        domain: &str,
        rules: &str,
        fetched_at: Millis,
        expires_at: Millis,
    ) -> StoreResult<()> {
        let domain = domain.to_string();
        let rules = rules.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO domains (domain, robots_rules, robots_fetched_at, robots_expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(domain) DO UPDATE SET
                    robots_rules = excluded.robots_rules,
                    robots_fetched_at = excluded.robots_fetched_at,
                    robots_expires_at = excluded.robots_expires_at",
                params![domain, rules, fetched_at, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn try_lock(&self, name: &str, now: Millis, ttl_ms: Millis) -> StoreResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let acquired = conn.execute(
                "INSERT INTO locks (name, expires_at) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET expires_at = excluded.expires_at
                 WHERE locks.expires_at <= ?3",
                params![name, now.saturating_add(ttl_ms), now],
            )?;
            Ok(acquired == 1)
        })
        .await
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM locks WHERE name = ?1", params![name])?;
            Ok(())
        })
        .await
    }

    async fn incr(&self, name: &str) -> StoreResult<i64> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let value = conn.query_row(
                "INSERT INTO counters (name, value) VALUES (?1, 1)
                 ON CONFLICT(name) DO UPDATE SET value = value + 1
                 RETURNING value",
                params![name],
                |row| row.get(0),
            )?;
            Ok(value)
        })
        .await
    }

    async fn counter(&self, name: &str) -> StoreResult<i64> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM counters WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.unwrap_or(0))
        })
        .await
    }

    async fn reset_counter(&self, name: &str) -> StoreResult<()> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM counters WHERE name = ?1", params![name])?;
            Ok(())
        })
        .await
    }

    async fn bump_attempts(&self, url: &str, error: &str) -> StoreResult<RetryState> {
        let url = url.to_string();
        let error = error.to_string();
        self.with_conn(move |conn| {
            let attempts: i64 = conn.query_row(
                "INSERT INTO retries (url, attempts, last_error) VALUES (?1, 1, ?2)
                 ON CONFLICT(url) DO UPDATE SET
                    attempts = attempts + 1,
                    last_error = excluded.last_error
                 RETURNING attempts",
                params![url, error],
                |row| row.get(0),
            )?;
            Ok(RetryState {
                url,
                attempts: to_attempts(attempts)?,
                last_error: error,
            })
        })
        .await
    }

    async fn clear_attempts(&self, url: &str) -> StoreResult<()> {
        let url = url.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM retries WHERE url = ?1", params![url])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                BEGIN IMMEDIATE;
                DELETE FROM frontier;
                DELETE FROM seen;
                DELETE FROM domains;
                DELETE FROM retries;
                DELETE FROM locks;
                DELETE FROM counters;
                COMMIT;
            ",
            )?;
            Ok(())
        })
        .await
    }
}
