//! Table definitions for the SQLite shared store

/// SQL schema for the shared store
pub const SCHEMA_SQL: &str = r#"
-- Queued URLs; a URL appears at most once
CREATE TABLE IF NOT EXISTS frontier (
    url TEXT PRIMARY KEY,
    ready_at INTEGER NOT NULL,
    priority INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_frontier_order ON frontier(ready_at, priority, url);

-- Every URL ever admitted
CREATE TABLE IF NOT EXISTS seen (
    url TEXT PRIMARY KEY
);

-- Per-domain politeness window and robots.txt cache
CREATE TABLE IF NOT EXISTS domains (
    domain TEXT PRIMARY KEY,
    next_allowed_at INTEGER NOT NULL DEFAULT 0,
    robots_rules TEXT,
    robots_fetched_at INTEGER,
    robots_expires_at INTEGER
);

-- Transient failure attempts per URL
CREATE TABLE IF NOT EXISTS retries (
    url TEXT PRIMARY KEY,
    attempts INTEGER NOT NULL,
    last_error TEXT NOT NULL
);

-- Expiring named locks
CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);

-- Named counters
CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

/// Initializes the store schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
