//! Database schema definitions for the page database

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    pages_fetched INTEGER NOT NULL DEFAULT 0
);

-- One document per normalized URL
CREATE TABLE IF NOT EXISTS pages (
    url TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    title TEXT,
    html TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    error_kind TEXT,
    fetched_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pages_domain ON pages(domain);
CREATE INDEX IF NOT EXISTS idx_pages_status ON pages(status);
CREATE INDEX IF NOT EXISTS idx_pages_fetched_at ON pages(fetched_at);

-- Outgoing links in document order
CREATE TABLE IF NOT EXISTS links (
    from_url TEXT NOT NULL REFERENCES pages(url) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    to_url TEXT NOT NULL,
    PRIMARY KEY (from_url, position)
);

CREATE INDEX IF NOT EXISTS idx_links_to ON links(to_url);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
