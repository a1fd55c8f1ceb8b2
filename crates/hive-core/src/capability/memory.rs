//! Memory capability
//!
//! The core only stores entries and consumes the ordered sequence a query
//! returns. `SqliteMemoryStore` is the bundled implementation; callers must
//! not assume atomic read-modify-write across agents.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use super::CapabilityError;
use crate::Result;

/// One stored memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Shared long-term memory
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store `data` under `key`, replacing an existing entry
    async fn store(&self, key: &str, data: JsonValue) -> std::result::Result<(), CapabilityError>;

    /// Entries matching `query`, best match first
    async fn retrieve(&self, query: &str) -> std::result::Result<Vec<MemoryEntry>, CapabilityError>;
}

/// SQLite-backed memory store with optional FTS5 search
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
    /// Upper bound on entries returned by one query
    limit: usize,
}

const DEFAULT_RETRIEVE_LIMIT: usize = 32;

impl SqliteMemoryStore {
    /// Open (or create) a store at `db_path`
    pub fn new(db_path: &str) -> Result<Self> {
        debug!("Opening memory database at: {}", db_path);
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
            limit: DEFAULT_RETRIEVE_LIMIT,
        };
        store.init_tables()?;
        info!("SqliteMemoryStore initialized");
        Ok(store)
    }

    /// In-memory store (useful for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            limit: DEFAULT_RETRIEVE_LIMIT,
        };
        store.init_tables()?;
        Ok(store)
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.lock().map_err(|e| crate::Error::Other(e.to_string()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS memories (
                key TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // FTS5 may not be compiled in; LIKE search covers that case
        let fts_result = conn.execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                key UNINDEXED,
                content
            )",
            [],
        );

        match fts_result {
            Ok(_) => debug!("FTS5 full-text search enabled"),
            Err(e) => debug!("FTS5 not available, falling back to LIKE search: {}", e),
        }

        Ok(())
    }

    fn lock(&self) -> std::result::Result<std::sync::MutexGuard<'_, Connection>, CapabilityError> {
        self.conn
            .lock()
            .map_err(|_| CapabilityError::new("memory store lock poisoned"))
    }

    fn searchable_text(data: &JsonValue) -> String {
        match data {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn search_with_fts(conn: &Connection, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let mut stmt = conn.prepare(
            "SELECT m.key, m.data, m.created_at
             FROM memories m
             JOIN memories_fts fts ON m.key = fts.key
             WHERE memories_fts MATCH ?1
             ORDER BY m.created_at DESC, m.rowid DESC
             LIMIT ?2",
        )?;

        let entries = stmt
            .query_map(params![query, limit as i64], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn search_with_like(conn: &Connection, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let mut stmt = conn.prepare(
            "SELECT key, data, created_at FROM memories
             WHERE content LIKE ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;

        let pattern = format!("%{}%", query);
        let entries = stmt
            .query_map(params![pattern, limit as i64], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count stored entries
    pub fn count(&self) -> std::result::Result<usize, CapabilityError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
            .map_err(|e| CapabilityError::new(e.to_string()))?;
        Ok(count as usize)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let key: String = row.get(0)?;
    let data_str: String = row.get(1)?;
    let created_at_str: String = row.get(2)?;

    let data: JsonValue = serde_json::from_str(&data_str).unwrap_or(JsonValue::Null);
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(MemoryEntry {
        key,
        data,
        created_at,
    })
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn store(&self, key: &str, data: JsonValue) -> std::result::Result<(), CapabilityError> {
        let conn = self.lock()?;
        let content = Self::searchable_text(&data);
        let data_json = data.to_string();
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);

        conn.execute(
            "INSERT OR REPLACE INTO memories (key, content, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, content, data_json, created_at],
        )
        .map_err(|e| CapabilityError::new(e.to_string()))?;

        // Keep the FTS index in step when it exists
        conn.execute("DELETE FROM memories_fts WHERE key = ?1", params![key])
            .ok();
        conn.execute(
            "INSERT INTO memories_fts (key, content) VALUES (?1, ?2)",
            params![key, content],
        )
        .ok();

        debug!("Stored memory: {}", key);
        Ok(())
    }

    async fn retrieve(
        &self,
        query: &str,
    ) -> std::result::Result<Vec<MemoryEntry>, CapabilityError> {
        let conn = self.lock()?;
        let entries = match Self::search_with_fts(&conn, query, self.limit) {
            Ok(results) if !results.is_empty() => results,
            _ => Self::search_with_like(&conn, query, self.limit)
                .map_err(|e| CapabilityError::new(e.to_string()))?,
        };
        debug!("Found {} memories matching query: {}", entries.len(), query);
        Ok(entries)
    }
}
