//! Checkpoint persistence using SQLite
//!
//! One row per task record per run. A run's rows are replaced after every
//! coordinator round, so a crashed run can be resumed from the last round.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::debug;

use crate::agents::AgentId;
use crate::task::{TaskId, TaskRecord, TaskStatus};
use crate::{Error, Result};

/// Summary of a checkpointed run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub tasks: usize,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-based checkpoint store
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Create a new checkpoint store with the given database path
    pub fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// Create an in-memory checkpoint store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Checkpoint("checkpoint store lock poisoned".to_string()))
    }

    /// Initialize database tables
    fn init_tables(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_records (
                run_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                parent_id TEXT,
                owner_agent_id TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                payload TEXT NOT NULL,
                artifact TEXT,
                replaces TEXT,
                diagnostics TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (run_id, task_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_records_run ON task_records(run_id, seq)",
            [],
        )?;

        Ok(())
    }

    /// Replace the stored records of a run
    pub fn save_run(&self, run_id: &str, records: &[TaskRecord]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let updated_at = Utc::now().to_rfc3339();
        tx.execute("DELETE FROM task_records WHERE run_id = ?1", params![run_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO task_records (
                    run_id, task_id, seq, parent_id, owner_agent_id, status, retry_count,
                    max_retries, payload, artifact, replaces, diagnostics, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for (seq, record) in records.iter().enumerate() {
                let artifact = record
                    .artifact
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    run_id,
                    record.id.as_str(),
                    seq as i64,
                    record.parent_id.as_ref().map(|p| p.as_str()),
                    record.owner_agent_id.as_str(),
                    record.status.as_str(),
                    record.retry_count,
                    record.max_retries,
                    serde_json::to_string(&record.payload)?,
                    artifact,
                    record.replaces.as_ref().map(|r| r.as_str()),
                    serde_json::to_string(&record.diagnostics)?,
                    updated_at,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Checkpointed {} task records for run {}", records.len(), run_id);
        Ok(())
    }

    /// Load the records of a run in their original order
    pub fn load_run(&self, run_id: &str) -> Result<Vec<TaskRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, parent_id, owner_agent_id, status, retry_count, max_retries,
                    payload, artifact, replaces, diagnostics
             FROM task_records WHERE run_id = ?1 ORDER BY seq",
        )?;

        let records = stmt.query_map(params![run_id], |row| {
            let status_str: String = row.get(3)?;
            let status =
                TaskStatus::parse(&status_str).ok_or(rusqlite::Error::InvalidQuery)?;

            let payload_json: String = row.get(6)?;
            let payload = serde_json::from_str(&payload_json)
                .map_err(|_| rusqlite::Error::InvalidQuery)?;

            let artifact_json: Option<String> = row.get(7)?;
            let artifact = artifact_json
                .map(|a| serde_json::from_str(&a))
                .transpose()
                .map_err(|_| rusqlite::Error::InvalidQuery)?;

            let diagnostics_json: String = row.get(9)?;
            let diagnostics = serde_json::from_str(&diagnostics_json)
                .map_err(|_| rusqlite::Error::InvalidQuery)?;

            Ok(TaskRecord {
                id: TaskId::new(row.get::<_, String>(0)?),
                parent_id: row.get::<_, Option<String>>(1)?.map(TaskId::new),
                owner_agent_id: AgentId::new(row.get::<_, String>(2)?),
                status,
                retry_count: row.get(4)?,
                max_retries: row.get(5)?,
                payload,
                artifact,
                replaces: row.get::<_, Option<String>>(8)?.map(TaskId::new),
                diagnostics,
            })
        })?;

        let mut result = Vec::new();
        for record in records {
            result.push(record?);
        }
        Ok(result)
    }

    /// List checkpointed runs, most recently updated first
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, COUNT(*), MAX(updated_at) FROM task_records
             GROUP BY run_id ORDER BY MAX(updated_at) DESC, run_id DESC",
        )?;

        let runs = stmt.query_map([], |row| {
            let updated_at_str: String = row.get(2)?;
            let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
                .map_err(|_| rusqlite::Error::InvalidQuery)?
                .with_timezone(&Utc);
            Ok(RunSummary {
                run_id: row.get(0)?,
                tasks: row.get::<_, i64>(1)? as usize,
                updated_at,
            })
        })?;

        let mut result = Vec::new();
        for run in runs {
            result.push(run?);
        }
        Ok(result)
    }

    /// Delete all records of a run
    pub fn delete_run(&self, run_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let affected = conn.execute("DELETE FROM task_records WHERE run_id = ?1", params![run_id])?;
        Ok(affected)
    }
}
