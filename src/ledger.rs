//! Durable experiment ledger backed by SQLite.
//!
//! The ledger maps descriptor keys (see [`crate::experiment::codec`]) to run
//! status and is what lets a campaign resume after a restart without repeating
//! finished work. Schema:
//!
//! ```text
//! versions(version_id TEXT PRIMARY KEY, created_at TEXT NOT NULL)
//! log(id INTEGER PRIMARY KEY, descriptor TEXT NOT NULL,
//!     is_finished INTEGER NOT NULL, is_running INTEGER NOT NULL, has_failed INTEGER NOT NULL)
//! ```
//!
//! Every mutation runs inside a single transaction, so a failure part-way
//! through leaves the previous state intact. The ledger has a single writer
//! (the orchestrator process); no locking beyond SQLite's own is attempted.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppResult;
use crate::experiment::{codec, ExperimentDescriptor};

/// Observable state of one descriptor in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No row exists for the descriptor
    NotLogged,
    /// Row exists, no run has started yet
    Queued,
    /// Run in progress, or interrupted
    Running,
    /// Last run finished
    Finished,
    /// Last run failed
    Failed,
}

/// Row selection for [`Ledger::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    /// Every row
    All,
    /// Rows marked running
    Running,
    /// Rows marked finished
    Finished,
    /// Rows not marked finished (queued, running, or failed)
    Incomplete,
    /// Rows marked failed
    Failed,
}

impl StatusFilter {
    fn clause(self) -> &'static str {
        match self {
            StatusFilter::All => "1=1",
            StatusFilter::Running => "is_running=1",
            StatusFilter::Finished => "is_finished=1",
            StatusFilter::Incomplete => "is_finished=0",
            StatusFilter::Failed => "has_failed=1",
        }
    }
}

/// A registered code version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Version tag
    pub version_id: String,
    /// RFC 3339 timestamp of first registration
    pub created_at: String,
}

/// Handle to the ledger database.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `path`.
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open a throwaway in-memory ledger.
    pub fn open_in_memory() -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS versions (
                version_id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS log (
                id INTEGER PRIMARY KEY,
                descriptor TEXT NOT NULL,
                is_finished INTEGER NOT NULL,
                is_running INTEGER NOT NULL,
                has_failed INTEGER NOT NULL
            );"#,
        )?;
        Ok(Self { conn })
    }

    /// Record a code version; re-registering keeps the original timestamp.
    pub fn register_version(&mut self, version: &str) -> AppResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO versions (version_id, created_at) VALUES (?1, ?2)",
            params![version, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// All registered versions, oldest first.
    pub fn versions(&self) -> AppResult<Vec<VersionRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version_id, created_at FROM versions ORDER BY created_at, version_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(VersionRecord {
                version_id: row.get(0)?,
                created_at: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Replace any rows for the descriptor's key with one fresh, unflagged row.
    pub fn upsert(&mut self, descriptor: &ExperimentDescriptor) -> AppResult<()> {
        let key = codec::encode(descriptor);
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM log WHERE descriptor = ?1", params![key])?;
        tx.execute(
            "INSERT INTO log (descriptor, is_finished, is_running, has_failed) VALUES (?1, 0, 0, 0)",
            params![key],
        )?;
        tx.commit()?;
        debug!("Ledger upsert {}", key);
        Ok(())
    }

    /// Mark the descriptor running; every other row stops being running.
    pub fn set_running(&mut self, descriptor: &ExperimentDescriptor) -> AppResult<()> {
        let key = codec::encode(descriptor);
        let tx = self.conn.transaction()?;
        tx.execute("UPDATE log SET is_running = 0 WHERE is_running = 1", [])?;
        tx.execute(
            "UPDATE log SET is_running = 1 WHERE descriptor = ?1",
            params![key],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Mark the descriptor finished (clears running and failed).
    pub fn set_finished(&mut self, descriptor: &ExperimentDescriptor) -> AppResult<()> {
        self.update_flags(descriptor, "is_finished = 1, is_running = 0, has_failed = 0")
    }

    /// Mark the descriptor failed (clears running and finished).
    pub fn set_failed(&mut self, descriptor: &ExperimentDescriptor) -> AppResult<()> {
        self.update_flags(descriptor, "has_failed = 1, is_running = 0, is_finished = 0")
    }

    /// Clear the running flag without recording an outcome.
    pub fn set_not_running(&mut self, descriptor: &ExperimentDescriptor) -> AppResult<()> {
        self.update_flags(descriptor, "is_running = 0")
    }

    fn update_flags(&mut self, descriptor: &ExperimentDescriptor, assignments: &str) -> AppResult<()> {
        let key = codec::encode(descriptor);
        let tx = self.conn.transaction()?;
        tx.execute(
            &format!("UPDATE log SET {} WHERE descriptor = ?1", assignments),
            params![key],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Current status of a descriptor.
    pub fn status(&self, descriptor: &ExperimentDescriptor) -> AppResult<RunStatus> {
        let key = codec::encode(descriptor);
        let flags: Option<(bool, bool, bool)> = self
            .conn
            .query_row(
                "SELECT is_finished, is_running, has_failed FROM log WHERE descriptor = ?1 ORDER BY id DESC LIMIT 1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(match flags {
            None => RunStatus::NotLogged,
            Some((_, true, _)) => RunStatus::Running,
            Some((_, _, true)) => RunStatus::Failed,
            Some((true, _, _)) => RunStatus::Finished,
            Some(_) => RunStatus::Queued,
        })
    }

    /// Descriptors matching `filter`, optionally restricted to one version, in insertion order.
    pub fn query(
        &self,
        filter: StatusFilter,
        version: Option<&str>,
    ) -> AppResult<Vec<ExperimentDescriptor>> {
        let prefix = version.map(|v| format!("{}{}", v, codec::DELIMITER));
        let sql = format!(
            "SELECT descriptor FROM log WHERE {} AND (?1 IS NULL OR substr(descriptor, 1, length(?1)) = ?1) ORDER BY id",
            filter.clause()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut descriptors = Vec::with_capacity(keys.len());
        for key in keys {
            descriptors.push(codec::decode(&key)?);
        }
        Ok(descriptors)
    }

    /// Number of rows stored under the descriptor's key.
    pub fn row_count(&self, descriptor: &ExperimentDescriptor) -> AppResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM log WHERE descriptor = ?1",
            params![codec::encode(descriptor)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete ledger rows, optionally only those of one version. Returns rows removed.
    pub fn purge(&mut self, version: Option<&str>) -> AppResult<usize> {
        let prefix = version.map(|v| format!("{}{}", v, codec::DELIMITER));
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM log WHERE ?1 IS NULL OR substr(descriptor, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}
