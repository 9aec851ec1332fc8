//! SQLite-backed persistent state.
//!
//! One database file holds everything a run needs to resume after a crash:
//! the discovered media set, the in-flight task snapshot, the append-only
//! result log, session metadata and the last statistics. Values are stored
//! as JSON keyed by absolute path.

use crate::media::{ConversionTask, MediaRecord, ProcessingResult, ProcessingStatus, Statistics};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

const KEY_SESSION: &str = "current_session";
const KEY_DIR: &str = "processing_dir";
const KEY_UPDATED: &str = "last_update";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State store is read-only")]
    ReadOnly,

    #[error("No media record for {0}")]
    NotFound(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub processing_dir: PathBuf,
    pub last_update: Option<DateTime<Utc>>,
}

/// Row counts and session summary for `pixmill status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbInfo {
    pub path: Option<PathBuf>,
    pub readonly: bool,
    pub media_files: usize,
    pub pending_files: usize,
    pub pending_tasks: usize,
    pub results: usize,
    pub session: Option<SessionInfo>,
}

pub struct StateManager {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    readonly: bool,
}

impl StateManager {
    /// Open (or create) the store at `path`.
    ///
    /// A read-only store never creates the file or the schema, and every
    /// mutating call on it returns [`StoreError::ReadOnly`].
    pub fn open(path: &Path, readonly: bool) -> Result<Self, StoreError> {
        let conn = if readonly {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Self::initialize_schema(&conn)?;
            conn
        };
        debug!(path = %path.display(), readonly, "opened state store");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            readonly,
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            readonly: false,
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS media_files (
                path TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_media_files_status ON media_files(status);

            CREATE TABLE IF NOT EXISTS conversion_tasks (
                path TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS results (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stats (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn writable(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        if self.readonly {
            return Err(StoreError::ReadOnly);
        }
        Ok(self.lock())
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // --- session -------------------------------------------------------

    pub fn save_session(&self, session_id: &str, dir: &Path) -> Result<(), StoreError> {
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        put_meta(&tx, KEY_SESSION, session_id)?;
        put_meta(&tx, KEY_DIR, &dir.to_string_lossy())?;
        put_meta(&tx, KEY_UPDATED, &Utc::now().to_rfc3339())?;
        tx.commit()?;
        info!(session = session_id, dir = %dir.display(), "session saved");
        Ok(())
    }

    pub fn load_session(&self) -> Result<Option<SessionInfo>, StoreError> {
        let conn = self.lock();
        let Some(session_id) = get_meta(&conn, KEY_SESSION)? else {
            return Ok(None);
        };
        let processing_dir = get_meta(&conn, KEY_DIR)?.map(PathBuf::from).unwrap_or_default();
        let last_update = get_meta(&conn, KEY_UPDATED)?.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        });
        Ok(Some(SessionInfo {
            session_id,
            processing_dir,
            last_update,
        }))
    }

    /// Whether a previous run over `dir` left unfinished records behind.
    pub fn has_incomplete_session(&self, dir: &Path) -> Result<bool, StoreError> {
        let Some(session) = self.load_session()? else {
            return Ok(false);
        };
        if session.processing_dir != dir {
            return Ok(false);
        }
        let conn = self.lock();
        let incomplete: i64 = conn.query_row(
            "SELECT COUNT(*) FROM media_files WHERE status IN (?1, ?2)",
            params![
                ProcessingStatus::Pending.as_str(),
                ProcessingStatus::Scanning.as_str()
            ],
            |row| row.get(0),
        )?;
        Ok(incomplete > 0)
    }

    // --- media files ---------------------------------------------------

    /// Replace the whole media set.
    pub fn save_media_files(&self, records: &[MediaRecord]) -> Result<(), StoreError> {
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM media_files", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO media_files (path, status, value) VALUES (?1, ?2, ?3)")?;
            for record in records {
                stmt.execute(params![
                    record.path.to_string_lossy(),
                    record.status.as_str(),
                    serde_json::to_string(record)?
                ])?;
            }
        }
        touch(&tx)?;
        tx.commit()?;
        debug!(count = records.len(), "media set saved");
        Ok(())
    }

    /// Insert or overwrite `records`, leaving the rest of the set alone.
    pub fn upsert_media_files(&self, records: &[MediaRecord]) -> Result<(), StoreError> {
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO media_files (path, status, value) VALUES (?1, ?2, ?3)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.path.to_string_lossy(),
                    record.status.as_str(),
                    serde_json::to_string(record)?
                ])?;
            }
        }
        touch(&tx)?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_media_files(&self) -> Result<Vec<MediaRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT value FROM media_files ORDER BY path")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    pub fn update_media_file_status(
        &self,
        path: &Path,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        update_record(&tx, path, status, error)?;
        touch(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Records not yet picked up by a worker.
    pub fn get_pending_files(&self) -> Result<Vec<MediaRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT value FROM media_files WHERE status IN (?1, ?2) ORDER BY path")?;
        let rows = stmt.query_map(
            params![
                ProcessingStatus::Pending.as_str(),
                ProcessingStatus::Scanning.as_str()
            ],
            |row| row.get::<_, String>(0),
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    /// Return records left in Processing by an interrupted run to Pending.
    pub fn requeue_interrupted(&self) -> Result<usize, StoreError> {
        let interrupted: Vec<PathBuf> = self
            .load_media_files()?
            .into_iter()
            .filter(|r| r.status == ProcessingStatus::Processing)
            .map(|r| r.path)
            .collect();
        if interrupted.is_empty() {
            return Ok(0);
        }
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        for path in &interrupted {
            update_record(&tx, path, ProcessingStatus::Pending, None)?;
        }
        touch(&tx)?;
        tx.commit()?;
        info!(count = interrupted.len(), "re-queued interrupted files");
        Ok(interrupted.len())
    }

    // --- tasks ---------------------------------------------------------

    /// Replace the pending task snapshot.
    pub fn save_tasks(&self, tasks: &[ConversionTask]) -> Result<(), StoreError> {
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM conversion_tasks", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO conversion_tasks (path, value) VALUES (?1, ?2)")?;
            for task in tasks {
                stmt.execute(params![
                    task.source_path.to_string_lossy(),
                    serde_json::to_string(task)?
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Add or replace one task in the snapshot.
    pub fn save_task(&self, task: &ConversionTask) -> Result<(), StoreError> {
        let conn = self.writable()?;
        conn.execute(
            "INSERT OR REPLACE INTO conversion_tasks (path, value) VALUES (?1, ?2)",
            params![
                task.source_path.to_string_lossy(),
                serde_json::to_string(task)?
            ],
        )?;
        Ok(())
    }

    pub fn load_tasks(&self) -> Result<Vec<ConversionTask>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT value FROM conversion_tasks ORDER BY path")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(serde_json::from_str(&row?)?);
        }
        Ok(tasks)
    }

    pub fn remove_task(&self, path: &Path) -> Result<(), StoreError> {
        let conn = self.writable()?;
        conn.execute(
            "DELETE FROM conversion_tasks WHERE path = ?1",
            params![path.to_string_lossy()],
        )?;
        Ok(())
    }

    // --- results -------------------------------------------------------

    pub fn append_result(&self, result: &ProcessingResult) -> Result<(), StoreError> {
        let conn = self.writable()?;
        insert_result(&conn, result)?;
        Ok(())
    }

    pub fn save_results(&self, results: &[ProcessingResult]) -> Result<(), StoreError> {
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        for result in results {
            insert_result(&tx, result)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_results(&self) -> Result<Vec<ProcessingResult>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT value FROM results ORDER BY seq")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(serde_json::from_str(&row?)?);
        }
        Ok(results)
    }

    // --- statistics ----------------------------------------------------

    pub fn save_statistics(&self, stats: &Statistics) -> Result<(), StoreError> {
        let conn = self.writable()?;
        conn.execute(
            "INSERT OR REPLACE INTO stats (id, value) VALUES (1, ?1)",
            params![serde_json::to_string(stats)?],
        )?;
        Ok(())
    }

    pub fn load_statistics(&self) -> Result<Option<Statistics>, StoreError> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row("SELECT value FROM stats WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(value.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    // --- combined ------------------------------------------------------

    /// Record a file's final state in one transaction: status update, the
    /// result (if any) appended, and its task removed.
    pub fn commit_outcome(
        &self,
        path: &Path,
        status: ProcessingStatus,
        error: Option<&str>,
        result: Option<&ProcessingResult>,
    ) -> Result<(), StoreError> {
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        update_record(&tx, path, status, error)?;
        if let Some(result) = result {
            insert_result(&tx, result)?;
        }
        tx.execute(
            "DELETE FROM conversion_tasks WHERE path = ?1",
            params![path.to_string_lossy()],
        )?;
        touch(&tx)?;
        tx.commit()?;
        Ok(())
    }

    pub fn clear_session(&self) -> Result<(), StoreError> {
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM media_files;
             DELETE FROM conversion_tasks;
             DELETE FROM results;
             DELETE FROM metadata;
             DELETE FROM stats;",
        )?;
        tx.commit()?;
        info!("session cleared");
        Ok(())
    }

    pub fn db_info(&self) -> Result<DbInfo, StoreError> {
        let session = self.load_session()?;
        let conn = self.lock();
        let count = |sql: &str| -> Result<usize, StoreError> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };
        let media_files = count("SELECT COUNT(*) FROM media_files")?;
        let pending_tasks = count("SELECT COUNT(*) FROM conversion_tasks")?;
        let results = count("SELECT COUNT(*) FROM results")?;
        let pending_files: i64 = conn.query_row(
            "SELECT COUNT(*) FROM media_files WHERE status IN (?1, ?2)",
            params![
                ProcessingStatus::Pending.as_str(),
                ProcessingStatus::Scanning.as_str()
            ],
            |row| row.get(0),
        )?;
        Ok(DbInfo {
            path: self.path.clone(),
            readonly: self.readonly,
            media_files,
            pending_files: pending_files as usize,
            pending_tasks,
            results,
            session,
        })
    }
}

fn put_meta(tx: &Transaction<'_>, key: &str, value: &str) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn touch(tx: &Transaction<'_>) -> Result<(), StoreError> {
    put_meta(tx, KEY_UPDATED, &Utc::now().to_rfc3339())
}

fn insert_result(conn: &Connection, result: &ProcessingResult) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO results (path, value) VALUES (?1, ?2)",
        params![
            result.original_path.to_string_lossy(),
            serde_json::to_string(result)?
        ],
    )?;
    Ok(())
}

fn update_record(
    tx: &Transaction<'_>,
    path: &Path,
    status: ProcessingStatus,
    error: Option<&str>,
) -> Result<(), StoreError> {
    let key = path.to_string_lossy();
    let value: Option<String> = tx
        .query_row(
            "SELECT value FROM media_files WHERE path = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    let Some(value) = value else {
        return Err(StoreError::NotFound(path.to_path_buf()));
    };
    let mut record: MediaRecord = serde_json::from_str(&value)?;
    record.error_message = error.map(str::to_string);
    record.set_status(status);
    tx.execute(
        "UPDATE media_files SET status = ?2, value = ?3 WHERE path = ?1",
        params![key, status.as_str(), serde_json::to_string(&record)?],
    )?;
    Ok(())
}
