//! Embedded SQL queue backend.
//!
//! The reference backend: jobs and the dead-letter queue live in two SQLite
//! tables. Uses [`rusqlite`] for synchronous access, bridged to async via
//! [`tokio::task::spawn_blocking`]. Claiming selects the oldest queued row
//! and flips it to running in the same transaction.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{Connection, params};

use super::{DeadLetter, JobPayload, QueueBackend, QueueJob, new_job_id};
use crate::error::QueueError;

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// SQLite-backed queue storage.
///
/// Cloneable via `Arc<Mutex<Connection>>`; all blocking I/O is offloaded to
/// the tokio blocking thread pool.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueueBackend {
    /// Opens (or creates) a database at `path` and initializes the schema.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Opens an ephemeral in-memory database (data lost on drop).
    ///
    /// # Errors
    ///
    /// Fails when the schema cannot be applied.
    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Wraps an existing [`Connection`], applying pragmas and schema setup.
    ///
    /// # Errors
    ///
    /// Fails when the schema cannot be applied.
    pub fn from_connection(conn: Connection) -> Result<Self, QueueError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id       TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                status       TEXT NOT NULL,
                attempts     INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                last_error   TEXT,
                created_at   INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dlq (
                job_id       TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                error        TEXT NOT NULL,
                attempts     INTEGER NOT NULL,
                created_at   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status_created
            ON jobs (status, created_at);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bridges a synchronous closure onto the tokio blocking thread pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&Connection) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| QueueError::Backend(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| QueueError::Backend(format!("blocking task join: {e}")))?
    }

    /// Number of rows still in the active store, regardless of status.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be read.
    pub async fn active_count(&self) -> Result<usize, QueueError> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    /// All entries in the dead-letter queue, oldest first.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be read.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, payload_json, error, attempts FROM dlq ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut letters = Vec::new();
            for row in rows {
                let (job_id, payload_json, error, attempts) = row?;
                let payload: JobPayload = serde_json::from_str(&payload_json)
                    .map_err(|e| QueueError::Serialization(e.to_string()))?;
                letters.push(DeadLetter {
                    job_id,
                    payload,
                    error,
                    attempts: attempts as u32,
                });
            }
            Ok(letters)
        })
        .await
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn enqueue(
        &self,
        payload: &JobPayload,
        max_attempts: u32,
    ) -> Result<String, QueueError> {
        let job_id = new_job_id();
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let stored_id = job_id.clone();

        self.blocking(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO jobs (job_id, payload_json, status, attempts, max_attempts, last_error, created_at, updated_at)
                 VALUES (?1, ?2, 'queued', 0, ?3, NULL, ?4, ?4)",
                params![stored_id, payload_json, max_attempts, now],
            )?;
            Ok(())
        })
        .await?;

        Ok(job_id)
    }

    async fn claim_next(&self) -> Result<Option<QueueJob>, QueueError> {
        self.blocking(|conn| {
            let tx = conn.unchecked_transaction()?;

            let row = tx
                .query_row(
                    "SELECT job_id, payload_json, attempts, max_attempts
                     FROM jobs
                     WHERE status = 'queued'
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            let Some((job_id, payload_json, attempts, max_attempts)) = row else {
                tx.commit()?;
                return Ok(None);
            };

            tx.execute(
                "UPDATE jobs SET status = 'running', updated_at = ?1 WHERE job_id = ?2",
                params![now_millis(), job_id],
            )?;
            tx.commit()?;

            let payload: JobPayload = serde_json::from_str(&payload_json)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            Ok(Some(QueueJob {
                job_id,
                payload,
                attempts: attempts as u32,
                max_attempts: max_attempts as u32,
            }))
        })
        .await
    }

    async fn mark_done(&self, job_id: &str) -> Result<(), QueueError> {
        let job_id = job_id.to_owned();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, job: &QueueJob, error: &str) -> Result<(), QueueError> {
        let payload_json = serde_json::to_string(&job.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let job_id = job.job_id.clone();
        let attempts = job.attempts;
        let error = error.to_owned();

        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO dlq (job_id, payload_json, error, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_id, payload_json, error, attempts, now_millis()],
            )?;
            tx.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn requeue(&self, job: &QueueJob, error: &str) -> Result<(), QueueError> {
        let job_id = job.job_id.clone();
        let attempts = job.attempts;
        let error = error.to_owned();

        self.blocking(move |conn| {
            conn.execute(
                "UPDATE jobs
                 SET status = 'queued', attempts = ?1, last_error = ?2, updated_at = ?3
                 WHERE job_id = ?4",
                params![attempts, error, now_millis(), job_id],
            )?;
            Ok(())
        })
        .await
    }
}
