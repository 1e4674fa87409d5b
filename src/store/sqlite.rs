use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{Checkpoint, CheckpointStore};
use crate::errors::StoreError;
use crate::models::{InterruptKind, StepId};

/// Async-safe handle to the checkpoint database.
///
/// Wraps `CheckpointDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<CheckpointDb>>,
}

impl SqliteStore {
    pub fn new(db: CheckpointDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory {}", parent.display()))?;
        }
        Ok(Self::new(CheckpointDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(CheckpointDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&CheckpointDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("DB task panicked: {}", e)))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn append(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        self.call(move |db| db.append(&checkpoint)).await
    }

    async fn latest(&self, session_id: &str) -> Result<Checkpoint, StoreError> {
        let id = session_id.to_string();
        self.call(move |db| {
            db.latest(&id)?
                .ok_or_else(|| StoreError::SessionNotFound(id.clone()))
        })
        .await
    }

    async fn history(&self, session_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let id = session_id.to_string();
        self.call(move |db| {
            let rows = db.history(&id)?;
            if rows.is_empty() {
                return Err(StoreError::SessionNotFound(id.clone()));
            }
            Ok(rows)
        })
        .await
    }
}

pub struct CheckpointDb {
    conn: Connection,
}

const CHECKPOINT_COLUMNS: &str =
    "session_id, sequence_no, created_at, current_step, pending_interrupt, state_json";

impl CheckpointDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .context("Failed to enable WAL journal")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS checkpoints (
                    session_id TEXT NOT NULL,
                    sequence_no INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    current_step TEXT NOT NULL,
                    pending_interrupt TEXT,
                    state_json TEXT NOT NULL,
                    PRIMARY KEY (session_id, sequence_no)
                );
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    /// Insert `cp` only if it directly follows the session's latest checkpoint.
    ///
    /// The sequence check and the insert are a single statement, so two
    /// connections racing on the same session cannot both succeed.
    pub fn append(&self, cp: &Checkpoint) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(&cp.state)
            .context("Failed to serialize workflow state")?;
        let inserted = self.conn.execute(
            "INSERT INTO checkpoints (session_id, sequence_no, created_at, current_step, pending_interrupt, state_json)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6
             WHERE (SELECT COALESCE(MAX(sequence_no), 0) FROM checkpoints WHERE session_id = ?1) = ?2 - 1",
            params![
                cp.session_id,
                cp.sequence as i64,
                cp.timestamp.to_rfc3339(),
                cp.current_step.as_str(),
                cp.pending_interrupt.map(|k| k.as_str()),
                state_json,
            ],
        );

        match inserted {
            Ok(1) => Ok(()),
            Ok(_) => Err(StoreError::SequenceConflict {
                session_id: cp.session_id.clone(),
                sequence: cp.sequence,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::SequenceConflict {
                    session_id: cp.session_id.clone(),
                    sequence: cp.sequence,
                })
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context("Failed to insert checkpoint")
                .into()),
        }
    }

    pub fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let sql = format!(
            "SELECT {} FROM checkpoints WHERE session_id = ?1 ORDER BY sequence_no DESC LIMIT 1",
            CHECKPOINT_COLUMNS
        );
        let raw = self
            .conn
            .query_row(&sql, params![session_id], RawCheckpoint::from_row)
            .optional()
            .context("Failed to query latest checkpoint")?;
        raw.map(RawCheckpoint::decode).transpose()
    }

    pub fn history(&self, session_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let sql = format!(
            "SELECT {} FROM checkpoints WHERE session_id = ?1 ORDER BY sequence_no ASC",
            CHECKPOINT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare history query")?;
        let rows = stmt
            .query_map(params![session_id], RawCheckpoint::from_row)
            .context("Failed to query checkpoint history")?;

        let mut out = Vec::new();
        for row in rows {
            let raw = row.context("Failed to read checkpoint row")?;
            out.push(raw.decode()?);
        }
        Ok(out)
    }
}

/// Column values as stored, before parsing.
struct RawCheckpoint {
    session_id: String,
    sequence_no: i64,
    created_at: String,
    current_step: String,
    pending_interrupt: Option<String>,
    state_json: String,
}

impl RawCheckpoint {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            sequence_no: row.get(1)?,
            created_at: row.get(2)?,
            current_step: row.get(3)?,
            pending_interrupt: row.get(4)?,
            state_json: row.get(5)?,
        })
    }

    fn decode(self) -> Result<Checkpoint, StoreError> {
        let corrupt = |what: &str, detail: String| {
            StoreError::Unavailable(format!(
                "Corrupt checkpoint {}#{}: {} ({})",
                self.session_id, self.sequence_no, what, detail
            ))
        };

        let timestamp = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt("timestamp", e.to_string()))?
            .with_timezone(&Utc);
        let current_step =
            StepId::from_str(&self.current_step).map_err(|e| corrupt("current_step", e))?;
        let pending_interrupt = self
            .pending_interrupt
            .as_deref()
            .map(InterruptKind::from_str)
            .transpose()
            .map_err(|e| corrupt("pending_interrupt", e))?;
        let state = serde_json::from_str(&self.state_json)
            .map_err(|e| corrupt("state_json", e.to_string()))?;

        Ok(Checkpoint {
            session_id: self.session_id,
            sequence: self.sequence_no as u64,
            timestamp,
            current_step,
            pending_interrupt,
            state,
        })
    }
}
