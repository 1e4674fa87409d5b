//! Session state store: an append-only checkpoint log keyed by session id.
//!
//! Two backends implement [`CheckpointStore`]:
//!
//! | Backend  | Layout                                           |
//! |----------|--------------------------------------------------|
//! | `sqlite` | one `checkpoints` table, `(session_id, sequence_no)` primary key |
//! | `jsonl`  | one `<session_id>.jsonl` file per session, one checkpoint per line |
//!
//! Both enforce that an appended checkpoint directly follows the latest one
//! for its session, and both make a checkpoint visible to `latest` only once
//! it is completely written.

pub mod jsonl;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StoreBackend;
use crate::errors::StoreError;
use crate::models::{InterruptKind, StepId, WorkflowState};

pub use jsonl::JsonlStore;
pub use sqlite::SqliteStore;

/// Immutable snapshot of one session's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    /// Starts at 1 and increases by exactly 1 per append.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// The step that runs next when the session is advanced.
    pub current_step: StepId,
    #[serde(default)]
    pub pending_interrupt: Option<InterruptKind>,
    pub state: WorkflowState,
}

impl Checkpoint {
    /// First checkpoint of a new session.
    pub fn initial(state: WorkflowState, entry: StepId) -> Self {
        Self {
            session_id: state.session_id.clone(),
            sequence: 1,
            timestamp: state.created_at,
            current_step: entry,
            pending_interrupt: None,
            state,
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint`. Fails with `SequenceConflict` unless its sequence
    /// is exactly one past the session's latest (or 1 for a new session).
    async fn append(&self, checkpoint: Checkpoint) -> Result<(), StoreError>;

    /// The checkpoint with the highest sequence number for `session_id`.
    async fn latest(&self, session_id: &str) -> Result<Checkpoint, StoreError>;

    /// Every checkpoint for `session_id`, oldest first.
    async fn history(&self, session_id: &str) -> Result<Vec<Checkpoint>, StoreError>;
}

/// Open the configured backend at `path`.
pub fn open_store(backend: StoreBackend, path: &Path) -> Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(path)?),
        StoreBackend::Jsonl => Arc::new(JsonlStore::open(path)?),
    };
    tracing::debug!(backend = backend.as_str(), path = %path.display(), "opened checkpoint store");
    Ok(store)
}
