use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;

use super::{Checkpoint, CheckpointStore};
use crate::errors::StoreError;

/// File-per-session checkpoint log.
///
/// Each session lives in `<dir>/<session_id>.jsonl`, one serialized
/// checkpoint per line. A line only counts once its trailing newline is on
/// disk; a torn final line left by a crash is ignored by readers and cut off
/// by the next append.
///
/// Appends hold an exclusive lock on the session file from the sequence
/// check to the sync, so writers in different processes cannot both accept
/// the same sequence.
#[derive(Clone)]
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create session directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn session_file(&self, session_id: &str) -> Option<PathBuf> {
        let safe = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        safe.then(|| self.dir.join(format!("{}.jsonl", session_id)))
    }

    fn append_blocking(&self, cp: &Checkpoint) -> Result<(), StoreError> {
        let path = self
            .session_file(&cp.session_id)
            .ok_or_else(|| StoreError::Unavailable(format!("Invalid session id: {}", cp.session_id)))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .context("Failed to open session file")?;
        file.lock_exclusive()
            .context("Failed to lock session file")?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .context("Failed to read session file")?;
        let complete = complete_prefix(&bytes);
        let entries = parse_entries(complete, &path)?;

        let expected = entries.last().map_or(1, |last| last.sequence + 1);
        if cp.sequence != expected {
            return Err(StoreError::SequenceConflict {
                session_id: cp.session_id.clone(),
                sequence: cp.sequence,
            });
        }

        let mut line = serde_json::to_string(cp).context("Failed to serialize checkpoint")?;
        line.push('\n');

        // Drop any torn tail so the new line starts on a line boundary.
        let complete_len = complete.len() as u64;
        file.set_len(complete_len)
            .context("Failed to truncate torn checkpoint")?;
        file.seek(SeekFrom::Start(complete_len))
            .context("Failed to seek session file")?;

        file.write_all(line.as_bytes())
            .context("Failed to write checkpoint")?;
        file.sync_data().context("Failed to sync session file")?;
        // Dropping the handle releases the lock.
        Ok(())
    }
}

/// The bytes up to and including the last newline. Anything after it is an
/// incomplete write, possibly cut inside a multi-byte character.
fn complete_prefix(bytes: &[u8]) -> &[u8] {
    match bytes.iter().rposition(|b| *b == b'\n') {
        Some(pos) => &bytes[..=pos],
        None => &[],
    }
}

/// Parse every complete line of a session file. Missing file means no entries.
fn read_entries(path: &Path) -> Result<Vec<Checkpoint>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context("Failed to read session file")
                .into());
        }
    };
    parse_entries(complete_prefix(&bytes), path)
}

fn parse_entries(complete: &[u8], path: &Path) -> Result<Vec<Checkpoint>, StoreError> {
    let content = std::str::from_utf8(complete).map_err(|e| {
        StoreError::Unavailable(format!("Session file {} is not UTF-8: {}", path.display(), e))
    })?;

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(n, line)| {
            serde_json::from_str::<Checkpoint>(line).map_err(|e| {
                StoreError::Unavailable(format!(
                    "Corrupt checkpoint on line {} of {}: {}",
                    n + 1,
                    path.display(),
                    e
                ))
            })
        })
        .collect()
}

#[async_trait]
impl CheckpointStore for JsonlStore {
    async fn append(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.append_blocking(&checkpoint))
            .await
            .map_err(|e| StoreError::Unavailable(format!("Store task panicked: {}", e)))?
    }

    async fn latest(&self, session_id: &str) -> Result<Checkpoint, StoreError> {
        self.history(session_id)
            .await?
            .pop()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn history(&self, session_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let Some(path) = self.session_file(session_id) else {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        };
        let entries = tokio::task::spawn_blocking(move || read_entries(&path))
            .await
            .map_err(|e| StoreError::Unavailable(format!("Store task panicked: {}", e)))??;
        if entries.is_empty() {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(entries)
    }
}
