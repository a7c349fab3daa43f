//! Durable snapshots of [`AgentState`].
//!
//! `FileStateStore` keeps one `{id}_state.json` per agent under `data_dir`.
//! Writes go to a temp file that is renamed over the target, so readers see
//! either the previous snapshot or the new one. Saves through one store are
//! serialized by a mutex; an advisory lock on `.state.lock` keeps separate
//! processes sharing the directory from interleaving.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use super::AgentState;

pub const STATE_FORMAT_VERSION: u32 = 1;

const STATE_SUFFIX: &str = "_state.json";
const LOCK_FILE: &str = ".state.lock";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("State I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No saved state for agent {0}")]
    NotFound(String),

    #[error("Saved state for agent {id} is corrupt: {reason}")]
    CorruptState { id: String, reason: String },

    #[error("Invalid agent id '{0}'")]
    InvalidId(String),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Snapshot persistence for agent states.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &AgentState) -> Result<(), PersistenceError>;

    async fn load(&self, id: &str) -> Result<AgentState, PersistenceError>;

    /// Returns whether a snapshot existed.
    async fn delete(&self, id: &str) -> Result<bool, PersistenceError>;

    /// Ids with a saved snapshot, sorted.
    async fn list(&self) -> Result<Vec<String>, PersistenceError>;
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u32,
    state: &'a AgentState,
}

#[derive(Deserialize)]
struct Envelope {
    format_version: u32,
    state: AgentState,
}

/// Ids double as file names, so only a conservative alphabet is accepted.
pub(crate) fn validate_id(id: &str) -> Result<(), PersistenceError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PersistenceError::InvalidId(id.to_string()))
    }
}

#[derive(Clone)]
pub struct FileStateStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, STATE_SUFFIX))
    }

    fn open_lock(dir: &Path) -> Result<File, PersistenceError> {
        std::fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
        let path = dir.join(LOCK_FILE);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| PersistenceError::io(&path, e))
    }

    fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
        let lock = Self::open_lock(dir)?;
        FileExt::lock_exclusive(&lock)
            .map_err(|e| PersistenceError::io(&dir.join(LOCK_FILE), e))?;

        let tmp_path = path.with_extension("json.tmp");
        let result = (|| {
            let mut tmp =
                File::create(&tmp_path).map_err(|e| PersistenceError::io(&tmp_path, e))?;
            tmp.write_all(data)
                .and_then(|_| tmp.sync_all())
                .map_err(|e| PersistenceError::io(&tmp_path, e))?;
            std::fs::rename(&tmp_path, path).map_err(|e| PersistenceError::io(path, e))
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        let _ = FileExt::unlock(&lock);
        result
    }

    fn read_shared(dir: &Path, path: &Path) -> Result<Option<Vec<u8>>, PersistenceError> {
        let lock = Self::open_lock(dir)?;
        FileExt::lock_shared(&lock)
            .map_err(|e| PersistenceError::io(&dir.join(LOCK_FILE), e))?;
        let result = match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io(path, e)),
        };
        let _ = FileExt::unlock(&lock);
        result
    }

    fn decode(id: &str, bytes: &[u8]) -> Result<AgentState, PersistenceError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| PersistenceError::CorruptState {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if envelope.format_version != STATE_FORMAT_VERSION {
            return Err(PersistenceError::CorruptState {
                id: id.to_string(),
                reason: format!("unsupported format_version {}", envelope.format_version),
            });
        }
        if envelope.state.id != id {
            return Err(PersistenceError::CorruptState {
                id: id.to_string(),
                reason: format!("file holds state for '{}'", envelope.state.id),
            });
        }
        Ok(envelope.state)
    }
}

fn join_error(e: tokio::task::JoinError) -> PersistenceError {
    PersistenceError::Io {
        path: PathBuf::new(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, state: &AgentState) -> Result<(), PersistenceError> {
        validate_id(&state.id)?;
        let data = serde_json::to_vec_pretty(&EnvelopeRef {
            format_version: STATE_FORMAT_VERSION,
            state,
        })
        .map_err(|e| PersistenceError::io(&self.path_for(&state.id), e.into()))?;

        let _guard = self.write_lock.lock().await;
        let dir = self.dir.clone();
        let path = self.path_for(&state.id);
        tokio::task::spawn_blocking(move || Self::write_atomic(&dir, &path, &data))
            .await
            .map_err(join_error)??;
        tracing::debug!(agent = %state.id, steps = state.steps.len(), "Saved agent state");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<AgentState, PersistenceError> {
        validate_id(id)?;
        let dir = self.dir.clone();
        let path = self.path_for(id);
        let bytes = tokio::task::spawn_blocking(move || Self::read_shared(&dir, &path))
            .await
            .map_err(join_error)??
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        Self::decode(id, &bytes)
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        validate_id(id)?;
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersistenceError::io(&path, e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&self.dir, e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersistenceError::io(&self.dir, e))?
        {
            let name = entry.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(STATE_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
