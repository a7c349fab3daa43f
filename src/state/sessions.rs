//! Session metadata index under `sessions_dir`.
//!
//! One `{id}.json` file per session records when it was created, when it was
//! last active and how its latest run ended. The agent's full history lives
//! in the [`StateStore`](super::StateStore); this index only answers listing
//! and resume lookups cheaply.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::validate_id;
use super::{AgentState, AgentStatus, PersistenceError, TerminalReason};

/// Reserved session name that is never persisted.
pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub task: String,
    pub status: AgentStatus,
    pub steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl SessionMeta {
    fn from_state(state: &AgentState) -> Self {
        Self {
            id: state.id.clone(),
            task: state.task.clone(),
            status: state.status,
            steps: state.steps.len(),
            terminal_reason: state.terminal_reason,
            created_at: state.created_at,
            last_active: state.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionIndex {
    dir: PathBuf,
}

impl SessionIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A fresh random session id.
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Reject ids that cannot name a session.
    pub fn check_id(id: &str) -> Result<(), PersistenceError> {
        if id == DEFAULT_SESSION_ID {
            return Err(PersistenceError::InvalidId(format!(
                "{} (reserved)",
                DEFAULT_SESSION_ID
            )));
        }
        validate_id(id)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write (or refresh) the entry for `state`.
    pub async fn record(&self, state: &AgentState) -> Result<SessionMeta, PersistenceError> {
        Self::check_id(&state.id)?;
        let meta = SessionMeta::from_state(state);
        let path = self.path_for(&state.id);
        let io = |e: std::io::Error| PersistenceError::Io {
            path: path.clone(),
            source: e,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io)?;
        let data = serde_json::to_vec_pretty(&meta).map_err(|e| io(e.into()))?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, data).await.map_err(io)?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(io)?;
        Ok(meta)
    }

    pub async fn get(&self, id: &str) -> Result<SessionMeta, PersistenceError> {
        Self::check_id(id)?;
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(id.to_string()))
            }
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|e| PersistenceError::CorruptState {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn exists(&self, id: &str) -> bool {
        Self::check_id(id).is_ok()
            && tokio::fs::try_exists(self.path_for(id))
                .await
                .unwrap_or(false)
    }

    /// All readable sessions, most recently active first. Unreadable entries
    /// are logged and skipped.
    pub async fn list(&self) -> Result<Vec<SessionMeta>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| PersistenceError::Io {
                path: self.dir.clone(),
                source,
            })?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            let id = id.to_string();
            if id == DEFAULT_SESSION_ID {
                continue;
            }
            match self.get(&id).await {
                Ok(meta) => sessions.push(meta),
                Err(e) => tracing::warn!("Skipping session {}: {}", id, e),
            }
        }
        sessions.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(sessions)
    }

    pub async fn remove(&self, id: &str) -> Result<bool, PersistenceError> {
        Self::check_id(id)?;
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }
}
