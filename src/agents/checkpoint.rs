//! Background snapshot writer.
//!
//! Each orchestrator owns one `Checkpointer`. Snapshot requests are queued to
//! a task that saves them strictly in order, so a save never overlaps or
//! overtakes an earlier one for the same agent, while the loop goes on with
//! its next model call. Failures are logged; the next request retries.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::state::{AgentState, SessionIndex, StateStore};

const QUEUE_DEPTH: usize = 8;

struct Request {
    state: AgentState,
    done: Option<oneshot::Sender<bool>>,
}

pub struct Checkpointer {
    tx: mpsc::Sender<Request>,
    task: JoinHandle<()>,
}

impl Checkpointer {
    pub fn spawn(store: Arc<dyn StateStore>, sessions: Option<SessionIndex>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Request>(QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let saved = match store.save(&request.state).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(
                            agent = %request.state.id,
                            "Failed to save agent state: {}",
                            e
                        );
                        false
                    }
                };
                if let Some(sessions) = &sessions {
                    if let Err(e) = sessions.record(&request.state).await {
                        tracing::warn!(
                            agent = %request.state.id,
                            "Failed to update session index: {}",
                            e
                        );
                    }
                }
                if let Some(done) = request.done {
                    let _ = done.send(saved);
                }
            }
        });
        Self { tx, task }
    }

    /// Queue a snapshot without waiting for it to be written.
    pub async fn request(&self, state: AgentState) {
        if self.tx.send(Request { state, done: None }).await.is_err() {
            tracing::error!("Checkpoint writer has stopped; snapshot dropped");
        }
    }

    /// Queue a snapshot and wait until it (and everything before it) is
    /// written. Returns whether the save succeeded.
    pub async fn flush(&self, state: AgentState) -> bool {
        let (done, wait) = oneshot::channel();
        let request = Request {
            state,
            done: Some(done),
        };
        if self.tx.send(request).await.is_err() {
            tracing::error!("Checkpoint writer has stopped; final snapshot dropped");
            return false;
        }
        wait.await.unwrap_or(false)
    }

    /// Stop accepting requests and wait for queued ones.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            tracing::error!("Checkpoint writer panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::state::{FileStateStore, PersistenceError};

    struct FailingStore {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for FailingStore {
        async fn save(&self, _state: &AgentState) -> Result<(), PersistenceError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::NotFound("disk gone".into()))
        }

        async fn load(&self, id: &str) -> Result<AgentState, PersistenceError> {
            Err(PersistenceError::NotFound(id.to_string()))
        }

        async fn delete(&self, _id: &str) -> Result<bool, PersistenceError> {
            Ok(false)
        }

        async fn list(&self) -> Result<Vec<String>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_saves_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path().join("agents")));
        let sessions = SessionIndex::new(dir.path().join("sessions"));
        let checkpointer = Checkpointer::spawn(store.clone(), Some(sessions.clone()));

        let mut state = AgentState::new("ordered", "t");
        for n in 0..5 {
            state.idle_loops = n;
            checkpointer.request(state.clone()).await;
        }
        state.idle_loops = 99;
        assert!(checkpointer.flush(state).await);
        checkpointer.close().await;

        assert_eq!(store.load("ordered").await.unwrap().idle_loops, 99);
        assert_eq!(sessions.get("ordered").await.unwrap().task, "t");
    }

    #[tokio::test]
    async fn test_failures_are_not_fatal() {
        let store = Arc::new(FailingStore {
            attempts: AtomicUsize::new(0),
        });
        let checkpointer = Checkpointer::spawn(store.clone(), None);
        checkpointer.request(AgentState::new("a", "t")).await;
        assert!(!checkpointer.flush(AgentState::new("a", "t")).await);
        checkpointer.close().await;
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    }
}
