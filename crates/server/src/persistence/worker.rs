//! Async front for a blocking [`Persistence`] adapter.
//!
//! One tokio task owns the adapter and processes jobs in FIFO order, so calls
//! for the same player never overlap. Every call runs on the blocking pool
//! under a timeout; writes are retried with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{Persistence, PlayerId, PlayerPatch, PlayerState};
use crate::dashboard::Metrics;

const WRITE_ATTEMPTS: u32 = 3;
const FIRST_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkerError {
    #[error("persistence call timed out after {0:?}")]
    Timeout(Duration),
    #[error("persistence call failed: {0}")]
    Failed(String),
    #[error("persistence worker stopped")]
    Closed,
}

type Reply<T> = oneshot::Sender<Result<T, WorkerError>>;

enum Job {
    Authenticate { username: String, password: String, reply: Reply<Option<PlayerState>> },
    GetPlayer { player_id: PlayerId, reply: Reply<Option<PlayerState>> },
    SavePlayer { state: PlayerState, reply: Option<Reply<()>> },
    UpdatePlayer { player_id: PlayerId, patch: PlayerPatch },
    AppendEvent { game_id: String, player_id: PlayerId, kind: String, data: Value },
    /// Resolves once every earlier job has finished.
    Barrier { reply: oneshot::Sender<()> },
}

/// Cloneable submission side of the worker.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<Job>,
    metrics: Arc<Metrics>,
}

impl PersistenceHandle {
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<PlayerState>, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Authenticate { username: username.to_string(), password: password.to_string(), reply })
            .await?;
        rx.await.map_err(|_| WorkerError::Closed)?
    }

    pub async fn get_player(&self, player_id: PlayerId) -> Result<Option<PlayerState>, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::GetPlayer { player_id, reply }).await?;
        rx.await.map_err(|_| WorkerError::Closed)?
    }

    /// Queue a save without waiting. Never blocks; returns false if the queue
    /// is full or the worker is gone.
    pub fn save_player(&self, state: PlayerState) -> bool {
        self.try_submit(Job::SavePlayer { state, reply: None })
    }

    /// Save and wait for the outcome, retries included.
    pub async fn save_player_wait(&self, state: PlayerState) -> Result<(), WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::SavePlayer { state, reply: Some(reply) }).await?;
        rx.await.map_err(|_| WorkerError::Closed)?
    }

    pub fn update_player(&self, player_id: PlayerId, patch: PlayerPatch) -> bool {
        self.try_submit(Job::UpdatePlayer { player_id, patch })
    }

    pub fn append_event(&self, game_id: &str, player_id: PlayerId, kind: &str, data: Value) -> bool {
        self.try_submit(Job::AppendEvent {
            game_id: game_id.to_string(),
            player_id,
            kind: kind.to_string(),
            data,
        })
    }

    /// Wait until everything queued so far has been processed.
    pub async fn flush(&self) -> Result<(), WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Barrier { reply }).await?;
        rx.await.map_err(|_| WorkerError::Closed)
    }

    async fn submit(&self, job: Job) -> Result<(), WorkerError> {
        self.tx.send(job).await.map_err(|_| WorkerError::Closed)
    }

    fn try_submit(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Persistence queue full, dropping write");
                self.metrics.persistence_failure();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

pub struct PersistenceWorker {
    adapter: Arc<dyn Persistence>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl PersistenceWorker {
    /// Spawn the worker task. It stops once every handle is dropped.
    pub fn spawn(
        adapter: Arc<dyn Persistence>,
        timeout: Duration,
        capacity: usize,
        metrics: Arc<Metrics>,
    ) -> (PersistenceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = PersistenceWorker { adapter, timeout, metrics: Arc::clone(&metrics) };
        let task = tokio::spawn(worker.run(rx));
        (PersistenceHandle { tx, metrics }, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<Job>) {
        tracing::info!("Persistence worker started (timeout {:?})", self.timeout);
        while let Some(job) = rx.recv().await {
            match job {
                Job::Authenticate { username, password, reply } => {
                    let result = self.call(move |p| p.authenticate(&username, &password)).await;
                    if result.is_err() {
                        self.metrics.persistence_failure();
                    }
                    let _ = reply.send(result);
                }
                Job::GetPlayer { player_id, reply } => {
                    let result = self.call(move |p| p.get_player(player_id)).await;
                    if result.is_err() {
                        self.metrics.persistence_failure();
                    }
                    let _ = reply.send(result);
                }
                Job::SavePlayer { state, reply } => {
                    let state = Arc::new(state);
                    let what = format!("save of player {}", state.player_id);
                    let result = self.with_retry(&what, move |p| p.save_player(&state)).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Job::UpdatePlayer { player_id, patch } => {
                    let patch = Arc::new(patch);
                    let what = format!("update of player {}", player_id);
                    let _ = self.with_retry(&what, move |p| p.update_player(player_id, &patch)).await;
                }
                Job::AppendEvent { game_id, player_id, kind, data } => {
                    let what = format!("'{}' event for player {}", kind, player_id);
                    let job = Arc::new((game_id, kind, data));
                    let _ = self
                        .with_retry(&what, move |p| p.append_event(&job.0, player_id, &job.1, &job.2))
                        .await;
                }
                Job::Barrier { reply } => {
                    let _ = reply.send(());
                }
            }
        }
        tracing::info!("Persistence worker stopped");
    }

    async fn call<T, F>(&self, f: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Persistence) -> anyhow::Result<T> + Send + 'static,
    {
        let adapter = Arc::clone(&self.adapter);
        let task = tokio::task::spawn_blocking(move || f(adapter.as_ref()));
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(WorkerError::Timeout(self.timeout)),
            Ok(Err(join)) => Err(WorkerError::Failed(join.to_string())),
            Ok(Ok(Err(e))) => Err(WorkerError::Failed(format!("{:#}", e))),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    async fn with_retry<T, F>(&self, what: &str, f: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: Fn(&dyn Persistence) -> anyhow::Result<T> + Clone + Send + 'static,
    {
        let mut delay = FIRST_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.call(f.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    tracing::warn!("Persistence {} failed (attempt {}): {}", what, attempt, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Persistence {} failed after {} attempts: {}", what, attempt, e);
                    self.metrics.persistence_failure();
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use worldcore_engine::world::position::Vec3;

    fn spawn(store: Arc<dyn Persistence>, timeout_ms: u64) -> (PersistenceHandle, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let (handle, _task) =
            PersistenceWorker::spawn(store, Duration::from_millis(timeout_ms), 64, Arc::clone(&metrics));
        (handle, metrics)
    }

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let store = Arc::new(MemoryStore::new(true, Vec3::ZERO));
        let (handle, _) = spawn(store.clone(), 1000);
        let mut state = handle.authenticate("ann", "pw").await.unwrap().unwrap();
        state.gold = 7;
        assert!(handle.save_player(state.clone()));
        assert!(handle.update_player(state.player_id, PlayerPatch { level: Some(3), ..PlayerPatch::default() }));
        let loaded = handle.get_player(state.player_id).await.unwrap().unwrap();
        assert_eq!((loaded.gold, loaded.level), (7, 3));

        assert!(handle.append_event("g1", state.player_id, "login", Value::Null));
        handle.flush().await.unwrap();
        assert_eq!(store.events().len(), 1);
    }

    #[tokio::test]
    async fn failed_writes_retry_then_report() {
        let store = Arc::new(MemoryStore::new(true, Vec3::ZERO));
        let (handle, metrics) = spawn(store.clone(), 1000);
        let state = handle.authenticate("ann", "pw").await.unwrap().unwrap();
        store.set_failing(true);
        let err = handle.save_player_wait(state).await.unwrap_err();
        assert!(matches!(err, WorkerError::Failed(_)));
        assert_eq!(metrics.persistence_failures(), 1);
    }

    struct Stalled;

    impl Persistence for Stalled {
        fn authenticate(&self, _: &str, _: &str) -> anyhow::Result<Option<PlayerState>> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(None)
        }
        fn get_player(&self, _: PlayerId) -> anyhow::Result<Option<PlayerState>> {
            Ok(None)
        }
        fn save_player(&self, _: &PlayerState) -> anyhow::Result<()> {
            Ok(())
        }
        fn append_event(&self, _: &str, _: PlayerId, _: &str, _: &Value) -> anyhow::Result<()> {
            Ok(())
        }
        fn load_chunk(&self, _: i32, _: i32, _: u8) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn save_chunk(&self, _: i32, _: i32, _: u8, _: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_adapter_times_out() {
        let (handle, metrics) = spawn(Arc::new(Stalled), 50);
        let err = handle.authenticate("ann", "pw").await.unwrap_err();
        assert_eq!(err, WorkerError::Timeout(Duration::from_millis(50)));
        assert_eq!(metrics.persistence_failures(), 1);
    }
}
