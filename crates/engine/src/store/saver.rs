//! Background chunk-save worker.
//!
//! A single OS thread waits on a condvar for queued keys and writes up to
//! `batch_size` of them per wake-up. [`SaveQueue::drain`] lets any caller
//! finish the queue synchronously.
//!
//! A failed write is retried with exponential backoff, up to
//! [`MAX_SAVE_ATTEMPTS`] tries. Evicted chunks keep their handle in the
//! queue until then so the edit survives a transient disk fault.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::StoreShared;
use crate::world::ChunkHandle;
use crate::world::chunk::ChunkKey;

pub(crate) const MAX_SAVE_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(100);

/// One unit of work. Evicted chunks travel with their handle because the
/// cache no longer holds them.
pub(crate) struct SaveJob {
    pub key: ChunkKey,
    pub orphan: Option<ChunkHandle>,
    /// Failed writes so far.
    pub attempts: u32,
}

impl SaveJob {
    pub fn new(key: ChunkKey, orphan: Option<ChunkHandle>) -> Self {
        Self { key, orphan, attempts: 0 }
    }
}

pub(crate) enum SaveResult {
    Saved,
    /// Nothing to write: no disk tier, or the entry is gone or already clean.
    Skipped,
    Failed(SaveJob),
}

fn backoff(attempts: u32) -> Duration {
    RETRY_BASE * 2u32.pow(attempts.saturating_sub(1).min(6))
}

#[derive(Default)]
struct QueueState {
    keys: VecDeque<ChunkKey>,
    queued: HashSet<ChunkKey>,
    orphans: HashMap<ChunkKey, ChunkHandle>,
    attempts: HashMap<ChunkKey, u32>,
    retries: Vec<(Instant, SaveJob)>,
    busy: bool,
    stop: bool,
}

impl QueueState {
    fn take_batch(&mut self, max: usize) -> Vec<SaveJob> {
        let n = max.min(self.keys.len());
        let mut jobs = Vec::with_capacity(n);
        for key in self.keys.drain(..n) {
            self.queued.remove(&key);
            let orphan = self.orphans.remove(&key);
            let attempts = self.attempts.remove(&key).unwrap_or(0);
            jobs.push(SaveJob { key, orphan, attempts });
        }
        jobs
    }

    /// Move retries due by `now` (all of them with `force`) back to the queue.
    fn promote(&mut self, now: Instant, force: bool) {
        if self.retries.is_empty() {
            return;
        }
        let (due, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.retries).into_iter().partition(|(at, _)| force || *at <= now);
        self.retries = waiting;
        for (_, job) in due {
            if let Some(handle) = job.orphan {
                self.orphans.entry(job.key).or_insert(handle);
            }
            if self.queued.insert(job.key) {
                self.keys.push_back(job.key);
                self.attempts.insert(job.key, job.attempts);
            }
        }
    }

    fn next_retry(&self) -> Option<Instant> {
        self.retries.iter().map(|(at, _)| *at).min()
    }
}

#[derive(Default)]
pub(crate) struct SaveQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
    idle: Condvar,
}

impl SaveQueue {
    /// Queue a cache-resident key. Duplicate keys collapse into one save.
    pub fn push(&self, key: ChunkKey) {
        let mut st = self.state.lock().expect("save queue poisoned");
        if st.queued.insert(key) {
            st.keys.push_back(key);
        }
        self.wake.notify_one();
    }

    /// Queue an evicted chunk together with its handle.
    pub fn push_orphan(&self, key: ChunkKey, handle: ChunkHandle) {
        let mut st = self.state.lock().expect("save queue poisoned");
        st.orphans.insert(key, handle);
        if st.queued.insert(key) {
            st.keys.push_back(key);
        }
        self.wake.notify_one();
    }

    /// Schedule a failed job for another try, or give up after
    /// [`MAX_SAVE_ATTEMPTS`].
    pub fn retry(&self, mut job: SaveJob) {
        job.attempts += 1;
        if job.attempts >= MAX_SAVE_ATTEMPTS {
            if job.orphan.is_some() {
                tracing::error!("Giving up on evicted chunk {} after {} failed saves", job.key, job.attempts);
            } else {
                tracing::warn!("Chunk {} still unsaved after {} tries; left dirty for the next flush", job.key, job.attempts);
            }
            return;
        }
        let due = Instant::now() + backoff(job.attempts);
        let mut st = self.state.lock().expect("save queue poisoned");
        st.retries.push((due, job));
        self.wake.notify_one();
    }

    /// Queued keys plus retries waiting for their backoff.
    pub fn len(&self) -> usize {
        let st = self.state.lock().expect("save queue poisoned");
        st.keys.len() + st.retries.len()
    }

    /// Process every queued job on the calling thread, retries included
    /// regardless of backoff, then wait for the worker to finish whatever
    /// batch it holds. Jobs that fail here are rescheduled, not retried inline.
    pub fn drain(&self, shared: &StoreShared) -> usize {
        let mut saved = 0;
        let mut failed = Vec::new();
        self.state.lock().expect("save queue poisoned").promote(Instant::now(), true);
        loop {
            let jobs = {
                let mut st = self.state.lock().expect("save queue poisoned");
                while st.keys.is_empty() && st.busy {
                    st = self.idle.wait(st).expect("save queue poisoned");
                }
                if st.keys.is_empty() {
                    break;
                }
                st.take_batch(usize::MAX)
            };
            for job in jobs {
                match shared.save_job(job) {
                    SaveResult::Saved => saved += 1,
                    SaveResult::Skipped => {}
                    SaveResult::Failed(job) => failed.push(job),
                }
            }
        }
        for job in failed {
            self.retry(job);
        }
        saved
    }
}

pub(crate) struct SaveWorker {
    shared: Arc<StoreShared>,
    thread: Option<JoinHandle<()>>,
}

impl SaveWorker {
    pub fn spawn(shared: Arc<StoreShared>, batch_size: usize) -> std::io::Result<Self> {
        let worker_shared = Arc::clone(&shared);
        let batch_size = batch_size.max(1);
        let thread = std::thread::Builder::new()
            .name("chunk-save".into())
            .spawn(move || run(worker_shared, batch_size))?;
        Ok(Self { shared, thread: Some(thread) })
    }

    /// Stop after the queue is empty and join the thread.
    pub fn shutdown(&mut self) {
        {
            let mut st = self.shared.queue.state.lock().expect("save queue poisoned");
            st.stop = true;
            self.shared.queue.wake.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Chunk save worker panicked");
            }
        }
    }
}

impl Drop for SaveWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<StoreShared>, batch_size: usize) {
    tracing::info!("Chunk save worker started (batch size {})", batch_size);
    let queue = &shared.queue;
    loop {
        let jobs = {
            let mut st = queue.state.lock().expect("save queue poisoned");
            loop {
                st.promote(Instant::now(), false);
                if !st.keys.is_empty() || st.stop {
                    break;
                }
                st = match st.next_retry() {
                    Some(due) => {
                        let wait = due.saturating_duration_since(Instant::now());
                        queue.wake.wait_timeout(st, wait).expect("save queue poisoned").0
                    }
                    None => queue.wake.wait(st).expect("save queue poisoned"),
                };
            }
            if st.keys.is_empty() && st.stop {
                break;
            }
            st.busy = true;
            st.take_batch(batch_size)
        };

        let count = jobs.len();
        let started = Instant::now();
        let mut failed = Vec::new();
        for job in jobs {
            if let SaveResult::Failed(job) = shared.save_job(job) {
                failed.push(job);
            }
        }
        tracing::debug!("Saved {} chunks in {:?} ({} failed)", count - failed.len(), started.elapsed(), failed.len());
        for job in failed {
            queue.retry(job);
        }

        let mut st = queue.state.lock().expect("save queue poisoned");
        st.busy = false;
        queue.idle.notify_all();
    }
    tracing::info!("Chunk save worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::chunk::Lod;

    #[test]
    fn backoff_doubles_from_the_base() {
        assert_eq!(backoff(1), RETRY_BASE);
        assert_eq!(backoff(2), RETRY_BASE * 2);
        assert_eq!(backoff(4), RETRY_BASE * 8);
    }

    #[test]
    fn retries_wait_for_their_due_time_unless_forced() {
        let queue = SaveQueue::default();
        let key = ChunkKey::new(1, 2, Lod::High);
        queue.retry(SaveJob::new(key, None));
        assert_eq!(queue.len(), 1);

        let mut st = queue.state.lock().unwrap();
        st.promote(Instant::now(), false);
        assert!(st.keys.is_empty());
        st.promote(Instant::now() + Duration::from_secs(1), false);
        let jobs = st.take_batch(10);
        assert_eq!(jobs.len(), 1);
        assert_eq!((jobs[0].key, jobs[0].attempts), (key, 1));
    }

    #[test]
    fn retry_budget_is_bounded() {
        let queue = SaveQueue::default();
        let mut job = SaveJob::new(ChunkKey::new(0, 0, Lod::Low), None);
        job.attempts = MAX_SAVE_ATTEMPTS - 1;
        queue.retry(job);
        assert_eq!(queue.len(), 0);
    }
}
