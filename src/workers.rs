use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::WorkerConfig;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    threads: usize,
    idle: usize,
    pending: usize,
}

struct PoolShared {
    name: String,
    min_threads: usize,
    idle_timeout: Duration,
    state: Mutex<PoolState>,
    drained: Condvar,
    spawned: AtomicUsize,
}

/// Runs lifecycle requests off the caller's thread. Grows up to `max_threads` while every
/// worker is busy and shrinks back to `min_threads` after `idle_timeout` without work.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    max_threads: usize,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
}

impl WorkerPool {
    pub fn new(name: &str, config: &WorkerConfig) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let pool = Self {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                min_threads: config.min_threads,
                idle_timeout: config.idle_timeout(),
                state: Mutex::new(PoolState::default()),
                drained: Condvar::new(),
                spawned: AtomicUsize::new(0),
            }),
            max_threads: config.max_threads.max(1),
            sender: Mutex::new(Some(sender)),
            receiver,
        };
        for _ in 0..config.min_threads.min(pool.max_threads) {
            pool.spawn_worker();
        }
        pool
    }

    /// Queues `job`. Returns `false` once the pool has been shut down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            tracing::warn!("[mrm] {}: rejecting work after shutdown", self.shared.name);
            return false;
        };
        let grow = {
            let mut state = self.shared.state.lock();
            state.pending += 1;
            state.idle < state.pending && state.threads < self.max_threads
        };
        if sender.send(Box::new(job)).is_err() {
            self.finish_job();
            return false;
        }
        if grow {
            self.spawn_worker();
        }
        true
    }

    /// Blocks until every queued job has finished or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            if self.shared.drained.wait_until(&mut state, deadline).timed_out() {
                return state.pending == 0;
            }
        }
        true
    }

    pub fn threads(&self) -> usize {
        self.shared.state.lock().threads
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending
    }

    /// Stops accepting work. Queued jobs still run.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    fn finish_job(&self) {
        finish_job(&self.shared);
    }

    fn spawn_worker(&self) {
        let shared = self.shared.clone();
        let receiver = self.receiver.clone();
        let number = shared.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        shared.state.lock().threads += 1;
        let spawned = thread::Builder::new()
            .name(format!("{} worker {number}", shared.name))
            .spawn({
                let shared = shared.clone();
                move || worker_loop(shared, receiver)
            });
        if let Err(err) = spawned {
            shared.state.lock().threads -= 1;
            tracing::error!("[mrm] {}: failed to spawn worker thread: {err}", shared.name);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn finish_job(shared: &PoolShared) {
    let mut state = shared.state.lock();
    state.pending = state.pending.saturating_sub(1);
    if state.pending == 0 {
        shared.drained.notify_all();
    }
}

fn worker_loop(shared: Arc<PoolShared>, receiver: Receiver<Job>) {
    loop {
        shared.state.lock().idle += 1;
        let next = receiver.recv_timeout(shared.idle_timeout);
        shared.state.lock().idle -= 1;
        match next {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("[mrm] {}: a queued job panicked", shared.name);
                }
                finish_job(&shared);
            }
            Err(RecvTimeoutError::Timeout) => {
                let mut state = shared.state.lock();
                if state.threads > shared.min_threads {
                    state.threads -= 1;
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                shared.state.lock().threads -= 1;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn config(min: usize, max: usize) -> WorkerConfig {
        WorkerConfig { min_threads: min, max_threads: max, idle_timeout_secs: 60 }
    }

    #[test]
    fn runs_every_queued_job() {
        let pool = WorkerPool::new("test", &config(2, 4));
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            assert!(pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert!(pool.threads() <= 4);
    }

    #[test]
    fn grows_when_all_workers_are_busy() {
        let pool = WorkerPool::new("grow", &config(0, 3));
        let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();
        for _ in 0..3 {
            let release_rx = release_rx.clone();
            pool.execute(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            });
        }
        assert_eq!(pool.threads(), 3);
        for _ in 0..3 {
            release_tx.send(()).expect("release worker");
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn panicking_job_does_not_poison_the_pool() {
        let pool = WorkerPool::new("panic", &config(1, 1));
        pool.execute(|| panic!("boom"));
        let done = Arc::new(AtomicU32::new(0));
        let flag = done.clone();
        pool.execute(move || {
            flag.store(1, Ordering::SeqCst);
        });
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_work_after_shutdown() {
        let pool = WorkerPool::new("closed", &config(1, 2));
        pool.shutdown();
        assert!(!pool.execute(|| {}));
        assert!(pool.wait_idle(Duration::from_millis(10)));
    }
}
