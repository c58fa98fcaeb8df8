//! Worker pools and task executors
//!
//! Each concurrent join cursor owns a [`WorkerPool`]: a fixed set of named OS
//! threads pulling tasks from a shared channel receiver. The pool is created
//! when the cursor starts and force-shut-down when it closes; tasks still
//! queued at that point are dropped without running.
//!
//! A worker blocked inside a remote call cannot be interrupted. It notices the
//! shutdown once the call returns, and its result is released by the cursor.
//!
//! [`TaskExecutor`] is the hosting runtime's seam for the rank join pipeline;
//! [`ThreadPerTaskExecutor`] is the standalone implementation.

use crate::error::{FederationError, Result};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes units of work, supplied by the hosting runtime
pub trait TaskExecutor: Send + Sync {
    /// Schedule a task; `Err` if the executor no longer accepts work
    fn execute(&self, task: Task) -> Result<()>;
}

/// Run `f`, converting a panic into `FederationError::Internal`
///
/// Tasks use this so their completion bookkeeping runs even when the work
/// itself panics.
pub fn run_guarded<T>(what: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(task = what, panic = %msg, "task panicked");
            Err(FederationError::Internal(format!("{} panicked: {}", what, msg)))
        }
    }
}

struct PoolShared {
    /// Shared receiver; each idle worker locks it to take the next task
    receiver: Mutex<mpsc::Receiver<Task>>,
    shutdown: AtomicBool,
    live: Mutex<usize>,
    terminated: Condvar,
}

/// Fixed-size pool of named worker threads
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    shared: Arc<PoolShared>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `workers` threads named `<name>-<n>`
    pub fn new(name: impl Into<String>, workers: usize) -> Result<Self> {
        let name = name.into();
        let size = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Task>();
        let shared = Arc::new(PoolShared {
            receiver: Mutex::new(receiver),
            shutdown: AtomicBool::new(false),
            live: Mutex::new(0),
            terminated: Condvar::new(),
        });
        let pool = Self {
            name,
            sender: Mutex::new(Some(sender)),
            shared,
            size,
        };

        for idx in 0..size {
            let shared = Arc::clone(&pool.shared);
            *pool.shared.live.lock() += 1;
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", pool.name, idx))
                .spawn(move || worker_loop(shared));
            if let Err(e) = spawned {
                *pool.shared.live.lock() -= 1;
                pool.shutdown_now();
                return Err(FederationError::WorkerSpawn(e));
            }
        }

        tracing::trace!(pool = %pool.name, workers = size, "worker pool started");
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a task; it runs inside the caller's current tracing span
    pub fn submit(&self, task: Task) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(FederationError::Cancelled);
        }
        let span = tracing::Span::current();
        let wrapped: Task = Box::new(move || span.in_scope(task));
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(wrapped).map_err(|_| FederationError::Cancelled),
            None => Err(FederationError::Cancelled),
        }
    }

    /// Stop accepting work; queued tasks still run
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Stop accepting work and drop queued tasks without running them
    pub fn shutdown_now(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if self.sender.lock().take().is_some() {
            tracing::trace!(pool = %self.name, "worker pool shut down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Number of worker threads that have not exited yet
    pub fn live_workers(&self) -> usize {
        *self.shared.live.lock()
    }

    /// Wait until every worker has exited, `false` on timeout
    ///
    /// Only meaningful after `shutdown`/`shutdown_now`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = self.shared.live.lock();
        while *live > 0 {
            if self
                .shared
                .terminated
                .wait_until(&mut live, deadline)
                .timed_out()
            {
                return *live == 0;
            }
        }
        true
    }
}

impl TaskExecutor for WorkerPool {
    fn execute(&self, task: Task) -> Result<()> {
        self.submit(task)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let next = {
            let receiver = shared.receiver.lock();
            receiver.recv()
        };
        match next {
            Ok(task) => {
                if shared.shutdown.load(Ordering::Acquire) {
                    // force shutdown: discard queued work
                    drop(task);
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!("worker task panicked");
                }
            }
            Err(mpsc::RecvError) => break,
        }
    }

    let mut live = shared.live.lock();
    *live -= 1;
    if *live == 0 {
        shared.terminated.notify_all();
    }
}

/// Executor spawning a dedicated thread per task (rank join branches)
pub struct ThreadPerTaskExecutor {
    name_prefix: String,
    spawned: AtomicUsize,
}

impl ThreadPerTaskExecutor {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Tasks spawned so far
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl TaskExecutor for ThreadPerTaskExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let span = tracing::Span::current();
        std::thread::Builder::new()
            .name(format!("{}-{}", self.name_prefix, n))
            .spawn(move || span.in_scope(task))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_pool_runs_tasks() {
        let pool = WorkerPool::new("test-pool", 4).unwrap();
        let (tx, rx) = channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.submit(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let mut got: Vec<i32> = (0..16).map(|_| rx.recv().unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..16).collect::<Vec<_>>());

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(pool.live_workers(), 0);
    }

    #[test]
    fn test_shutdown_now_discards_queued() {
        let pool = WorkerPool::new("test-pool", 1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = channel();

        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(100));
        }))
        .unwrap();
        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            pool.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        started_rx.recv().unwrap();
        pool.shutdown_now();
        assert!(pool.submit(Box::new(|| {})).is_err());
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        let pool = WorkerPool::new("test-pool", 1).unwrap();
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = channel();
        pool.submit(Box::new(move || tx.send(1).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }

    #[test]
    fn test_run_guarded_converts_panic() {
        let result: Result<()> = run_guarded("panicking task", || panic!("bad"));
        assert!(matches!(result, Err(FederationError::Internal(msg)) if msg.contains("bad")));
    }

    #[test]
    fn test_thread_per_task() {
        let exec = ThreadPerTaskExecutor::new("branch");
        let (tx, rx) = channel();
        for i in 0..3 {
            let tx = tx.clone();
            exec.execute(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let mut got: Vec<i32> = (0..3).map(|_| rx.recv().unwrap()).collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(exec.spawned(), 3);
    }
}
