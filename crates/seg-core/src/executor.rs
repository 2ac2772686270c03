//! Bounded worker pool with blocking futures and completion continuations
//!
//! All deferred I/O and lightweight compute in the pipeline is submitted
//! here. Two modes exist: a true pool of worker threads, and an inline mode
//! where `submit` executes the task synchronously on the calling thread and
//! returns an already-resolved handle. The inline mode gives deterministic,
//! single-threaded runs with the same call sites.
//!
//! # Safety
//!
//! Thread safety is ensured by:
//! - Owned task closures (no shared mutable state)
//! - Crossbeam channels for safe work distribution
//! - Explicit panic capture per task, re-raised at `wait()`
//! - Guaranteed shutdown: dropping the pool closes the injector channel and
//!   joins every worker, so pending submissions are flushed, never dropped

use crossbeam_channel::{unbounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;
type Continuation<T> = Box<dyn FnOnce(&T) + Send + 'static>;

/// Degree of parallelism for an [`ExecutorPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// Execute submissions synchronously on the calling thread
    Inline,
    /// Worker threads; `Threads(0)` means all logical cores
    Threads(usize),
}

struct TaskSlot<T> {
    value: Option<T>,
    panic_message: Option<String>,
    continuations: Vec<Continuation<T>>,
}

struct TaskShared<T> {
    slot: Mutex<TaskSlot<T>>,
    done: Condvar,
}

impl<T> TaskShared<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(TaskSlot {
                value: None,
                panic_message: None,
                continuations: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskSlot<T>> {
        // A task can only poison its own slot; the stored state stays usable.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, value: T) {
        let mut slot = self.lock();
        let continuations = std::mem::take(&mut slot.continuations);
        for continuation in continuations {
            continuation(&value);
        }
        slot.value = Some(value);
        drop(slot);
        self.done.notify_all();
    }

    fn fail(&self, message: String) {
        let mut slot = self.lock();
        slot.continuations.clear();
        slot.panic_message = Some(message);
        drop(slot);
        self.done.notify_all();
    }
}

/// Handle to a value produced by a submitted task
///
/// Obtained from [`ExecutorPool::submit`]. The handle can be waited on
/// (blocking) or given a continuation that runs once the value exists.
pub struct TaskHandle<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    fn pending() -> (Self, Arc<TaskShared<T>>) {
        let shared = Arc::new(TaskShared::new());
        (
            Self {
                shared: shared.clone(),
            },
            shared,
        )
    }

    /// Block the calling thread until the task completes, then take its value.
    ///
    /// # Panics
    ///
    /// Re-raises a panic that occurred inside the task.
    pub fn wait(self) -> T {
        let mut slot = self.shared.lock();
        loop {
            if let Some(message) = slot.panic_message.take() {
                panic!("executor task panicked: {message}");
            }
            if let Some(value) = slot.value.take() {
                return value;
            }
            slot = self
                .shared
                .done
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether the task has finished (successfully or by panic)
    #[must_use]
    pub fn is_done(&self) -> bool {
        let slot = self.shared.lock();
        slot.value.is_some() || slot.panic_message.is_some()
    }

    /// Register a continuation executed with a reference to the value once
    /// it is available.
    ///
    /// The continuation runs on the thread that completes the task (or
    /// immediately, if the task already finished). It must enqueue follow-up
    /// work instead of blocking; failures it wants observed belong in a task
    /// of their own. If the task panics, the continuation never runs.
    pub fn on_done<F>(&self, continuation: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mut slot = self.shared.lock();
        match slot.value.as_ref() {
            Some(value) => continuation(value),
            None if slot.panic_message.is_some() => {}
            None => slot.continuations.push(Box::new(continuation)),
        }
    }
}

struct PoolInner {
    tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
    threads: usize,
}

/// Bounded-parallelism task scheduler
///
/// One pool is shared across the whole run; heavy tensor compute stays on
/// the calling thread and is never split across these workers.
pub struct ExecutorPool {
    inner: Option<PoolInner>,
}

impl ExecutorPool {
    /// Create a pool with the given parallelism
    #[must_use]
    pub fn new(parallelism: Parallelism) -> Self {
        match parallelism {
            Parallelism::Inline => Self { inner: None },
            Parallelism::Threads(count) => {
                let threads = if count == 0 { num_cpus::get() } else { count };
                let (tx, rx) = unbounded::<Job>();
                let workers = (0..threads)
                    .map(|_| {
                        let rx = rx.clone();
                        thread::spawn(move || {
                            while let Ok(job) = rx.recv() {
                                job();
                            }
                        })
                    })
                    .collect();
                Self {
                    inner: Some(PoolInner {
                        tx: Some(tx),
                        workers,
                        threads,
                    }),
                }
            }
        }
    }

    /// Whether submissions actually run on worker threads
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.inner.is_some()
    }

    /// Number of worker threads (1 for the inline mode)
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.as_ref().map_or(1, |pool| pool.threads)
    }

    /// Submit a task, returning a handle to its eventual value
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (handle, shared) = TaskHandle::pending();
        let run = move || match catch_unwind(AssertUnwindSafe(task)) {
            Ok(value) => shared.complete(value),
            Err(payload) => shared.fail(panic_message(payload.as_ref())),
        };
        match &self.inner {
            Some(pool) => {
                let tx = pool.tx.as_ref().expect("executor sender lives until drop");
                tx.send(Box::new(run))
                    .expect("executor workers live until drop");
            }
            None => run(),
        }
        handle
    }

    /// Submit one task per item, preserving item order in the result
    pub fn map<A, T, F, I>(&self, task: F, items: I) -> Vec<TaskHandle<T>>
    where
        A: Send + 'static,
        T: Send + 'static,
        F: Fn(A) -> T + Send + Sync + 'static,
        I: IntoIterator<Item = A>,
    {
        let task = Arc::new(task);
        items
            .into_iter()
            .map(|item| {
                let task = task.clone();
                self.submit(move || task(item))
            })
            .collect()
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        if let Some(pool) = &mut self.inner {
            // Closing the channel lets workers drain the queue and exit.
            pool.tx.take();
            for worker in pool.workers.drain(..) {
                if worker.join().is_err() {
                    tracing::error!("executor worker panicked during shutdown");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
