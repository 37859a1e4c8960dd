//! Worker Pool
//!
//! Fixed set of OS threads running codec jobs off a shared queue. A job
//! that panics takes its worker down with it; the pool spawns a
//! replacement before the failure is reported, so capacity never shrinks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::{DashMap, DashSet};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use super::job::{Job, JobOutput};
use crate::error::{Error, Result};
use crate::metrics::METRICS;

// =============================================================================
// Configuration
// =============================================================================

/// Decides, per job, whether the worker running it should crash
pub type FaultInjector = Arc<dyn Fn(&Job) -> bool + Send + Sync>;

/// Configuration for the worker pool
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub workers: usize,

    /// Jobs allowed to wait in the queue before `submit` blocks
    pub queue_capacity: usize,

    /// Test hook for crash handling
    pub fault_injector: Option<FaultInjector>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            workers,
            queue_capacity: workers * 2,
            fault_injector: None,
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("fault_injector", &self.fault_injector.is_some())
            .finish()
    }
}

// =============================================================================
// Task Tracking
// =============================================================================

/// Lifecycle of a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Done,
}

struct Envelope {
    task_id: u64,
    job: Job,
    reply: oneshot::Sender<Result<JobOutput>>,
    permit: OwnedSemaphorePermit,
}

struct Shared {
    receiver: Receiver<Envelope>,
    states: DashMap<u64, TaskState>,
    cancelled: DashSet<u64>,
    fault_injector: Option<FaultInjector>,
    crashes: AtomicU64,
    live: AtomicUsize,
    spawned: AtomicUsize,
}

/// Pending result of a submitted job
pub struct TaskHandle {
    task_id: u64,
    rx: oneshot::Receiver<Result<JobOutput>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskHandle {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn state(&self) -> Option<TaskState> {
        self.shared.states.get(&self.task_id).map(|s| *s)
    }

    /// Wait for the job's result
    pub async fn join(mut self) -> Result<JobOutput> {
        let outcome = (&mut self.rx).await;
        outcome.map_err(|_| {
            Error::Internal(format!("task {} dropped without a result", self.task_id))
        })?
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.shared.forget(self.task_id);
    }
}

impl Shared {
    /// Drop all tracking for a task nobody can observe any more
    fn forget(&self, task_id: u64) {
        self.states.remove(&task_id);
        self.cancelled.remove(&task_id);
    }

    /// Hand a result to the task's handle; if the handle is gone the task's
    /// tracking goes with it
    fn deliver(
        &self,
        task_id: u64,
        reply: oneshot::Sender<Result<JobOutput>>,
        result: Result<JobOutput>,
    ) {
        if reply.send(result).is_err() {
            debug!(task_id, "Task handle dropped before the result arrived");
            self.forget(task_id);
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Handle to the running pool. Dropping it closes the queue and lets the
/// workers drain and exit.
pub struct WorkerPool {
    sender: Sender<Envelope>,
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    next_task_id: AtomicU64,
    workers: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("live", &self.live_workers())
            .field("crashes", &self.crashes())
            .field("queued", &self.queued())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }
        if config.queue_capacity == 0 {
            return Err(Error::Config("worker queue capacity must be positive".into()));
        }

        let (sender, receiver) = channel::unbounded();
        let shared = Arc::new(Shared {
            receiver,
            states: DashMap::new(),
            cancelled: DashSet::new(),
            fault_injector: config.fault_injector.clone(),
            crashes: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
        });

        for _ in 0..config.workers {
            spawn_worker(shared.clone())?;
        }
        debug!(workers = config.workers, queue = config.queue_capacity, "Worker pool started");

        Ok(Self {
            sender,
            shared,
            permits: Arc::new(Semaphore::new(config.queue_capacity)),
            next_task_id: AtomicU64::new(1),
            workers: config.workers,
        })
    }

    /// Queue a job, waiting while the queue is full
    pub async fn submit(&self, job: Job) -> Result<TaskHandle> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("worker pool closed".into()))?;

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.shared.states.insert(task_id, TaskState::Queued);

        let envelope = Envelope {
            task_id,
            job,
            reply,
            permit,
        };
        if self.sender.send(envelope).is_err() {
            self.shared.states.remove(&task_id);
            return Err(Error::Internal("worker pool has no workers".into()));
        }

        Ok(TaskHandle {
            task_id,
            rx,
            shared: self.shared.clone(),
        })
    }

    /// Queue a job and deliver its result to `callback`
    pub async fn submit_with<F>(&self, job: Job, callback: F) -> Result<u64>
    where
        F: FnOnce(Result<JobOutput>) + Send + 'static,
    {
        let handle = self.submit(job).await?;
        let task_id = handle.task_id();
        tokio::spawn(async move {
            callback(handle.join().await);
        });
        Ok(task_id)
    }

    /// Submit and wait
    pub async fn run(&self, job: Job) -> Result<JobOutput> {
        self.submit(job).await?.join().await
    }

    /// Cancel a task that has not finished. Returns false for unknown or
    /// finished tasks.
    pub fn cancel(&self, task_id: u64) -> bool {
        match self.shared.states.get(&task_id).map(|s| *s) {
            Some(TaskState::Queued) | Some(TaskState::Running) => {
                self.shared.cancelled.insert(task_id);
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, task_id: u64) -> Option<TaskState> {
        self.shared.states.get(&task_id).map(|s| *s)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Worker threads currently alive
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn crashes(&self) -> u64 {
        self.shared.crashes.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.sender.len()
    }
}

// =============================================================================
// Workers
// =============================================================================

struct LiveGuard(Arc<Shared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_worker(shared: Arc<Shared>) -> Result<()> {
    let n = shared.spawned.fetch_add(1, Ordering::Relaxed);
    shared.live.fetch_add(1, Ordering::SeqCst);
    let guard = LiveGuard(shared.clone());
    thread::Builder::new()
        .name(format!("raidmesh-worker-{n}"))
        .spawn(move || worker_loop(guard))
        .map(|_| ())
        .map_err(Error::Io)
}

fn worker_loop(guard: LiveGuard) {
    let shared = guard.0.clone();
    while let Ok(envelope) = shared.receiver.recv() {
        let Envelope {
            task_id,
            job,
            reply,
            permit,
        } = envelope;
        drop(permit);

        if shared.cancelled.remove(&task_id).is_some() {
            shared.states.insert(task_id, TaskState::Done);
            shared.deliver(task_id, reply, Err(Error::Cancelled(format!("task {task_id}"))));
            continue;
        }

        shared.states.insert(task_id, TaskState::Running);
        let kind = job.kind();
        METRICS.worker_jobs.with_label_values(&[kind]).inc();

        let injector = shared.fault_injector.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            if let Some(inject) = injector {
                if inject(&job) {
                    panic!("injected fault in {} job", job.kind());
                }
            }
            job.run()
        }));

        shared.states.insert(task_id, TaskState::Done);
        let cancelled = shared.cancelled.remove(&task_id).is_some();

        match outcome {
            Ok(result) => {
                let result = if cancelled {
                    Err(Error::Cancelled(format!("task {task_id}")))
                } else {
                    result
                };
                shared.deliver(task_id, reply, result);
            }
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                shared.crashes.fetch_add(1, Ordering::SeqCst);
                METRICS.worker_crashes.inc();
                warn!(task_id, kind, %reason, "Worker crashed, spawning replacement");
                if let Err(e) = spawn_worker(shared.clone()) {
                    error!(error = %e, "Failed to spawn replacement worker");
                }
                shared.deliver(task_id, reply, Err(Error::WorkerCrashed { task_id, reason }));
                return;
            }
        }
    }
    debug!("Worker queue closed, exiting");
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
